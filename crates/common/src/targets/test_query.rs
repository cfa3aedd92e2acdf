use serde_json::json;

use super::{Query, TargetParseError};
use crate::state::SpecsMap;

fn specs(value: serde_json::Value) -> SpecsMap {
    value.as_object().cloned().unwrap_or_default()
}

macro_rules! hit {
    ($q:expr, $id:expr, $specs:expr) => {
        assert!(
            $q.parse::<Query>().unwrap().matches($id, Some(&$specs)),
            "expected `{}` to match {}",
            $q,
            $id
        );
    };
}

macro_rules! miss {
    ($q:expr, $id:expr, $specs:expr) => {
        assert!(
            !$q.parse::<Query>().unwrap().matches($id, Some(&$specs)),
            "expected `{}` to not match {}",
            $q,
            $id
        );
    };
}

macro_rules! err {
    ($s:expr, $pattern:pat $(if $guard:expr)?) => {
        assert!(match $s.parse::<Query>() {
            $pattern $(if $guard)? => true,
            other => {
                eprintln!("Received {other:?}");
                false
            }
        })
    };
}

#[test]
fn test_id_conditions() {
    let s = specs(json!({}));

    hit!("id == web-1", "web-1", s);
    hit!("id == web-1,web-2", "web-2", s);
    miss!("id == web-1,web-2", "db-1", s);

    hit!("id =~ web-*", "web-1", s);
    miss!("id =~ web-*", "db-1", s);

    hit!("id =~ /web-[0-9]+/", "web-12", s);
    miss!("id =~ /web-[0-9]+/", "web-x", s);
    // strict matching: the pattern must cover the whole id
    miss!("id =~ /web/", "web-1", s);
}

#[test]
fn test_spec_conditions() {
    let s = specs(json!({
        "os": "linux",
        "role": "webserver",
        "cpu": { "cores": 8 },
        "disks": ["sda", "sdb"],
    }));

    hit!("specs.os == linux", "web-1", s);
    miss!("specs.os == windows", "web-1", s);
    hit!("specs.cpu.cores == 8", "web-1", s);
    hit!("specs.role =~ web*", "web-1", s);
    miss!("specs.role =~ db*", "web-1", s);

    // non-scalar leaves never match
    miss!("specs.disks == sda", "web-1", s);
    miss!("specs.cpu =~ *", "web-1", s);
    // missing path never matches
    miss!("specs.missing.path == x", "web-1", s);
}

#[test]
fn test_groups() {
    let s = specs(json!({ "os": "linux", "role": "webserver" }));

    hit!("specs.os == linux and specs.role =~ web*", "web-1", s);
    miss!("specs.os == linux and specs.role == database", "web-1", s);
    hit!("specs.role == database or id == web-1", "web-1", s);
    miss!("specs.role == database or id == db-1", "web-1", s);
}

#[test]
fn test_agents_without_specs() {
    let q: Query = "specs.os == linux".parse().unwrap();
    assert!(!q.matches("web-1", None));

    let q: Query = "id =~ web-*".parse().unwrap();
    assert!(q.matches("web-1", None));
}

#[test]
fn test_parse_errors() {
    err!("", Err(TargetParseError::EmptyExpression));
    err!("   ", Err(TargetParseError::EmptyExpression));
    err!("os == linux", Err(TargetParseError::UnsupportedField(f)) if f == "os");
    err!("specs. == linux", Err(TargetParseError::UnsupportedField(_)));
    err!("id > 3", Err(TargetParseError::MissingOperator(_)));
    err!("id =~ /([/", Err(TargetParseError::InvalidRegex(..)));
    err!("id == ", Err(TargetParseError::EmptyExpression));
}

#[test]
fn test_keyword_needs_word_boundary() {
    // "or" inside a value must not split groups
    let s = specs(json!({ "role": "coordinator" }));
    hit!("specs.role == coordinator", "web-1", s);
}

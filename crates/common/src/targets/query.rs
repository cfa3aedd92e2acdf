use std::str::FromStr;

use crate::state::SpecsMap;

use super::{parse_id_list, IdMatcher, TargetParseError};

// Example query string representations:
//
//     id == web-1,web-2
//     specs.os == linux
//     specs.os == linux and specs.role =~ web*
//     specs.kernel.version =~ /6\..*/ or id == db-1

/// A disjunctive-normal-form target query: `or` splits groups, `and`
/// splits conditions within a group, each condition is `field OP
/// value` with OP one of `==` and `=~`.
#[derive(Debug, Clone)]
pub struct Query {
    groups: Vec<Vec<Condition>>,
}

#[derive(Debug, Clone)]
struct Condition {
    field: Field,
    matcher: ValueMatcher,
}

#[derive(Debug, Clone)]
enum Field {
    Id,
    /// Dot-path into the agent's specs map.
    Spec(Vec<String>),
}

#[derive(Debug, Clone)]
enum ValueMatcher {
    /// `==` against ids: comma-separated list semantics.
    IdList(Vec<String>),
    /// `==` against a spec leaf: string-form equality.
    Literal(String),
    /// `=~`: regex when the value is `/…/`, glob otherwise.
    Pattern(IdMatcher),
}

impl FromStr for Query {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TargetParseError::EmptyExpression);
        }

        let groups = split_keyword(s, "or")
            .into_iter()
            .map(|group| {
                split_keyword(group, "and")
                    .into_iter()
                    .map(Condition::parse)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Query { groups })
    }
}

impl Query {
    /// Whether an agent matches: any group where every condition holds.
    pub fn matches(&self, id: &str, specs: Option<&SpecsMap>) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|cond| cond.matches(id, specs)))
    }
}

impl Condition {
    fn parse(s: &str) -> Result<Self, TargetParseError> {
        let (field, op, value) = if let Some((field, value)) = s.split_once("==") {
            (field, "==", value)
        } else if let Some((field, value)) = s.split_once("=~") {
            (field, "=~", value)
        } else {
            return Err(TargetParseError::MissingOperator(s.trim().to_string()));
        };

        let field = field.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(TargetParseError::EmptyExpression);
        }

        let field = if field == "id" {
            Field::Id
        } else if let Some(path) = field.strip_prefix("specs.") {
            let path: Vec<String> = path.split('.').map(str::to_string).collect();
            if path.iter().any(String::is_empty) {
                return Err(TargetParseError::UnsupportedField(field.to_string()));
            }
            Field::Spec(path)
        } else {
            return Err(TargetParseError::UnsupportedField(field.to_string()));
        };

        let matcher = match (&field, op) {
            (Field::Id, "==") => ValueMatcher::IdList(
                parse_id_list(value)?
                    .into_iter()
                    .map(|id| id.to_string())
                    .collect(),
            ),
            (Field::Spec(_), "==") => ValueMatcher::Literal(value.to_string()),
            (_, _) => ValueMatcher::Pattern(IdMatcher::parse(value)?),
        };

        Ok(Condition { field, matcher })
    }

    fn matches(&self, id: &str, specs: Option<&SpecsMap>) -> bool {
        let leaf;
        let subject = match &self.field {
            Field::Id => id,
            Field::Spec(path) => {
                let Some(value) = specs.and_then(|s| spec_leaf(s, path)) else {
                    return false;
                };
                leaf = value;
                leaf.as_str()
            }
        };

        match &self.matcher {
            ValueMatcher::IdList(ids) => ids.iter().any(|i| i == subject),
            ValueMatcher::Literal(value) => value == subject,
            ValueMatcher::Pattern(matcher) => matcher.matches(subject),
        }
    }
}

/// Traverse a specs map by dot path. Only scalar leaves participate in
/// matching; arrays and nested maps at the leaf never match.
fn spec_leaf(specs: &SpecsMap, path: &[String]) -> Option<String> {
    let mut value = specs.get(path.first()?)?;
    for key in &path[1..] {
        value = value.as_object()?.get(key)?;
    }

    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Null => Some(String::new()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
    }
}

/// Split on a lowercase keyword appearing as its own
/// whitespace-delimited word, leaving the operands intact.
fn split_keyword<'a>(s: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;

    while let Some(found) = s[search..].find(keyword) {
        let at = search + found;
        let end = at + keyword.len();
        let before_ok = s[..at].chars().next_back().is_none_or(char::is_whitespace);
        let after_ok = s[end..].chars().next().is_none_or(char::is_whitespace);

        if before_ok && after_ok {
            parts.push(&s[start..at]);
            start = end;
        }
        search = end;
    }

    parts.push(&s[start..]);
    parts
}

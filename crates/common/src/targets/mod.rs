use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wildmatch::WildMatch;

use crate::state::AgentId;

mod query;
#[cfg(test)]
mod test_query;

pub use query::Query;

/// How a target expression is interpreted by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    #[default]
    Exact,
    List,
    Glob,
    Regex,
    Query,
}

#[derive(Debug, Error)]
pub enum TargetParseError {
    #[error("empty target expression")]
    EmptyExpression,
    #[error("invalid agent id `{0}`")]
    InvalidId(String),
    #[error("invalid regex `{0}`: {1}")]
    InvalidRegex(String, regex::Error),
    #[error("unsupported field `{0}`")]
    UnsupportedField(String),
    #[error("condition `{0}` has no operator")]
    MissingOperator(String),
}

/// A compiled matcher over agent ids, shared by the glob/regex target
/// modes and the query language's `id` conditions.
#[derive(Debug, Clone)]
pub enum IdMatcher {
    Glob(WildMatch),
    Regex(regex::Regex),
}

impl IdMatcher {
    /// `/pattern/` compiles as an anchored regex, anything else as a
    /// shell-style glob.
    pub fn parse(value: &str) -> Result<Self, TargetParseError> {
        match value
            .strip_prefix('/')
            .and_then(|v| v.strip_suffix('/'))
        {
            Some(pattern) => Self::regex(pattern),
            None => Ok(Self::glob(value)),
        }
    }

    pub fn glob(pattern: &str) -> Self {
        Self::Glob(WildMatch::new(pattern))
    }

    /// Patterns are matched strictly: `^pattern$`.
    pub fn regex(pattern: &str) -> Result<Self, TargetParseError> {
        regex::Regex::new(&format!("^{pattern}$"))
            .map(Self::Regex)
            .map_err(|e| TargetParseError::InvalidRegex(pattern.to_string(), e))
    }

    pub fn matches(&self, id: &str) -> bool {
        match self {
            IdMatcher::Glob(glob) => glob.matches(id),
            IdMatcher::Regex(re) => re.is_match(id),
        }
    }
}

/// Split a comma-separated id list, validating each entry.
pub fn parse_id_list(expr: &str) -> Result<Vec<AgentId>, TargetParseError> {
    let ids = expr
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| AgentId::from_str(s).map_err(|_| TargetParseError::InvalidId(s.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    if ids.is_empty() {
        return Err(TargetParseError::EmptyExpression);
    }
    Ok(ids)
}

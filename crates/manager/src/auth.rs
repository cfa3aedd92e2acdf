use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use jackadi_common::impl_into_status_code;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read credential file: {0}")]
    Credentials(std::io::Error),
    #[error("malformed credential line {0}")]
    MalformedCredential(usize),
    #[error("failed to read authorization file: {0}")]
    Authorization(std::io::Error),
    #[error("malformed authorization file: {0}")]
    MalformedAuthorization(#[from] serde_yaml::Error),
}

impl_into_status_code!(AuthError);

/// Basic-auth credentials plus optional role-based restrictions for
/// the operator HTTP API.
pub struct Authenticator {
    /// user to bcrypt hash
    credentials: HashMap<String, String>,
    rbac: Option<Rbac>,
}

#[derive(Debug, Default, Deserialize)]
struct Rbac {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
    #[serde(default)]
    roles: HashMap<String, RoleEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RoleEntry {
    /// `resource:action` patterns, `*` wildcards either half.
    #[serde(default)]
    endpoints: Vec<String>,
    /// `plugin:task` patterns, `*` wildcards either half.
    #[serde(default)]
    tasks: Vec<String>,
}

impl Authenticator {
    /// Parse the line-based credential file (`user:bcrypt-hash`, `#`
    /// comments and blank lines ignored) and, when given, the RBAC
    /// YAML.
    pub fn load(credentials: &Path, authorization: Option<&Path>) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(credentials).map_err(AuthError::Credentials)?;
        let mut users = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, hash) = line
                .split_once(':')
                .ok_or(AuthError::MalformedCredential(lineno + 1))?;
            users.insert(user.to_string(), hash.to_string());
        }

        let rbac = match authorization {
            Some(path) => {
                let contents = std::fs::read(path).map_err(AuthError::Authorization)?;
                Some(serde_yaml::from_slice(&contents)?)
            }
            None => None,
        };

        Ok(Self {
            credentials: users,
            rbac,
        })
    }

    /// Check an `Authorization: Basic …` header value, returning the
    /// authenticated user name.
    pub fn verify_basic(&self, header: &str) -> Option<String> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;

        let hash = self.credentials.get(user)?;
        match bcrypt::verify(password, hash) {
            Ok(true) => Some(user.to_string()),
            Ok(false) => None,
            Err(e) => {
                warn!("credential entry for `{user}` is not a valid bcrypt hash: {e}");
                None
            }
        }
    }

    /// Whether a user may hit an endpoint, named `resource:action`.
    pub fn allows_endpoint(&self, user: &str, resource: &str, action: &str) -> bool {
        self.allows(user, resource, action, |role| &role.endpoints)
    }

    /// Whether a user may run `plugin:task`.
    pub fn allows_task(&self, user: &str, plugin: &str, task: &str) -> bool {
        self.allows(user, plugin, task, |role| &role.tasks)
    }

    fn allows(
        &self,
        user: &str,
        left: &str,
        right: &str,
        select: impl Fn(&RoleEntry) -> &Vec<String>,
    ) -> bool {
        // no RBAC file: authentication alone gates access
        let Some(rbac) = &self.rbac else {
            return true;
        };
        let Some(entry) = rbac.users.get(user) else {
            return false;
        };

        entry
            .roles
            .iter()
            .filter_map(|role| rbac.roles.get(role))
            .flat_map(select)
            .any(|pattern| pattern_matches(pattern, left, right))
    }
}

/// Both halves of `left:right` must match; `*` wildcards one half.
fn pattern_matches(pattern: &str, left: &str, right: &str) -> bool {
    let Some((pat_left, pat_right)) = pattern.split_once(':') else {
        return false;
    };
    (pat_left == "*" || pat_left == left) && (pat_right == "*" || pat_right == right)
}

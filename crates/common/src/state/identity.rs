use serde::{Deserialize, Serialize};

use super::AgentId;

/// Placeholder rendered instead of certificate material in identity
/// diffs surfaced to operators.
pub const HIDDEN_FIELD: &str = "hidden";

/// The identity an agent presents when connecting: its id, the peer
/// address observed by the manager, and the certificate fingerprint
/// when mTLS is enabled (empty otherwise).
///
/// Equality is structural across all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: AgentId,
    pub addr: String,
    #[serde(default)]
    pub cert_fingerprint: String,
}

impl AgentIdentity {
    pub fn new(id: AgentId, addr: impl Into<String>, cert_fingerprint: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            cert_fingerprint: cert_fingerprint.into(),
        }
    }

    /// Field-by-field diff against another identity with the same id.
    /// Certificate fingerprints are replaced by [`HIDDEN_FIELD`].
    pub fn diff(&self, offered: &Self) -> Vec<IdentityFieldDiff> {
        let mut fields = Vec::new();
        if self.addr != offered.addr {
            fields.push(IdentityFieldDiff {
                field: "address".to_string(),
                registered: self.addr.clone(),
                offered: offered.addr.clone(),
            });
        }
        if self.cert_fingerprint != offered.cert_fingerprint {
            fields.push(IdentityFieldDiff {
                field: "certificate".to_string(),
                registered: HIDDEN_FIELD.to_string(),
                offered: HIDDEN_FIELD.to_string(),
            });
        }
        fields
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// One differing identity field, as surfaced in a rogue-agent error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFieldDiff {
    pub field: String,
    pub registered: String,
    pub offered: String,
}

impl std::fmt::Display for IdentityFieldDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: registered={} offered={}",
            self.field, self.registered, self.offered
        )
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_diff_lists_changed_fields_only() {
        let id = AgentId::from_str("web-1").unwrap();
        let a = AgentIdentity::new(id, "10.0.0.1:4000", "c1");
        let b = AgentIdentity::new(id, "10.0.0.2:4000", "c1");

        let diff = a.diff(&b);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "address");
    }

    #[test]
    fn test_diff_hides_certificates() {
        let id = AgentId::from_str("web-1").unwrap();
        let a = AgentIdentity::new(id, "10.0.0.1:4000", "c1");
        let b = AgentIdentity::new(id, "10.0.0.1:4000", "c2");

        let diff = a.diff(&b);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "certificate");
        assert_eq!(diff[0].registered, HIDDEN_FIELD);
        assert_eq!(diff[0].offered, HIDDEN_FIELD);
    }
}

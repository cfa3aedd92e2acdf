use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use jackadi_common::state::{
    AgentId, AgentIdentity, AgentStateInfo, IdentityFieldDiff, SpecsMap,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod error;

pub use error::InventoryError;

/// Authoritative in-memory state of all known agents, plus a durable
/// snapshot of the accepted and rejected sets.
///
/// A single lock covers the whole registry; operations are O(fleet)
/// which stays small.
pub struct Inventory {
    inner: Mutex<Inner>,
    /// `None` disables snapshot persistence (test hook).
    registry_path: Option<PathBuf>,
}

#[derive(Default)]
struct Inner {
    accepted: HashMap<AgentId, AgentIdentity>,
    candidates: HashSet<AgentIdentity>,
    rejected: HashSet<AgentIdentity>,
    states: HashMap<AgentId, AgentStateInfo>,
}

/// On-disk snapshot shape. Candidates are transient and not persisted.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(rename = "Accepted", default)]
    accepted: HashMap<AgentId, AgentIdentity>,
    #[serde(rename = "Rejected", default)]
    rejected: Vec<AgentIdentity>,
}

/// Cloned snapshot of every collection, for listings.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub accepted: HashMap<AgentId, AgentIdentity>,
    pub candidates: Vec<AgentIdentity>,
    pub rejected: Vec<AgentIdentity>,
    pub states: HashMap<AgentId, AgentStateInfo>,
}

impl Inventory {
    pub fn new(registry_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            registry_path,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned registry lock is unrecoverable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an identity to the candidate set. Identities an operator
    /// already rejected stay rejected.
    pub fn add_candidate(&self, identity: AgentIdentity) -> Result<(), InventoryError> {
        let mut inner = self.lock();
        if inner.rejected.contains(&identity) {
            return Err(InventoryError::Rejected);
        }
        if !inner.candidates.insert(identity) {
            return Err(InventoryError::AlreadyCandidate);
        }
        Ok(())
    }

    /// Promote a candidate (or, with `allow_rejected`, a rejected
    /// identity) to the accepted set.
    pub fn register(
        &self,
        identity: &AgentIdentity,
        allow_rejected: bool,
    ) -> Result<(), InventoryError> {
        let mut inner = self.lock();

        if let Some(existing) = inner.accepted.get(&identity.id) {
            if existing == identity {
                return Err(InventoryError::AlreadyRegistered);
            }
            return Err(InventoryError::RogueAgent(existing.diff(identity)));
        }

        let from_candidates = inner.candidates.remove(identity);
        let from_rejected = allow_rejected && inner.rejected.remove(identity);
        if !from_candidates && !from_rejected {
            return Err(InventoryError::AgentNotFound);
        }

        inner.accepted.insert(identity.id, identity.clone());
        self.save(&inner)
    }

    /// Demote an accepted identity back to candidate.
    pub fn unregister(&self, identity: &AgentIdentity) -> Result<(), InventoryError> {
        let mut inner = self.lock();
        match inner.accepted.get(&identity.id) {
            Some(existing) if existing == identity => {
                inner.accepted.remove(&identity.id);
                inner.candidates.insert(identity.clone());
                self.save(&inner)
            }
            _ => Err(InventoryError::AgentNotFound),
        }
    }

    /// Move an identity to the rejected set, wherever it currently
    /// lives. Idempotent.
    pub fn reject(&self, identity: &AgentIdentity) -> Result<(), InventoryError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.accepted.get(&identity.id) {
            if existing == identity {
                inner.accepted.remove(&identity.id);
            }
        }
        inner.candidates.remove(identity);
        inner.rejected.insert(identity.clone());
        self.save(&inner)
    }

    /// Purge an identity from every collection, along with its state.
    pub fn remove(&self, identity: &AgentIdentity) -> Result<(), InventoryError> {
        let mut inner = self.lock();
        if inner
            .accepted
            .get(&identity.id)
            .is_some_and(|existing| existing == identity)
        {
            inner.accepted.remove(&identity.id);
            inner.states.remove(&identity.id);
        }
        inner.candidates.remove(identity);
        inner.rejected.remove(identity);
        self.save(&inner)
    }

    /// Whether this exact identity is currently accepted.
    pub fn is_accepted(&self, identity: &AgentIdentity) -> bool {
        self.lock()
            .accepted
            .get(&identity.id)
            .is_some_and(|existing| existing == identity)
    }

    /// The field diff against an accepted entry sharing this id but
    /// differing elsewhere, if any.
    pub fn accepted_conflict(&self, identity: &AgentIdentity) -> Option<Vec<IdentityFieldDiff>> {
        let inner = self.lock();
        let existing = inner.accepted.get(&identity.id)?;
        if existing == identity {
            return None;
        }
        Some(existing.diff(identity))
    }

    pub fn mark_active(&self, id: AgentId) {
        self.lock().states.entry(id).or_default().mark_active();
    }

    pub fn mark_state_change(&self, id: AgentId, connected: bool) {
        self.lock()
            .states
            .entry(id)
            .or_insert_with(|| AgentStateInfo::new(connected))
            .mark_state_change(connected);
    }

    pub fn set_spec(&self, id: AgentId, specs: SpecsMap) -> Result<(), InventoryError> {
        let mut inner = self.lock();
        match inner.states.get_mut(&id) {
            Some(state) => {
                state.specs = specs;
                Ok(())
            }
            None => Err(InventoryError::AgentNotFound),
        }
    }

    pub fn specs_of(&self, id: AgentId) -> Option<SpecsMap> {
        self.lock().states.get(&id).map(|s| s.specs.clone())
    }

    /// Ids of accepted agents currently marked connected.
    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.lock()
            .states
            .iter()
            .filter(|(_, state)| state.connected)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn list(&self) -> InventorySnapshot {
        let inner = self.lock();
        InventorySnapshot {
            accepted: inner.accepted.clone(),
            candidates: inner.candidates.iter().cloned().collect(),
            rejected: inner.rejected.iter().cloned().collect(),
            states: inner.states.clone(),
        }
    }

    pub fn get_matching_accepted(
        &self,
        id: AgentId,
        addr: Option<&str>,
        cert: Option<&str>,
    ) -> Vec<AgentIdentity> {
        let inner = self.lock();
        inner
            .accepted
            .values()
            .filter(|identity| matches_filters(identity, id, addr, cert))
            .cloned()
            .collect()
    }

    pub fn get_matching_candidates(
        &self,
        id: AgentId,
        addr: Option<&str>,
        cert: Option<&str>,
    ) -> Vec<AgentIdentity> {
        let inner = self.lock();
        inner
            .candidates
            .iter()
            .filter(|identity| matches_filters(identity, id, addr, cert))
            .cloned()
            .collect()
    }

    pub fn get_matching_rejected(
        &self,
        id: AgentId,
        addr: Option<&str>,
        cert: Option<&str>,
    ) -> Vec<AgentIdentity> {
        let inner = self.lock();
        inner
            .rejected
            .iter()
            .filter(|identity| matches_filters(identity, id, addr, cert))
            .cloned()
            .collect()
    }

    /// Load the accepted/rejected snapshot from disk, replacing the
    /// current collections. Missing file is a fresh install.
    pub fn load_registry(&self) -> Result<(), InventoryError> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(InventoryError::RegistrySave(e.to_string())),
        };
        let file: RegistryFile = serde_json::from_slice(&contents)
            .map_err(|e| InventoryError::RegistrySave(e.to_string()))?;

        let mut inner = self.lock();
        inner.accepted = file.accepted;
        inner.rejected = file.rejected.into_iter().collect();
        Ok(())
    }

    /// Persist the snapshot atomically (write temp, fsync, rename),
    /// mode 0600. The in-memory transition is never reverted on
    /// failure; the error is surfaced to the caller.
    fn save(&self, inner: &Inner) -> Result<(), InventoryError> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let file = RegistryFile {
            accepted: inner.accepted.clone(),
            rejected: inner.rejected.iter().cloned().collect(),
        };

        save_registry_file(path, &file).map_err(|e| {
            warn!("failed to save registry snapshot: {e}");
            InventoryError::RegistrySave(e.to_string())
        })
    }
}

fn matches_filters(
    identity: &AgentIdentity,
    id: AgentId,
    addr: Option<&str>,
    cert: Option<&str>,
) -> bool {
    identity.id == id
        && addr.is_none_or(|addr| identity.addr == addr)
        && cert.is_none_or(|cert| identity.cert_fingerprint == cert)
}

fn save_registry_file(path: &PathBuf, file: &RegistryFile) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(file).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn identity(id: &str, addr: &str, cert: &str) -> AgentIdentity {
        AgentIdentity::new(AgentId::from_str(id).unwrap(), addr, cert)
    }

    fn inventory() -> Inventory {
        Inventory::new(None)
    }

    #[test]
    fn test_candidate_to_accepted() {
        let inv = inventory();
        let web = identity("web-1", "10.0.0.1:4000", "c1");

        inv.add_candidate(web.clone()).unwrap();
        assert!(matches!(
            inv.add_candidate(web.clone()),
            Err(InventoryError::AlreadyCandidate)
        ));

        inv.register(&web, false).unwrap();
        assert!(inv.is_accepted(&web));
        assert!(matches!(
            inv.register(&web, false),
            Err(InventoryError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_register_unknown_identity() {
        let inv = inventory();
        let web = identity("web-1", "10.0.0.1:4000", "c1");
        assert!(matches!(
            inv.register(&web, false),
            Err(InventoryError::AgentNotFound)
        ));
    }

    #[test]
    fn test_rogue_agent_detection() {
        let inv = inventory();
        let web = identity("web-1", "10.0.0.1:4000", "c1");
        inv.add_candidate(web.clone()).unwrap();
        inv.register(&web, false).unwrap();

        // same id, same cert, moved address
        let moved = identity("web-1", "10.0.0.2:4000", "c1");
        inv.add_candidate(moved.clone()).unwrap();
        let err = inv.register(&moved, false).unwrap_err();
        let InventoryError::RogueAgent(diff) = err else {
            panic!("expected RogueAgent, got {err:?}");
        };
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "address");

        // original registration is untouched
        assert!(inv.is_accepted(&web));
    }

    #[test]
    fn test_reject_is_idempotent() {
        let inv = inventory();
        let web = identity("web-1", "10.0.0.1:4000", "c1");
        inv.add_candidate(web.clone()).unwrap();
        inv.register(&web, false).unwrap();

        inv.reject(&web).unwrap();
        inv.reject(&web).unwrap();

        let snapshot = inv.list();
        assert!(snapshot.accepted.is_empty());
        assert!(snapshot.candidates.is_empty());
        assert_eq!(snapshot.rejected, vec![web.clone()]);

        // rejected identities cannot come back as candidates
        assert!(matches!(
            inv.add_candidate(web.clone()),
            Err(InventoryError::Rejected)
        ));

        // unless the operator allows it
        inv.register(&web, true).unwrap();
        assert!(inv.is_accepted(&web));
    }

    #[test]
    fn test_remove_purges_everything() {
        let inv = inventory();
        let web = identity("web-1", "10.0.0.1:4000", "c1");
        inv.add_candidate(web.clone()).unwrap();
        inv.register(&web, false).unwrap();
        inv.mark_state_change(web.id, true);

        inv.remove(&web).unwrap();
        let snapshot = inv.list();
        assert!(snapshot.accepted.is_empty());
        assert!(snapshot.candidates.is_empty());
        assert!(snapshot.rejected.is_empty());
        assert!(snapshot.states.is_empty());
    }

    #[test]
    fn test_set_spec_requires_state() {
        let inv = inventory();
        let id = AgentId::from_str("web-1").unwrap();
        assert!(matches!(
            inv.set_spec(id, SpecsMap::new()),
            Err(InventoryError::AgentNotFound)
        ));

        inv.mark_state_change(id, true);
        inv.set_spec(id, SpecsMap::new()).unwrap();
    }

    #[test]
    fn test_registry_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let inv = Inventory::new(Some(path.clone()));
        let web = identity("web-1", "10.0.0.1:4000", "c1");
        let db = identity("db-1", "10.0.0.9:4000", "c9");
        inv.add_candidate(web.clone()).unwrap();
        inv.register(&web, false).unwrap();
        inv.add_candidate(db.clone()).unwrap();
        inv.reject(&db).unwrap();

        let restored = Inventory::new(Some(path));
        restored.load_registry().unwrap();
        assert!(restored.is_accepted(&web));
        let snapshot = restored.list();
        assert_eq!(snapshot.rejected, vec![db]);
        // candidates are transient
        assert!(snapshot.candidates.is_empty());
    }
}

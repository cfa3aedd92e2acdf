use std::path::Path;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::error::DatabaseError;

/// Width of the expiry stamp prefixed to every stored value.
const EXPIRY_LEN: usize = size_of::<u64>();

/// A sled tree holding JSON values with per-entry lifetimes.
///
/// sled has no native TTL, so each value carries its expiry as a
/// big-endian millisecond stamp (zero = no expiry). Reads filter
/// expired rows; [`JsonTree::sweep`] reclaims them.
pub struct JsonTree {
    tree: sled::Tree,
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn encode(value_json: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let expiry = ttl.map_or(0, |ttl| now_millis().saturating_add(ttl.as_millis() as u64));
    let mut buf = Vec::with_capacity(EXPIRY_LEN + value_json.len());
    buf.extend_from_slice(&expiry.to_be_bytes());
    buf.extend_from_slice(value_json);
    buf
}

/// Split a stored value into its JSON payload, or `None` if expired
/// or malformed.
fn decode(bytes: &[u8]) -> Option<&[u8]> {
    let (stamp, json) = bytes.split_at_checked(EXPIRY_LEN)?;
    let expiry = u64::from_be_bytes(stamp.try_into().ok()?);
    if expiry != 0 && expiry < now_millis() {
        return None;
    }
    Some(json)
}

impl JsonTree {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn save<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_vec(value).map_err(DatabaseError::Serialize)?;
        self.tree.insert(key.as_bytes(), encode(&json, ttl))?;
        Ok(())
    }

    pub fn restore<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, DatabaseError> {
        let Some(bytes) = self.tree.get(key.as_bytes())? else {
            return Ok(None);
        };
        let Some(json) = decode(&bytes) else {
            return Ok(None);
        };
        serde_json::from_slice(json)
            .map(Some)
            .map_err(|e| DatabaseError::Deserialize(key.to_string(), e))
    }

    /// The live JSON payload under a key, if any.
    pub fn restore_raw(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self
            .tree
            .get(key.as_bytes())?
            .as_deref()
            .and_then(decode)
            .map(<[u8]>::to_vec))
    }

    pub fn delete(&self, key: &str) -> Result<bool, DatabaseError> {
        Ok(self.tree.remove(key.as_bytes())?.is_some())
    }

    /// Walk live entries within `[lower, upper]` in reverse key order.
    /// Rows that fail to read are logged and skipped.
    pub fn scan_range_rev(
        &self,
        lower: &str,
        upper_inclusive: &str,
    ) -> impl Iterator<Item = (String, Vec<u8>)> {
        self.tree
            .range(lower.as_bytes().to_vec()..=upper_inclusive.as_bytes().to_vec())
            .rev()
            .filter_map(|row| {
                let (key, value) = match row {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::error!("Error reading row from store: {e}");
                        return None;
                    }
                };

                let key = String::from_utf8(key.to_vec()).ok()?;
                let json = decode(&value)?;
                Some((key, json.to_vec()))
            })
    }

    /// Purge expired rows, returning how many were removed.
    pub fn sweep(&self) -> Result<usize, DatabaseError> {
        let mut removed = 0;
        for row in self.tree.iter() {
            let (key, value) = row?;
            if decode(&value).is_none() {
                self.tree.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Open the sled database backing a set of [`JsonTree`]s.
pub fn open(path: &Path) -> Result<sled::Db, DatabaseError> {
    Ok(sled::open(path)?)
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_tree() -> (tempfile::TempDir, JsonTree) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let tree = JsonTree::new(db.open_tree("test").unwrap());
        (dir, tree)
    }

    #[test]
    fn test_save_restore() {
        let (_dir, tree) = scratch_tree();
        tree.save("res:1", &vec![1u32, 2, 3], None).unwrap();

        let back: Vec<u32> = tree.restore("res:1").unwrap().unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        assert!(tree.restore_raw("res:2").unwrap().is_none());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let (_dir, tree) = scratch_tree();
        tree.save("res:1", &"stale", Some(Duration::ZERO)).unwrap();
        tree.save("res:2", &"live", Some(Duration::from_secs(3600)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(tree.restore::<String>("res:1").unwrap().is_none());
        assert_eq!(
            tree.restore::<String>("res:2").unwrap().unwrap(),
            "live".to_string()
        );

        assert_eq!(tree.sweep().unwrap(), 1);
    }

    #[test]
    fn test_scan_range_rev_order() {
        let (_dir, tree) = scratch_tree();
        for id in [3i64, 1, 7] {
            tree.save(&format!("res:{id}"), &id, None).unwrap();
        }
        tree.save("req:9", &9i64, None).unwrap();

        let keys: Vec<String> = tree
            .scan_range_rev("res:", "res:~")
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["res:7", "res:3", "res:1"]);
    }
}

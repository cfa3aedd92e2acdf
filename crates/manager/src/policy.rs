use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use jackadi_common::constant::POLICY_CACHE_TTL;
use jackadi_common::plugin::{content_checksum, PluginManifest};
use jackadi_common::rpc::error::PolicyError;
use jackadi_common::state::AgentId;
use tokio::sync::Mutex;
use tracing::warn;
use wildmatch::WildMatch;

/// Serves the plugin set each agent must run, from a YAML policy file
/// mapping agent-id glob patterns to plugin filenames:
///
/// ```yaml
/// "web-*": [disk, nginx]
/// "*": [health]
/// ```
///
/// Checksums are computed over the files in the manager's plugin
/// directory. The parsed policy is cached for a short freshness
/// window so a fleet-wide sync does not hammer the filesystem.
pub struct PolicyService {
    policy_path: PathBuf,
    plugin_dir: PathBuf,
    cache: Mutex<Option<Cached>>,
}

struct Cached {
    loaded_at: Instant,
    patterns: Vec<(WildMatch, Vec<String>)>,
    checksums: HashMap<String, String>,
}

impl PolicyService {
    pub fn new(policy_path: PathBuf, plugin_dir: PathBuf) -> Self {
        Self {
            policy_path,
            plugin_dir,
            cache: Mutex::new(None),
        }
    }

    /// The aggregated filename to checksum manifest for one agent.
    pub async fn list_agent_plugins(&self, agent: AgentId) -> Result<PluginManifest, PolicyError> {
        let mut cache = self.cache.lock().await;

        if cache
            .as_ref()
            .is_none_or(|cached| cached.loaded_at.elapsed() > POLICY_CACHE_TTL)
        {
            *cache = Some(self.load().await?);
        }
        let Some(cached) = cache.as_ref() else {
            return Ok(PluginManifest::new());
        };
        let mut manifest = PluginManifest::new();
        for (pattern, filenames) in &cached.patterns {
            if !pattern.matches(agent.as_ref()) {
                continue;
            }
            for filename in filenames {
                let Some(checksum) = cached.checksums.get(filename) else {
                    continue;
                };
                manifest.insert(filename.clone(), checksum.clone());
            }
        }

        Ok(manifest)
    }

    async fn load(&self) -> Result<Cached, PolicyError> {
        let contents = tokio::fs::read(&self.policy_path)
            .await
            .map_err(|e| PolicyError::Unavailable(e.to_string()))?;
        let raw: indexmap::IndexMap<String, Vec<String>> = serde_yaml::from_slice(&contents)
            .map_err(|e| PolicyError::Unavailable(e.to_string()))?;

        let mut checksums = HashMap::new();
        let mut patterns = Vec::with_capacity(raw.len());
        for (pattern, filenames) in raw {
            for filename in &filenames {
                if checksums.contains_key(filename) {
                    continue;
                }
                match tokio::fs::read(self.plugin_dir.join(filename)).await {
                    Ok(bytes) => {
                        checksums.insert(filename.clone(), content_checksum(&bytes));
                    }
                    Err(e) => {
                        warn!("plugin `{filename}` referenced by policy is unreadable: {e}");
                    }
                }
            }
            patterns.push((WildMatch::new(&pattern), filenames));
        }

        Ok(Cached {
            loaded_at: Instant::now(),
            patterns,
            checksums,
        })
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    async fn write_fixture(dir: &std::path::Path, policy: &str) -> (PathBuf, PathBuf) {
        let plugin_dir = dir.join("plugins");
        tokio::fs::create_dir_all(&plugin_dir).await.unwrap();
        for (name, content) in [("disk", "disk-v1"), ("nginx", "nginx-v1"), ("health", "hp")] {
            tokio::fs::write(plugin_dir.join(name), content).await.unwrap();
        }
        let policy_path = dir.join("plugins.yaml");
        tokio::fs::write(&policy_path, policy).await.unwrap();
        (policy_path, plugin_dir)
    }

    #[tokio::test]
    async fn test_patterns_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let (policy_path, plugin_dir) = write_fixture(
            dir.path(),
            "\"web-*\": [disk, nginx]\n\"*\": [health]\n",
        )
        .await;
        let service = PolicyService::new(policy_path, plugin_dir);

        let web = service
            .list_agent_plugins(AgentId::from_str("web-1").unwrap())
            .await
            .unwrap();
        assert_eq!(
            web.keys().collect::<Vec<_>>(),
            vec!["disk", "nginx", "health"]
        );
        assert_eq!(web["disk"], content_checksum(b"disk-v1"));

        let db = service
            .list_agent_plugins(AgentId::from_str("db-1").unwrap())
            .await
            .unwrap();
        assert_eq!(db.keys().collect::<Vec<_>>(), vec!["health"]);
    }

    #[tokio::test]
    async fn test_missing_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = PolicyService::new(dir.path().join("nope.yaml"), dir.path().to_path_buf());
        assert!(service
            .list_agent_plugins(AgentId::from_str("web-1").unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unreadable_plugins_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let (policy_path, plugin_dir) =
            write_fixture(dir.path(), "\"*\": [disk, ghost]\n").await;
        let service = PolicyService::new(policy_path, plugin_dir);

        let manifest = service
            .list_agent_plugins(AgentId::from_str("web-1").unwrap())
            .await
            .unwrap();
        assert_eq!(manifest.keys().collect::<Vec<_>>(), vec!["disk"]);
    }
}

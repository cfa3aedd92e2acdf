use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    message::{InputValue, LockMode},
    state::SpecsMap,
};

/// Filename to sha256 checksum of every plugin an agent must run.
pub type PluginManifest = IndexMap<String, String>;

/// Hex sha256 of plugin content, the unit of compare for hot reload.
pub fn content_checksum(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A parsed `plugin` or `plugin:task` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskName<'a> {
    pub plugin: &'a str,
    pub task: &'a str,
}

/// Split a task name into plugin and task halves. A bare plugin name
/// addresses its default task. More than one separator is malformed.
pub fn parse_task_name(name: &str) -> Option<TaskName<'_>> {
    let mut parts = name.split(':');
    let plugin = parts.next()?;
    let task = parts.next().unwrap_or("");
    if plugin.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(TaskName { plugin, task })
}

/// What a plugin invocation produced, independent of fabric errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Opaque bytes, typically JSON.
    pub output: Vec<u8>,
    pub task_error: String,
    pub retcode: i32,
}

/// Failure of the plugin runtime itself, carrying the status code of
/// the underlying RPC to the plugin subprocess.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("plugin `{0}` is not loaded")]
    UnknownPlugin(String),
    #[error("plugin `{0}` has no task `{1}`")]
    UnknownTask(String, String),
    #[error("{message}")]
    Call { code: String, message: String },
}

impl HostError {
    /// Render the module error string the fabric attaches to the
    /// response. A plain "Unknown" status keeps the bare message.
    pub fn module_error(&self) -> String {
        match self {
            HostError::Call { code, message } if code == "Unknown" => message.clone(),
            HostError::Call { code, message } => format!("code={code}, error={message}"),
            other => other.to_string(),
        }
    }
}

/// The plugin runtime as seen by the fabric: something that loads
/// versioned plugins, answers lock-mode queries, invokes tasks, and
/// collects spec facts. The subprocess protocol behind it is not the
/// fabric's concern.
#[async_trait]
pub trait PluginHost: Send + Sync + 'static {
    /// The declared lock mode of a task. Errors when the plugin or
    /// task is unknown; callers decide the fallback.
    fn task_lock_mode(&self, plugin: &str, task: &str) -> Result<LockMode, HostError>;

    /// Invoke a task and wait for it to finish. Cancellation of the
    /// surrounding future must not kill the subprocess mid-write.
    async fn invoke(
        &self,
        plugin: &str,
        task: &str,
        args: &[InputValue],
        options: &IndexMap<String, InputValue>,
    ) -> Result<TaskOutput, HostError>;

    /// Gather spec facts from every loaded plugin's collector.
    async fn collect_specs(&self) -> SpecsMap;

    /// Filename to sha256 of currently loaded plugins.
    fn loaded(&self) -> PluginManifest;

    /// Rescan the plugin directory, reloading plugins whose content
    /// checksum changed and dropping removed ones. Unchanged plugins
    /// are left running.
    async fn reload(&self) -> Result<(), HostError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_task_name() {
        let t = parse_task_name("disk:usage").unwrap();
        assert_eq!(t.plugin, "disk");
        assert_eq!(t.task, "usage");

        let t = parse_task_name("disk").unwrap();
        assert_eq!(t.plugin, "disk");
        assert_eq!(t.task, "");

        assert!(parse_task_name("a:b:c").is_none());
        assert!(parse_task_name("").is_none());
        assert!(parse_task_name(":task").is_none());
    }

    #[test]
    fn test_module_error_rendering() {
        let plain = HostError::Call {
            code: "Unknown".into(),
            message: "boom".into(),
        };
        assert_eq!(plain.module_error(), "boom");

        let coded = HostError::Call {
            code: "Unavailable".into(),
            message: "plugin restarting".into(),
        };
        assert_eq!(
            coded.module_error(),
            "code=Unavailable, error=plugin restarting"
        );
    }
}

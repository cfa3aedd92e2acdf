use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use jackadi_common::message::{InputValue, LockMode};
use jackadi_common::plugin::{
    content_checksum, HostError, PluginHost, PluginManifest, TaskOutput,
};
use jackadi_common::state::SpecsMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Budget for a plugin to answer its manifest or specs query.
const META_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs plugins as subprocesses: every plugin is an executable in the
/// plugin directory that answers `manifest`, `specs`, and
/// `run <task>` invocations with JSON on stdout.
pub struct ProcessHost {
    plugin_dir: PathBuf,
    plugins: DashMap<String, LoadedPlugin>,
    /// Pids of in-flight invocations, force-killed if a graceful
    /// shutdown runs out of patience.
    running: DashMap<u32, ()>,
}

#[derive(Debug, Clone)]
struct LoadedPlugin {
    path: PathBuf,
    checksum: String,
    meta: PluginMeta,
}

/// What a plugin declares about itself.
#[derive(Debug, Clone, Default, Deserialize)]
struct PluginMeta {
    #[serde(default)]
    tasks: HashMap<String, TaskMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TaskMeta {
    #[serde(default)]
    lock: LockDecl,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum LockDecl {
    #[default]
    NoLock,
    Write,
    Exclusive,
}

impl From<LockDecl> for LockMode {
    fn from(decl: LockDecl) -> Self {
        match decl {
            LockDecl::NoLock => LockMode::NoLock,
            LockDecl::Write => LockMode::Write,
            LockDecl::Exclusive => LockMode::Exclusive,
        }
    }
}

/// Stdin payload handed to `run <task>`.
#[derive(Debug, Serialize)]
struct RunInput<'a> {
    args: &'a [InputValue],
    options: &'a IndexMap<String, InputValue>,
}

/// Stdout payload expected back from `run <task>`.
#[derive(Debug, Default, Deserialize)]
struct RunOutput {
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retcode: i32,
}

impl ProcessHost {
    /// Scan the plugin directory and load every plugin's manifest.
    pub async fn load(plugin_dir: PathBuf) -> Self {
        let host = Self {
            plugin_dir,
            plugins: DashMap::new(),
            running: DashMap::new(),
        };
        if let Err(e) = host.reload_inner().await {
            error!("initial plugin scan failed: {e}");
        }
        host
    }

    async fn reload_inner(&self) -> Result<(), HostError> {
        let mut entries = tokio::fs::read_dir(&self.plugin_dir)
            .await
            .map_err(|e| call_error(format!("plugin directory unreadable: {e}")))?;

        let mut seen = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("plugin directory entry unreadable: {e}");
                    break;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            seen.push(name.clone());

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("plugin `{name}` unreadable: {e}");
                    continue;
                }
            };
            let checksum = content_checksum(&bytes);

            // unchanged plugins are not restarted
            if self
                .plugins
                .get(&name)
                .is_some_and(|loaded| loaded.checksum == checksum)
            {
                continue;
            }

            match self.query_meta(&path).await {
                Ok(meta) => {
                    info!("loaded plugin `{name}`");
                    self.plugins.insert(
                        name,
                        LoadedPlugin {
                            path,
                            checksum,
                            meta,
                        },
                    );
                }
                Err(e) => warn!("plugin `{name}` rejected: {e}"),
            }
        }

        // drop plugins whose file disappeared
        self.plugins.retain(|name, _| seen.contains(name));
        Ok(())
    }

    async fn query_meta(&self, path: &PathBuf) -> Result<PluginMeta, HostError> {
        let output = tokio::time::timeout(
            META_TIMEOUT,
            Command::new(path)
                .arg("manifest")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| call_error("manifest query timed out".to_string()))?
        .map_err(|e| call_error(format!("manifest query failed: {e}")))?;

        serde_json::from_slice(&output.stdout)
            .map_err(|e| call_error(format!("malformed manifest: {e}")))
    }

    /// SIGKILL every in-flight plugin invocation.
    pub fn force_kill_all(&self) {
        for entry in self.running.iter() {
            let pid = *entry.key();
            debug!("force-killing plugin subprocess {pid}");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!("failed to kill plugin subprocess {pid}: {e}");
            }
        }
    }
}

#[async_trait]
impl PluginHost for ProcessHost {
    fn task_lock_mode(&self, plugin: &str, task: &str) -> Result<LockMode, HostError> {
        let loaded = self
            .plugins
            .get(plugin)
            .ok_or_else(|| HostError::UnknownPlugin(plugin.to_string()))?;
        let task = if task.is_empty() { "default" } else { task };
        loaded
            .meta
            .tasks
            .get(task)
            .map(|meta| meta.lock.into())
            .ok_or_else(|| HostError::UnknownTask(plugin.to_string(), task.to_string()))
    }

    async fn invoke(
        &self,
        plugin: &str,
        task: &str,
        args: &[InputValue],
        options: &IndexMap<String, InputValue>,
    ) -> Result<TaskOutput, HostError> {
        let loaded = self
            .plugins
            .get(plugin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::UnknownPlugin(plugin.to_string()))?;
        let task = if task.is_empty() { "default" } else { task };
        if !loaded.meta.tasks.contains_key(task) {
            return Err(HostError::UnknownTask(plugin.to_string(), task.to_string()));
        }

        let input = serde_json::to_vec(&RunInput { args, options })
            .map_err(|e| call_error(format!("failed to encode task input: {e}")))?;

        let mut child = Command::new(&loaded.path)
            .arg("run")
            .arg(task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| call_error(format!("failed to spawn plugin: {e}")))?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.running.insert(pid, ());
        }

        let result = async {
            if let Some(stdin) = child.stdin.as_mut() {
                stdin
                    .write_all(&input)
                    .await
                    .map_err(|e| call_error(format!("failed to write task input: {e}")))?;
            }
            drop(child.stdin.take());

            child
                .wait_with_output()
                .await
                .map_err(|e| call_error(format!("plugin wait failed: {e}")))
        }
        .await;

        if let Some(pid) = pid {
            self.running.remove(&pid);
        }
        let output = result?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(HostError::Call {
                code: "Aborted".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let run: RunOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| call_error(format!("malformed task output: {e}")))?;

        Ok(TaskOutput {
            output: serde_json::to_vec(&run.output).unwrap_or_default(),
            task_error: run.error,
            retcode: run.retcode,
        })
    }

    async fn collect_specs(&self) -> SpecsMap {
        let mut specs = SpecsMap::new();
        let plugins: Vec<(String, PathBuf)> = self
            .plugins
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().path.clone()))
            .collect();

        for (name, path) in plugins {
            let output = tokio::time::timeout(
                META_TIMEOUT,
                Command::new(&path)
                    .arg("specs")
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .output(),
            )
            .await;

            let bytes = match output {
                Ok(Ok(output)) if output.status.success() => output.stdout,
                Ok(Ok(_)) | Err(_) => {
                    debug!("plugin `{name}` spec collector failed");
                    continue;
                }
                Ok(Err(e)) => {
                    debug!("plugin `{name}` spec collector failed: {e}");
                    continue;
                }
            };

            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    specs.insert(name, value);
                }
                Err(e) => debug!("plugin `{name}` returned malformed specs: {e}"),
            }
        }

        specs
    }

    fn loaded(&self) -> PluginManifest {
        self.plugins
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().checksum.clone()))
            .collect()
    }

    async fn reload(&self) -> Result<(), HostError> {
        self.reload_inner().await
    }
}

fn call_error(message: String) -> HostError {
    HostError::Call {
        code: "Unknown".to_string(),
        message,
    }
}

use std::os::unix::fs::PermissionsExt;

use jackadi_common::plugin::{content_checksum, HostError};
use jackadi_common::rpc::error::PolicyError;
use tarpc::context;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tracing::{info, warn};

use crate::state::{AppState, GlobalState};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not connected to the manager")]
    NotConnected,
    #[error("policy RPC failed: {0}")]
    Rpc(#[from] tarpc::client::RpcError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("failed to download `{0}`: {1}")]
    Download(String, reqwest::Error),
    #[error("`{0}` downloaded with checksum {1}, expected {2}")]
    ChecksumMismatch(String, String, String),
    #[error("io error on `{0}`: {1}")]
    Io(String, std::io::Error),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Reconcile the local plugin set against the manager's policy:
/// periodically, and immediately when the handshake rings the bell.
pub async fn sync_task(state: AppState) {
    let mut interval = tokio::time::interval(state.cli.plugin_sync_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        select! {
            _ = interval.tick() => {}
            _ = state.sync_requests.notified() => {}
            _ = state.shutdown.cancelled() => return,
        }

        if let Err(e) = sync_once(&state).await {
            warn!("plugin sync failed: {e}");
        }
    }
}

/// One reconcile pass: fetch the manifest, download changed plugins
/// by content checksum, drop plugins the policy no longer lists, and
/// hot-reload under the exclusive lock.
pub async fn sync_once(state: &GlobalState) -> Result<(), SyncError> {
    let client = state.get_client().await.ok_or(SyncError::NotConnected)?;
    let manifest = client.list_agent_plugins(context::current()).await??;
    let local = state.host.loaded();

    let mut changed = false;
    for (filename, checksum) in &manifest {
        if local.get(filename) == Some(checksum) {
            continue;
        }
        match fetch_plugin(state, filename, checksum).await {
            Ok(()) => {
                info!("plugin `{filename}` updated");
                changed = true;
            }
            // one bad plugin must not stall the rest of the sync
            Err(e) => warn!("{e}"),
        }
    }

    for filename in local.keys() {
        if manifest.contains_key(filename) {
            continue;
        }
        match tokio::fs::remove_file(state.cli.plugin_dir.join(filename)).await {
            Ok(()) => {
                info!("plugin `{filename}` removed by policy");
                changed = true;
            }
            Err(e) => warn!("failed to remove plugin `{filename}`: {e}"),
        }
    }

    if changed {
        // quiesce running tasks while plugins restart
        let _guard = state.exclusive_lock.write().await;
        state.host.reload().await?;
    }

    Ok(())
}

/// Download one plugin into a staging directory, verify its checksum,
/// mark it executable, and atomically rename it into place.
async fn fetch_plugin(state: &GlobalState, filename: &str, expected: &str) -> Result<(), SyncError> {
    let url = format!("{}/plugin/{filename}", state.endpoint);
    let io = |e| SyncError::Io(filename.to_string(), e);

    let response = reqwest::get(&url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| SyncError::Download(filename.to_string(), e))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SyncError::Download(filename.to_string(), e))?;

    let checksum = content_checksum(&bytes);
    if checksum != expected {
        return Err(SyncError::ChecksumMismatch(
            filename.to_string(),
            checksum,
            expected.to_string(),
        ));
    }

    // stage within the plugin directory so the rename stays atomic
    let staging = state.cli.plugin_dir.join(".staging");
    tokio::fs::create_dir_all(&staging).await.map_err(io)?;
    let staged = staging.join(filename);

    let mut file = tokio::fs::File::create(&staged).await.map_err(io)?;
    file.write_all(&bytes).await.map_err(io)?;
    file.sync_all().await.map_err(io)?;
    drop(file);

    tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(io)?;
    tokio::fs::rename(&staged, state.cli.plugin_dir.join(filename))
        .await
        .map_err(io)?;

    Ok(())
}

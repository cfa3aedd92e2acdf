use std::sync::Arc;

use jackadi_common::constant::{MAX_CONCURRENT_TASKS, MAX_WAITING_REQUESTS};
use jackadi_common::plugin::PluginHost;
use jackadi_common::rpc::control::ControlServiceClient;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cli::Cli;

pub type AppState = Arc<GlobalState>;

/// The agent's global state. The execution discipline (admission
/// queue, slot pools, exclusive lock) lives here so it spans stream
/// reconnects; the engine wired to each connection borrows it.
pub struct GlobalState {
    pub cli: Cli,
    /// HTTP endpoint of the manager, for plugin downloads.
    pub endpoint: String,
    pub client: RwLock<Option<ControlServiceClient>>,
    pub host: Arc<dyn PluginHost>,

    /// Admission queue: in-flight plus waiting requests.
    pub requests_queue: Arc<Semaphore>,
    /// Slot pool for no-lock tasks.
    pub running_tasks: Arc<Semaphore>,
    /// The single slot write and exclusive tasks funnel through.
    pub running_write_task: Arc<Semaphore>,
    /// Read-held by no-lock/write tasks, write-held by exclusive
    /// tasks and plugin reloads.
    pub exclusive_lock: Arc<RwLock<()>>,

    /// The long-lived context plugin invocations run under; cancelled
    /// only when the process shuts down, never on stream loss.
    pub shutdown: CancellationToken,
    /// In-flight task workers, awaited on graceful shutdown.
    pub workers: TaskTracker,
    /// Rung by the manager handshake to request an immediate plugin
    /// sync.
    pub sync_requests: Notify,
}

impl GlobalState {
    pub fn new(cli: Cli, endpoint: String, host: Arc<dyn PluginHost>) -> Self {
        Self {
            cli,
            endpoint,
            client: RwLock::new(None),
            host,
            requests_queue: Arc::new(Semaphore::new(MAX_WAITING_REQUESTS)),
            running_tasks: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
            running_write_task: Arc::new(Semaphore::new(1)),
            exclusive_lock: Arc::new(RwLock::new(())),
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            sync_requests: Notify::new(),
        }
    }

    pub async fn get_client(&self) -> Option<ControlServiceClient> {
        self.client.read().await.clone()
    }
}

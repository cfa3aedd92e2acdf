use std::sync::Arc;

use dashmap::DashMap;
use jackadi_common::state::AgentId;
use jackadi_common::util::OpaqueDebug;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::Authenticator;
use crate::cli::Cli;
use crate::dispatch::Dispatcher;
use crate::inventory::Inventory;
use crate::policy::PolicyService;
use crate::results::ResultsStore;

pub type AppState = Arc<GlobalState>;

/// The global state for the manager.
pub struct GlobalState {
    pub cli: Cli,
    pub db: OpaqueDebug<sled::Db>,
    pub inventory: Inventory,
    pub dispatcher: Dispatcher,
    pub results: ResultsStore,
    pub policy: PolicyService,
    pub auth: Option<Authenticator>,
    /// Per-agent shutdown tokens, owned by the stream handlers.
    /// An absent entry after connect means shutdown was requested.
    pub shutdowns: DashMap<AgentId, CancellationToken>,
}

impl GlobalState {
    /// Ask one agent's stream handler to wind down: cancel its
    /// shutdown token, drop the entry, and erase the agent from the
    /// dispatchable map.
    pub fn request_shutdown(&self, id: AgentId) {
        if let Some((_, token)) = self.shutdowns.remove(&id) {
            token.cancel();
        }
        if let Err(e) = self.dispatcher.forget(id) {
            // the stream handler retries the forget once its channel
            // entry is gone
            debug!("forget for agent {id} deferred: {e}");
        }
    }
}

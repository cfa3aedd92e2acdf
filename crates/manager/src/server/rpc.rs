use jackadi_common::define_stream_mux;
use jackadi_common::plugin::PluginManifest;
use jackadi_common::rpc::control::{
    ControlService, ControlServiceRequest, ControlServiceResponse, HandshakeRequest,
};
use jackadi_common::rpc::error::{HandshakeError, PolicyError};
use jackadi_common::state::AgentIdentity;
use tarpc::context::Context;
use tracing::{info, warn};

use crate::inventory::InventoryError;
use crate::state::AppState;

define_stream_mux!(manager;
    ControlServiceRequest => ControlServiceResponse;
);

/// One control RPC server per connected agent stream, bound to the
/// identity derived from the transport.
#[derive(Clone)]
pub struct ControlRpcServer {
    pub state: AppState,
    pub identity: AgentIdentity,
}

impl ControlService for ControlRpcServer {
    async fn handshake(
        self,
        _: Context,
        request: HandshakeRequest,
    ) -> Result<HandshakeRequest, HandshakeError> {
        if request.id != self.identity.id {
            return Err(HandshakeError::IdentityMismatch);
        }

        let inventory = &self.state.inventory;
        if inventory.is_accepted(&self.identity) {
            return Ok(request);
        }

        // an accepted entry under the same id with a different address
        // or certificate is never auto-resolved
        if let Some(diff) = inventory.accepted_conflict(&self.identity) {
            warn!("rogue agent handshake from {}", self.identity);
            return Err(HandshakeError::RogueAgent(diff));
        }

        match inventory.add_candidate(self.identity.clone()) {
            Ok(()) => info!("agent {} is now a candidate", self.identity),
            Err(InventoryError::AlreadyCandidate) => {}
            Err(InventoryError::Rejected) => return Err(HandshakeError::Rejected),
            Err(e) => return Err(HandshakeError::Internal(e.to_string())),
        }

        if !self.state.cli.auto_accept {
            return Err(HandshakeError::PermissionDenied);
        }

        match inventory.register(&self.identity, false) {
            Ok(()) => {
                info!("agent {} auto-accepted", self.identity);
                Ok(request)
            }
            Err(InventoryError::AlreadyRegistered) => Ok(request),
            Err(InventoryError::RogueAgent(diff)) => Err(HandshakeError::RogueAgent(diff)),
            Err(InventoryError::Rejected) => Err(HandshakeError::Rejected),
            Err(InventoryError::RegistrySave(e)) => {
                // the in-memory transition went through
                warn!("agent {} accepted, snapshot failed: {e}", self.identity);
                Ok(request)
            }
            Err(e) => Err(HandshakeError::Internal(e.to_string())),
        }
    }

    async fn list_agent_plugins(self, _: Context) -> Result<PluginManifest, PolicyError> {
        self.state.policy.list_agent_plugins(self.identity.id).await
    }
}

use serde::{Deserialize, Serialize};

use crate::plugin::PluginManifest;
use crate::rpc::error::{HandshakeError, PolicyError};
use crate::state::AgentId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub id: AgentId,
}

/// The RPC service the manager serves to connected agents.
///
/// The agent's full identity (peer address, certificate fingerprint)
/// is derived from the transport, not from these arguments.
#[tarpc::service]
pub trait ControlService {
    /// Confirm the connecting agent's registration. Succeeds once the
    /// identity is accepted in the inventory; unapproved identities
    /// become candidates and receive `PermissionDenied` until an
    /// operator (or auto-accept) registers them.
    async fn handshake(request: HandshakeRequest) -> Result<HandshakeRequest, HandshakeError>;

    /// The plugin set this agent must run, as filename to sha256.
    async fn list_agent_plugins() -> Result<PluginManifest, PolicyError>;
}

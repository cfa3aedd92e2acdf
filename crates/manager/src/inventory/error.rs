use jackadi_common::impl_into_status_code;
use jackadi_common::state::IdentityFieldDiff;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("agent identity is already a candidate")]
    AlreadyCandidate,
    #[error("agent identity was rejected by an operator")]
    Rejected,
    #[error("agent identity is already registered")]
    AlreadyRegistered,
    #[error("agent id is registered with a different identity: {}", render_diff(.0))]
    RogueAgent(Vec<IdentityFieldDiff>),
    #[error("agent not found")]
    AgentNotFound,
    /// The in-memory transition succeeded but the snapshot did not
    /// reach disk.
    #[error("failed to save registry: {0}")]
    RegistrySave(String),
}

fn render_diff(diff: &[IdentityFieldDiff]) -> String {
    diff.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl_into_status_code!(InventoryError, |e| match e {
    AlreadyCandidate | AlreadyRegistered => ::http::StatusCode::CONFLICT,
    Rejected => ::http::StatusCode::FORBIDDEN,
    RogueAgent(_) => ::http::StatusCode::CONFLICT,
    AgentNotFound => ::http::StatusCode::NOT_FOUND,
    RegistrySave(_) => ::http::StatusCode::INTERNAL_SERVER_ERROR,
});

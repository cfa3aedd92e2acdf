use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constant::ACTIVE_WINDOW;

/// Spec facts collected from one agent, keyed by plugin name.
pub type SpecsMap = serde_json::Map<String, serde_json::Value>;

/// Liveness and fact state tracked per accepted agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateInfo {
    pub connected: bool,
    /// When the current connected/disconnected state was entered.
    pub since: DateTime<Utc>,
    /// Last time a healthy response was observed from the agent.
    pub last_msg: DateTime<Utc>,
    #[serde(default)]
    pub specs: SpecsMap,
}

impl AgentStateInfo {
    pub fn new(connected: bool) -> Self {
        let now = Utc::now();
        Self {
            connected,
            since: now,
            last_msg: now,
            specs: SpecsMap::new(),
        }
    }

    pub fn mark_active(&mut self) {
        self.last_msg = Utc::now();
    }

    pub fn mark_state_change(&mut self, connected: bool) {
        self.connected = connected;
        self.since = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        Utc::now()
            .signed_duration_since(self.last_msg)
            .to_std()
            .map(|age| age <= ACTIVE_WINDOW)
            // last_msg in the future counts as active
            .unwrap_or(true)
    }
}

impl Default for AgentStateInfo {
    fn default() -> Self {
        Self::new(false)
    }
}

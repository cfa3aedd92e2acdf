use std::sync::Arc;
use std::time::Duration;

use jackadi_common::constant::SPECS_ALL_TASK;
use jackadi_common::message::{InternalError, TaskRequest, TaskResponse};
use jackadi_common::state::{AgentId, SpecsMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatch::AgentTask;
use crate::state::GlobalState;

/// Periodically asks every connected agent for its spec facts and
/// stores them in the inventory for query targeting.
pub async fn collection_task(state: Arc<GlobalState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.cli.spec_interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for id in state.inventory.connected_agents() {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                collect_one(&state, id).await;
            });
        }
    }
}

async fn collect_one(state: &GlobalState, id: AgentId) {
    let timeout = state.cli.task_timeout();
    let (response_tx, mut response_rx) = mpsc::channel::<TaskResponse>(2);
    let task = AgentTask {
        request: TaskRequest {
            task_name: SPECS_ALL_TASK.to_string(),
            timeout_secs: timeout.as_secs() as u32,
            ..Default::default()
        },
        response_tx,
    };

    if let Err(e) = state
        .dispatcher
        .send(id, task, state.cli.dispatch_timeout())
        .await
    {
        debug!("spec collection for agent {id} not dispatched: {e}");
        return;
    }

    let response = match tokio::time::timeout(timeout, response_rx.recv()).await {
        Ok(Some(response)) if response.internal_error == InternalError::Ok => response,
        Ok(Some(response)) => {
            debug!(
                "spec collection for agent {id} failed: {}",
                response.internal_error.as_ref()
            );
            return;
        }
        _ => {
            debug!("spec collection for agent {id} timed out");
            return;
        }
    };

    match serde_json::from_slice::<SpecsMap>(&response.output) {
        Ok(specs) => {
            if let Err(e) = state.inventory.set_spec(id, specs) {
                debug!("failed to store specs for agent {id}: {e}");
            }
        }
        Err(e) => warn!("agent {id} returned malformed specs: {e}"),
    }
}

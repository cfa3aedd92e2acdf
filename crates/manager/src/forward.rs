use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use jackadi_common::message::{
    GroupId, InputValue, InternalError, LockMode, RequestRecord, TaskRequest, TaskResponse,
};
use jackadi_common::state::AgentId;
use jackadi_common::targets::TargetMode;
use jackadi_common::util::now_nanos;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::dispatch::{AgentTask, DispatchError};
use crate::state::GlobalState;

/// One external execute request, before fan-out.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    pub target: String,
    #[serde(default)]
    pub mode: TargetMode,
    /// `plugin` or `plugin:task`.
    pub task: String,
    #[serde(default)]
    pub args: Vec<InputValue>,
    #[serde(default)]
    pub options: IndexMap<String, InputValue>,
    #[serde(default)]
    pub timeout_secs: u32,
    #[serde(default)]
    pub lock: LockMode,
}

/// Resolve the target set, fan the task out, and gather one response
/// per target. Disconnected and unreachable targets receive synthetic
/// responses; this function only fails on target resolution.
pub async fn forward(
    state: &GlobalState,
    req: ExecRequest,
) -> Result<(GroupId, HashMap<AgentId, TaskResponse>), DispatchError> {
    let targets =
        state
            .dispatcher
            .targeted_agents(&req.target, req.mode, |id| state.inventory.specs_of(id))?;

    let group_id = now_nanos();
    persist_request(state, group_id, &req, &targets);

    let effective = match req.timeout_secs {
        0 => state.cli.task_timeout(),
        secs => Duration::from_secs(u64::from(secs)),
    };
    // let the agent's own Timeout response win the race when both
    // expire together
    let response_wait = effective + Duration::from_secs(1);

    let collectors = targets.into_iter().map(|(id, ready)| {
        let req = req.clone();
        async move {
            if !ready {
                return (
                    id,
                    TaskResponse::internal(0, group_id, InternalError::Disconnected),
                );
            }

            let (response_tx, mut response_rx) = mpsc::channel(2);
            let task = AgentTask {
                request: TaskRequest {
                    task_id: 0,
                    group_id,
                    task_name: req.task,
                    args: req.args,
                    options: req.options,
                    timeout_secs: req.timeout_secs,
                    lock_override: req.lock,
                },
                response_tx,
            };

            match state
                .dispatcher
                .send(id, task, state.cli.dispatch_timeout())
                .await
            {
                Ok(()) => {}
                Err(DispatchError::AgentNotFound(_) | DispatchError::ClosedTaskChannel(_)) => {
                    return (
                        id,
                        TaskResponse::internal(0, group_id, InternalError::Disconnecting),
                    );
                }
                Err(_) => {
                    return (
                        id,
                        TaskResponse::internal(0, group_id, InternalError::Timeout),
                    );
                }
            }

            match tokio::time::timeout(response_wait, response_rx.recv()).await {
                Ok(Some(response)) => (id, response),
                _ => (
                    id,
                    TaskResponse::internal(0, group_id, InternalError::Timeout),
                ),
            }
        }
    });

    let responses = join_all(collectors).await.into_iter().collect();
    Ok((group_id, responses))
}

fn persist_request(
    state: &GlobalState,
    group_id: GroupId,
    req: &ExecRequest,
    targets: &HashMap<AgentId, bool>,
) {
    let mut record = RequestRecord {
        task_name: req.task.clone(),
        connected_targets: Vec::new(),
        disconnected_targets: Vec::new(),
    };
    for (id, ready) in targets {
        if *ready {
            record.connected_targets.push(*id);
        } else {
            record.disconnected_targets.push(*id);
        }
    }

    // persistence failures never block delivery
    if let Err(e) = state.results.store_request(group_id, &record) {
        error!("failed to persist request record {group_id}: {e}");
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::sync::Arc;

    use clap::Parser;
    use jackadi_common::db::JsonTree;
    use jackadi_common::util::OpaqueDebug;

    use super::*;
    use crate::cli::Cli;
    use crate::dispatch::Dispatcher;
    use crate::inventory::Inventory;
    use crate::policy::PolicyService;
    use crate::results::ResultsStore;

    fn id(s: &str) -> AgentId {
        AgentId::from_str(s).unwrap()
    }

    fn test_state(dir: &std::path::Path) -> Arc<GlobalState> {
        let cli = Cli::parse_from([
            "jackadi-manager",
            "--no-registry",
            "--dispatch-timeout",
            "1",
            "--task-timeout",
            "1",
        ]);
        let db = sled::open(dir.join("db")).unwrap();
        let records = JsonTree::new(db.open_tree("records").unwrap());
        Arc::new(GlobalState {
            cli,
            db: OpaqueDebug(db),
            inventory: Inventory::new(None),
            dispatcher: Dispatcher::new(),
            results: ResultsStore::new(records),
            policy: PolicyService::new(dir.join("plugins.yaml"), dir.join("plugins")),
            auth: None,
            shutdowns: Default::default(),
        })
    }

    fn exec_request(target: &str, mode: TargetMode) -> ExecRequest {
        ExecRequest {
            target: target.to_string(),
            mode,
            task: "disk:usage".to_string(),
            args: Vec::new(),
            options: IndexMap::new(),
            timeout_secs: 1,
            lock: LockMode::Unspecified,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fan_out_collects_per_agent_responses() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let mut rx = state.dispatcher.register_agent(id("web-1")).unwrap();
        let _rx2 = state.dispatcher.register_agent(id("web-2")).unwrap();
        state.dispatcher.close(id("web-2")).unwrap();

        // stand in for the stream handler: mint ids and echo
        let drain = tokio::spawn(async move {
            let mut next_id = 1;
            while let Some(AgentTask {
                mut request,
                response_tx,
            }) = rx.recv().await
            {
                request.task_id = next_id;
                next_id += 1;
                let response = TaskResponse {
                    task_id: request.task_id,
                    group_id: request.group_id,
                    output: b"\"ok\"".to_vec(),
                    ..Default::default()
                };
                let _ = response_tx.send(response).await;
            }
        });

        let (group_id, responses) = forward(&state, exec_request("web-*", TargetMode::Glob))
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[&id("web-1")].internal_error,
            InternalError::Ok
        );
        assert_eq!(responses[&id("web-1")].group_id, group_id);
        assert_eq!(
            responses[&id("web-2")].internal_error,
            InternalError::Disconnected
        );

        let record = state.results.get_request(group_id).unwrap().unwrap();
        assert_eq!(record.task_name, "disk:usage");
        assert_eq!(record.connected_targets, vec![id("web-1")]);
        assert_eq!(record.disconnected_targets, vec![id("web-2")]);

        drain.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fan_out_times_out_on_silent_agents() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        // registered, but nothing drains or answers
        let mut rx = state.dispatcher.register_agent(id("web-1")).unwrap();
        let drain = tokio::spawn(async move {
            while let Some(_task) = rx.recv().await {
                // swallow the task, never respond
            }
        });

        let (_, responses) = forward(&state, exec_request("web-1", TargetMode::Exact))
            .await
            .unwrap();
        assert_eq!(
            responses[&id("web-1")].internal_error,
            InternalError::Timeout
        );

        drain.abort();
    }

    #[tokio::test]
    async fn test_fan_out_requires_matching_targets() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        assert!(matches!(
            forward(&state, exec_request("ghost-*", TargetMode::Glob)).await,
            Err(DispatchError::NoMatchingAgents)
        ));
    }
}

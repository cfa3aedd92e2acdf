use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::stream::StreamExt;
use jackadi_common::constant::{
    AGENT_RETRY_DELAY, HEADER_CERT_FINGERPRINT, RESPONSE_CHANNEL_TIMEOUT,
};
use jackadi_common::message::{InternalError, TaskId, TaskRequest, TaskResponse};
use jackadi_common::rpc::control::ControlService;
use jackadi_common::rpc::RpcTransport;
use jackadi_common::state::{AgentId, AgentIdentity};
use jackadi_common::util::now_nanos;
use serde::Deserialize;
use tarpc::server::Channel;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rpc::{ControlRpcServer, MuxedMessageIncoming, MuxedMessageOutgoing};
use crate::dispatch::AgentTask;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub id: AgentId,
}

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
    Query(query): Query<AgentWsQuery>,
) -> Response {
    let addr = connect
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "local".to_string());
    let cert = headers
        .get(HEADER_CERT_FINGERPRINT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let identity = AgentIdentity::new(query.id, addr, cert);

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: AppState, identity: AgentIdentity) {
    let id = identity.id;

    // the shutdown token lets RequestShutdown end this handler
    let shutdown = CancellationToken::new();
    state.shutdowns.insert(id, shutdown.clone());

    // control RPC server facing this agent
    let (server_request_in, server_transport, mut server_response_out) = RpcTransport::new();
    let server = tarpc::server::BaseChannel::with_defaults(server_transport);
    let server_handle = tokio::spawn(
        server
            .execute(
                ControlRpcServer {
                    state: Arc::clone(&state),
                    identity: identity.clone(),
                }
                .serve(),
            )
            .for_each(|r| async move {
                tokio::spawn(r);
            }),
    );

    // task lanes between the socket loop and the exec lifecycle
    let (task_out_tx, mut task_out_rx) = mpsc::unbounded_channel::<TaskRequest>();
    let (resp_in_tx, resp_in_rx) = mpsc::unbounded_channel::<TaskResponse>();

    let exec_handle = tokio::spawn(exec_task_lifecycle(
        Arc::clone(&state),
        identity.clone(),
        task_out_tx,
        resp_in_rx,
        shutdown.clone(),
    ));

    loop {
        select! {
            // handle incoming messages
            msg = socket.recv() => {
                match msg {
                    Some(Err(e)) => {
                        error!("Agent {id} failed to receive a message: {e}");
                        break;
                    }
                    None => break,
                    Some(Ok(Message::Binary(bin))) => {
                        let msg = match bincode::deserialize(&bin) {
                            Ok(msg) => msg,
                            Err(e) => {
                                error!("Agent {id} failed to deserialize a message: {e}");
                                break;
                            }
                        };

                        match msg {
                            MuxedMessageIncoming::Rpc(msg) => {
                                if let Err(e) = server_request_in.send(msg) {
                                    error!("Agent {id} internal RPC channel closed: {e}");
                                    break;
                                }
                            }
                            MuxedMessageIncoming::Task(response) => {
                                if resp_in_tx.send(response).is_err() {
                                    error!("Agent {id} task routing channel closed");
                                    break;
                                }
                            }
                        }
                    }
                    _ => (),
                }
            }

            // handle outgoing RPC responses
            msg = server_response_out.recv() => {
                let Some(msg) = msg else {
                    error!("Agent {id} internal RPC channel closed");
                    break;
                };
                let bin = match bincode::serialize(&MuxedMessageOutgoing::Rpc(msg)) {
                    Ok(bin) => bin,
                    Err(e) => {
                        error!("Agent {id} failed to serialize response: {e}");
                        break;
                    }
                };
                if let Err(e) = socket.send(Message::Binary(bin)).await {
                    error!("Agent {id} failed to send response: {e}");
                    break;
                }
            }

            // handle outgoing task requests
            msg = task_out_rx.recv() => {
                let Some(request) = msg else {
                    break;
                };
                let bin = match bincode::serialize(&MuxedMessageOutgoing::Task(request)) {
                    Ok(bin) => bin,
                    Err(e) => {
                        error!("Agent {id} failed to serialize task request: {e}");
                        break;
                    }
                };
                if let Err(e) = socket.send(Message::Binary(bin)).await {
                    error!("Agent {id} failed to send task request: {e}");
                    break;
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    // abort the RPC server handle and wind down the exec lifecycle
    server_handle.abort();
    shutdown.cancel();
    drop(resp_in_tx);
    if let Err(e) = exec_handle.await {
        error!("Agent {id} exec lifecycle panicked: {e}");
    }

    // only reap our own token; a reconnecting agent may have already
    // replaced the entry with a live one
    state.shutdowns.remove_if(&id, |_, token| token.is_cancelled());

    info!("Agent {id} disconnected");
}

/// The per-agent stream lifecycle: wait for the identity to be
/// accepted, join the dispatcher, then pump tasks out and responses
/// back until the stream dies or shutdown is requested.
async fn exec_task_lifecycle(
    state: AppState,
    identity: AgentIdentity,
    task_out_tx: mpsc::UnboundedSender<TaskRequest>,
    mut resp_in_rx: mpsc::UnboundedReceiver<TaskResponse>,
    shutdown: CancellationToken,
) {
    let id = identity.id;

    loop {
        if state.inventory.is_accepted(&identity) {
            break;
        }
        select! {
            _ = tokio::time::sleep(AGENT_RETRY_DELAY) => {}
            _ = shutdown.cancelled() => return,
        }
    }

    // a fast reconnect can land before the previous handler finished
    // tearing down its channel entry
    let mut tasks_rx = loop {
        match state.dispatcher.register_agent(id) {
            Ok(rx) => break rx,
            Err(e) => {
                debug!("Agent {id} dispatcher registration pending: {e}");
                select! {
                    _ = tokio::time::sleep(AGENT_RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    };
    state.inventory.mark_state_change(id, true);
    info!("Agent {id} ready for tasks");

    let inflight: Arc<Mutex<HashMap<TaskId, mpsc::Sender<TaskResponse>>>> = Default::default();

    // drain the dispatcher channel outward, minting task ids and
    // recording waiters
    let outbound = {
        let inflight = Arc::clone(&inflight);
        let state = Arc::clone(&state);
        async move {
            while let Some(AgentTask {
                mut request,
                response_tx,
            }) = tasks_rx.recv().await
            {
                request.task_id = now_nanos();
                let request_timeout = match request.timeout_secs {
                    0 => state.cli.task_timeout(),
                    secs => Duration::from_secs(u64::from(secs)),
                };
                let reclaim_after = request_timeout + RESPONSE_CHANNEL_TIMEOUT;

                inflight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(request.task_id, response_tx);

                // reclaim the waiter entry once the response can no
                // longer be routed
                let inflight = Arc::clone(&inflight);
                let task_id = request.task_id;
                tokio::spawn(async move {
                    tokio::time::sleep(reclaim_after).await;
                    inflight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&task_id);
                });

                if task_out_tx.send(request).is_err() {
                    break;
                }
            }
        }
    };

    // route responses inward: persist, refresh liveness, wake waiters
    let inbound = {
        let inflight = Arc::clone(&inflight);
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        async move {
            loop {
                select! {
                    _ = shutdown.cancelled() => break,
                    msg = resp_in_rx.recv() => {
                        let Some(response) = msg else { break };
                        handle_response(&state, id, &inflight, response).await;
                    }
                }
            }
        }
    };

    select! {
        _ = outbound => {}
        _ = inbound => {}
    }

    if let Err(e) = state.dispatcher.close(id) {
        debug!("Agent {id} channel close: {e}");
    }
    if let Err(e) = state.dispatcher.unregister_agent(id) {
        debug!("Agent {id} unregister: {e}");
    }
    state.inventory.mark_state_change(id, false);

    // a requested shutdown also erases the agent from the
    // dispatchable map
    if shutdown.is_cancelled() && !state.shutdowns.contains_key(&id) {
        let _ = state.dispatcher.forget(id);
    }
}

async fn handle_response(
    state: &AppState,
    id: AgentId,
    inflight: &Mutex<HashMap<TaskId, mpsc::Sender<TaskResponse>>>,
    response: TaskResponse,
) {
    // a started-timeout is followed by the real result; storing both
    // would duplicate the record
    if response.internal_error != InternalError::StartedTimeout {
        if let Err(e) = state.results.store_result(id, &response) {
            error!("failed to persist result {} from agent {id}: {e}", response.task_id);
        }
    }

    if response.internal_error == InternalError::Ok {
        state.inventory.mark_active(id);
    }

    let waiter = inflight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&response.task_id)
        .cloned();

    match waiter {
        Some(tx) => {
            let task_id = response.task_id;
            match tokio::time::timeout(RESPONSE_CHANNEL_TIMEOUT, tx.send(response)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("Agent {id} response {task_id} waiter already gone"),
                Err(_) => warn!("Agent {id} response {task_id} could not be handed to its waiter"),
            }
        }
        None => debug!(
            "Agent {id} response {} has no waiter, dropping",
            response.task_id
        ),
    }
}

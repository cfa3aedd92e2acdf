use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use http::Uri;
use jackadi_common::constant::{AGENT_RETRY_DELAY, PING_INTERVAL};
use jackadi_common::rpc::control::{ControlServiceClient, HandshakeRequest};
use jackadi_common::rpc::error::HandshakeError;
use jackadi_common::rpc::{RpcTransport, PING_HEADER, PING_LENGTH};
use tarpc::context;
use tokio::select;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, handshake::client::Request},
};
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::rpc::{MuxedMessageIncoming, MuxedMessageOutgoing};
use crate::state::AppState;

pub fn new_ws_request(ws_uri: &Uri) -> Request {
    ws_uri
        .to_owned()
        .into_client_request()
        .expect("build websocket request")
}

pub async fn ws_connection(ws_req: Request, state: AppState) {
    let (mut stream, _response) = match connect_async(ws_req).await {
        Ok(res) => res,
        Err(e) => {
            error!("failed to connect to websocket: {e}");
            return;
        }
    };

    info!("Connection established with the manager");

    // create rpc channels
    let (client_response_in, client_transport, mut client_request_out) = RpcTransport::new();

    // set up the client, facing the manager
    let client =
        ControlServiceClient::new(tarpc::client::Config::default(), client_transport).spawn();
    state.client.write().await.replace(client.clone());

    // keep handshaking until the manager accepts this identity
    let handshake_handle = tokio::spawn(handshake_loop(client, Arc::clone(&state)));

    // wire an engine to this stream; the discipline primitives are
    // shared through the state so reconnects keep their accounting
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    let engine = Engine {
        host: Arc::clone(&state.host),
        requests_queue: Arc::clone(&state.requests_queue),
        running_tasks: Arc::clone(&state.running_tasks),
        running_write_task: Arc::clone(&state.running_write_task),
        exclusive_lock: Arc::clone(&state.exclusive_lock),
        task_timeout: state.cli.task_timeout(),
        responses: response_tx,
        shutdown: state.shutdown.clone(),
        workers: state.workers.clone(),
    };
    tokio::spawn(engine.run(request_rx));

    let start_time = Instant::now();
    let mut interval = tokio::time::interval(PING_INTERVAL);
    let mut num_pings: u32 = 0;

    loop {
        select! {
            _ = interval.tick() => {
                // ping payload contains the agent header, number of
                // pings, and uptime
                let mut payload = Vec::from(PING_HEADER);
                payload.extend_from_slice(&num_pings.to_le_bytes());
                payload.extend_from_slice(&start_time.elapsed().as_micros().to_le_bytes());

                let send = stream.send(tungstenite::Message::Ping(payload));
                if tokio::time::timeout(Duration::from_secs(10), send).await.is_err() {
                    error!("The connection to the manager was interrupted while sending ping");
                    break;
                }
            }

            // handle outgoing requests
            msg = client_request_out.recv() => {
                let Some(msg) = msg else {
                    error!("internal agent RPC channel closed");
                    break;
                };
                let bin = match bincode::serialize(&MuxedMessageOutgoing::Rpc(msg)) {
                    Ok(bin) => bin,
                    Err(e) => {
                        error!("failed to serialize request: {e}");
                        continue;
                    }
                };
                let send = stream.send(tungstenite::Message::Binary(bin));
                if tokio::time::timeout(Duration::from_secs(10), send).await.is_err() {
                    error!("The connection to the manager was interrupted while sending rpc message");
                    break;
                }
            }

            // handle outgoing task responses
            msg = response_rx.recv() => {
                let Some(response) = msg else {
                    error!("internal engine response channel closed");
                    break;
                };
                let bin = match bincode::serialize(&MuxedMessageOutgoing::Task(response)) {
                    Ok(bin) => bin,
                    Err(e) => {
                        error!("failed to serialize response: {e}");
                        continue;
                    }
                };
                let send = stream.send(tungstenite::Message::Binary(bin));
                if tokio::time::timeout(Duration::from_secs(10), send).await.is_err() {
                    error!("The connection to the manager was interrupted while sending task response");
                    break;
                }
            }

            // handle incoming messages
            msg = stream.next() => match msg {
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        info!("The manager has closed the connection: {frame}");
                    } else {
                        info!("The manager has closed the connection");
                    }
                    break;
                }

                Some(Ok(tungstenite::Message::Pong(payload))) => {
                    let mut payload = payload.as_slice();
                    // check the header
                    if !payload.starts_with(PING_HEADER) {
                        warn!("Received a pong payload with an invalid header prefix");
                        continue;
                    }
                    payload = &payload[PING_HEADER.len()..];
                    if payload.len() != PING_LENGTH {
                        warn!("Received a pong payload with an invalid length {}, expected {PING_LENGTH}", payload.len());
                        continue;
                    }
                    let (left, _right) = payload.split_at(size_of::<u32>());
                    let ping_index = u32::from_le_bytes(left.try_into().unwrap());

                    if ping_index != num_pings {
                        warn!("Received a pong payload with an invalid index {ping_index}, expected {num_pings}");
                        continue;
                    }

                    num_pings += 1;
                }

                Some(Ok(tungstenite::Message::Binary(bin))) => {
                    let msg = match bincode::deserialize(&bin) {
                        Ok(msg) => msg,
                        Err(e) => {
                            error!("failed to deserialize a message from the manager: {e}");
                            continue;
                        }
                    };

                    match msg {
                        MuxedMessageIncoming::Rpc(msg) => {
                            if let Err(e) = client_response_in.send(msg) {
                                error!("internal agent RPC channel closed: {e}");
                                break;
                            }
                        }
                        MuxedMessageIncoming::Task(request) => {
                            if request_tx.send(request).is_err() {
                                error!("internal engine request channel closed");
                                break;
                            }
                        }
                    }
                }

                None | Some(Err(_)) => {
                    error!("The connection to the manager was interrupted");
                    break;
                }

                Some(Ok(_)) => (),
            },

            _ = state.shutdown.cancelled() => {
                let _ = stream.send(tungstenite::Message::Close(None)).await;
                break;
            }
        }
    }

    handshake_handle.abort();
}

/// Handshake with the manager until it accepts this agent; a fresh
/// install sits in the candidate set until an operator approves it.
async fn handshake_loop(client: ControlServiceClient, state: AppState) {
    loop {
        match client
            .handshake(
                context::current(),
                HandshakeRequest { id: state.cli.id },
            )
            .await
        {
            Ok(Ok(_)) => {
                info!("The manager accepted this agent");
                // refresh plugins right away now that policy applies
                state.sync_requests.notify_one();
                return;
            }
            Ok(Err(HandshakeError::PermissionDenied)) => {
                info!("Waiting for operator approval...");
            }
            Ok(Err(e)) => warn!("Handshake refused: {e}"),
            Err(e) => warn!("Handshake RPC failed: {e}"),
        }

        tokio::time::sleep(AGENT_RETRY_DELAY).await;
    }
}

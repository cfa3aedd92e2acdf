mod cli;
mod client;
mod engine;
mod host;
mod log;
mod plugins;
mod rpc;
mod state;

use std::sync::Arc;

use clap::Parser;
use cli::Cli;
use futures_util::stream::{FuturesUnordered, StreamExt};
use jackadi_common::constant::{GRACEFUL_SHUTDOWN_TIMEOUT, RECONNECT_DELAY};
use log::init_logging;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

use crate::host::ProcessHost;
use crate::state::GlobalState;

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let (_guard, _reload_handler) = init_logging();

    let args = Cli::parse();
    let (endpoint, ws_uri) = args.endpoint_and_uri();
    info!("Using endpoint {endpoint}");

    tokio::fs::create_dir_all(&args.plugin_dir)
        .await
        .expect("failed to create plugin directory");

    let host = Arc::new(ProcessHost::load(args.plugin_dir.clone()).await);
    let state = Arc::new(GlobalState::new(args, endpoint, Arc::clone(&host) as _));

    // the task stream, reconnecting until shutdown
    let conn_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let req = client::new_ws_request(&ws_uri);
            client::ws_connection(req, Arc::clone(&conn_state)).await;
            if conn_state.shutdown.is_cancelled() {
                break;
            }
            conn_state.client.write().await.take();
            info!("Attempting to reconnect to the manager...");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });

    // keep the local plugin set aligned with manager policy
    tokio::spawn(plugins::sync_task(Arc::clone(&state)));

    // SIGHUP shuts down like the rest; config changes take a restart
    let mut interrupt = Signals::new(&[
        SignalKind::terminate(),
        SignalKind::interrupt(),
        SignalKind::quit(),
        SignalKind::hangup(),
    ]);
    interrupt.recv_any().await;

    info!("Received interrupt signal, shutting down...");
    state.shutdown.cancel();
    state.workers.close();
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, state.workers.wait())
        .await
        .is_err()
    {
        warn!("in-flight tasks did not finish in time, force-killing plugin subprocesses");
        host.force_kill_all();
    }
    info!("Agent has shut down gracefully");
}

struct Signals {
    signals: Vec<Signal>,
}

impl Signals {
    fn new(kinds: &[SignalKind]) -> Self {
        Self {
            signals: kinds.iter().map(|k| signal(*k).unwrap()).collect(),
        }
    }

    async fn recv_any(&mut self) {
        let mut futs = FuturesUnordered::new();

        for sig in self.signals.iter_mut() {
            futs.push(sig.recv());
        }

        futs.next().await;
    }
}

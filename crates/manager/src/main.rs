use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use cli::Cli;
use jackadi_common::db::JsonTree;
use jackadi_common::util::OpaqueDebug;
use tokio::select;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{prelude::*, reload, EnvFilter};

use crate::auth::Authenticator;
use crate::dispatch::Dispatcher;
use crate::inventory::Inventory;
use crate::policy::PolicyService;
use crate::results::ResultsStore;
use crate::state::GlobalState;

pub mod auth;
pub mod cli;
pub mod dispatch;
pub mod forward;
pub mod inventory;
pub mod policy;
pub mod results;
pub mod server;
pub mod specs;
pub mod state;

type ReloadHandler = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn make_env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var("JACKADI_LOG")
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper_util=off".parse().unwrap())
        .add_directive("hyper=off".parse().unwrap())
        .add_directive("tungstenite=off".parse().unwrap())
        .add_directive("tokio_tungstenite=off".parse().unwrap())
        .add_directive("tarpc::client=ERROR".parse().unwrap())
        .add_directive("tarpc::server=ERROR".parse().unwrap())
        .add_directive("tower_http::trace::on_request=off".parse().unwrap())
        .add_directive("tower_http::trace::on_response=off".parse().unwrap())
}

#[tokio::main]
async fn main() {
    let filter_level = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let (env_filter, _reload_handler): (_, ReloadHandler) =
        reload::Layer::new(make_env_filter(filter_level));
    let (stdout, _guard) = tracing_appender::non_blocking(io::stdout());
    let output = tracing_subscriber::fmt::layer().with_writer(stdout);
    let output = if cfg!(debug_assertions) {
        output.with_file(true).with_line_number(true)
    } else {
        output
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(output)
        .try_init()
        .unwrap();

    let cli = Cli::parse();

    trace!("Creating store");
    std::fs::create_dir_all(&cli.path).expect("create manager data path");
    let db = jackadi_common::db::open(&cli.database_path()).expect("open database");
    let records = JsonTree::new(db.open_tree("records").expect("open records tree"));

    let auth = cli.http_auth.as_ref().map(|credentials| {
        Authenticator::load(credentials, cli.authorization.as_deref())
            .expect("load HTTP credentials")
    });
    if auth.is_none() {
        warn!("HTTP API authentication is disabled");
    }

    let inventory = Inventory::new(cli.registry_path());
    if let Err(e) = inventory.load_registry() {
        error!("failed to load registry snapshot: {e}");
    }

    let socket_addr = SocketAddr::new(cli.bind_addr, cli.port);
    let policy = PolicyService::new(cli.plugin_policy.clone(), cli.plugin_dir.clone());

    trace!("Loading state");
    let state = Arc::new(GlobalState {
        cli,
        db: OpaqueDebug(db),
        inventory,
        dispatcher: Dispatcher::new(),
        results: ResultsStore::new(records),
        policy,
        auth,
        shutdowns: Default::default(),
    });

    // collect fleet specs for query targeting
    let specs_task = tokio::spawn(specs::collection_task(Arc::clone(&state)));

    // reclaim expired result records
    let sweep_state = Arc::clone(&state);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            match sweep_state.results.sweep() {
                Ok(0) => {}
                Ok(n) => info!("swept {n} expired records"),
                Err(e) => error!("record sweep failed: {e}"),
            }
        }
    });

    let unix_task = tokio::spawn(server::start_unix(Arc::clone(&state)));

    info!("Starting server on {socket_addr}");
    select! {
        Err(err) = server::start(Arc::clone(&state), socket_addr) => {
            error!("error starting server: {err:?}");
        }
        Ok(Err(err)) = unix_task => {
            error!("error serving operator socket: {err:?}");
        }
        Err(err) = specs_task => {
            error!("spec collection task failed: {err:?}");
        }
        Err(err) = sweep_task => {
            error!("record sweep task failed: {err:?}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            // wind down every agent stream before exiting
            for id in state.inventory.connected_agents() {
                state.request_shutdown(id);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

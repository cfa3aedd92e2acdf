use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use axum::{routing::get, Router};
use hyper::body::Incoming;
use jackadi_common::constant::{AGENT_WS_ROUTE, PLUGIN_CONTENT_ROUTE};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tower::{Service, ServiceExt};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use self::error::StartError;
use crate::state::AppState;

mod agent_ws;
pub mod api;
mod content;
pub mod error;
pub mod rpc;

fn app(state: &AppState) -> Router {
    Router::new()
        .route(AGENT_WS_ROUTE, get(agent_ws::agent_ws_handler))
        .nest("/api/v1", api::apply_auth(api::routes(), state))
        .nest(PLUGIN_CONTENT_ROUTE, content::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(state))
}

/// Serve agent and operator traffic over TCP.
pub async fn start(state: AppState, socket_addr: SocketAddr) -> Result<(), StartError> {
    let app = app(&state);

    let listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .map_err(StartError::TcpBind)?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(StartError::Serve)?;

    Ok(())
}

/// Serve the same router on the local unix socket for the CLI.
pub async fn start_unix(state: AppState) -> Result<(), StartError> {
    let path = state.cli.socket_path.clone();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(&path);

    let listener = tokio::net::UnixListener::bind(&path).map_err(StartError::SocketBind)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
        .map_err(StartError::SocketBind)?;
    info!("Operator socket listening on {}", path.display());

    let mut make_service = app(&state).into_make_service();

    loop {
        let (socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("unix socket accept failed: {e}");
                continue;
            }
        };

        let tower_service = match make_service.call(&socket).await {
            Ok(service) => service,
            Err(never) => match never {},
        };

        tokio::spawn(async move {
            let socket = TokioIo::new(socket);
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                    tower_service.clone().oneshot(request)
                });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(socket, hyper_service)
                .await
            {
                error!("failed to serve unix socket connection: {e:?}");
            }
        });
    }
}

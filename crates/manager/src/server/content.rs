use axum::{
    extract::{Path, Request, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use http::StatusCode;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::error::ServerError;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new().route("/:filename", get(get_plugin).head(get_plugin))
}

/// Serve one plugin binary out of the manager's plugin directory.
async fn get_plugin(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    req: Request,
) -> Response {
    // plugin names are flat files, never paths
    if filename.contains('/') || filename.contains("..") {
        return ServerError::BadRequest(format!("invalid plugin name `{filename}`")).into_response();
    }

    let path = state.cli.plugin_dir.join(&filename);
    match ServeFile::new(path).oneshot(req).await {
        Ok(res) if res.status() == StatusCode::NOT_FOUND => {
            ServerError::NotFound(format!("plugin `{filename}`")).into_response()
        }
        Ok(res) => res.into_response(),
        Err(never) => match never {},
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use http::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use jackadi_common::message::{GroupId, TaskId, TaskResponse};
use jackadi_common::plugin::parse_task_name;
use jackadi_common::state::{AgentId, AgentIdentity};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ServerError;
use crate::forward::{forward, ExecRequest};
use crate::results::ListParams;
use crate::state::{AppState, GlobalState};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/agents", get(get_agents))
        .route("/agents/:id/accept", post(accept_agent))
        .route("/agents/:id/reject", post(reject_agent))
        .route("/agents/:id", delete(remove_agent))
        .route("/run", post(run_task))
        .route("/results", get(list_results))
        .route("/results/:id", get(get_result))
        .route("/requests/:id", get(get_request))
}

/// Authenticated user attached to the request by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(req).await;
    };

    let user = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| auth.verify_basic(header));

    match user {
        Some(user) => {
            req.extensions_mut().insert(AuthedUser(user));
            next.run(req).await
        }
        None => {
            let mut response = ServerError::Unauthenticated.into_response();
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"jackadi\""),
            );
            response
        }
    }
}

/// Endpoint-level RBAC; a no-op when auth or RBAC is not configured.
fn authorize(
    state: &GlobalState,
    user: &Option<Extension<AuthedUser>>,
    resource: &str,
    action: &str,
) -> Result<(), ServerError> {
    let (Some(auth), Some(Extension(AuthedUser(user)))) = (&state.auth, user) else {
        return Ok(());
    };
    if auth.allows_endpoint(user, resource, action) {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

#[derive(Debug, Serialize)]
struct AgentEntry {
    id: AgentId,
    addr: String,
    connected: bool,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_msg: Option<chrono::DateTime<chrono::Utc>>,
}

async fn get_agents(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "agents", "list")?;

    let snapshot = state.inventory.list();
    let accepted: Vec<AgentEntry> = snapshot
        .accepted
        .values()
        .map(|identity| {
            let state_info = snapshot.states.get(&identity.id);
            AgentEntry {
                id: identity.id,
                addr: identity.addr.clone(),
                connected: state_info.is_some_and(|s| s.connected),
                active: state_info.is_some_and(|s| s.is_active()),
                last_msg: state_info.map(|s| s.last_msg),
            }
        })
        .collect();

    Ok(Json(json!({
        "accepted": accepted,
        "candidates": snapshot.candidates,
        "rejected": snapshot.rejected,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct IdentityQuery {
    addr: Option<String>,
    cert: Option<String>,
    #[serde(default)]
    allow_rejected: bool,
}

/// Resolve an id plus optional address/cert filters to exactly one
/// identity from the given candidates.
fn resolve_identity(
    mut matches: Vec<AgentIdentity>,
) -> Result<AgentIdentity, ServerError> {
    match matches.len() {
        0 => Err(ServerError::NotFound("agent identity".to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(ServerError::AmbiguousIdentity),
    }
}

async fn accept_agent(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Path(id): Path<AgentId>,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "agents", "accept")?;

    let mut matches = state.inventory.get_matching_candidates(
        id,
        query.addr.as_deref(),
        query.cert.as_deref(),
    );
    if query.allow_rejected {
        matches.extend(state.inventory.get_matching_rejected(
            id,
            query.addr.as_deref(),
            query.cert.as_deref(),
        ));
    }

    let identity = resolve_identity(matches)?;
    state.inventory.register(&identity, query.allow_rejected)?;
    Ok(Json(json!({ "accepted": identity })))
}

async fn reject_agent(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Path(id): Path<AgentId>,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "agents", "reject")?;

    let mut matches =
        state
            .inventory
            .get_matching_accepted(id, query.addr.as_deref(), query.cert.as_deref());
    matches.extend(state.inventory.get_matching_candidates(
        id,
        query.addr.as_deref(),
        query.cert.as_deref(),
    ));

    let identity = resolve_identity(matches)?;
    state.inventory.reject(&identity)?;
    Ok(Json(json!({ "rejected": identity })))
}

async fn remove_agent(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Path(id): Path<AgentId>,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "agents", "remove")?;

    let mut matches =
        state
            .inventory
            .get_matching_accepted(id, query.addr.as_deref(), query.cert.as_deref());
    matches.extend(state.inventory.get_matching_candidates(
        id,
        query.addr.as_deref(),
        query.cert.as_deref(),
    ));
    matches.extend(state.inventory.get_matching_rejected(
        id,
        query.addr.as_deref(),
        query.cert.as_deref(),
    ));

    let identity = resolve_identity(matches)?;
    state.inventory.remove(&identity)?;
    Ok(Json(json!({ "removed": identity })))
}

/// Per-agent entry of the execute response envelope.
#[derive(Debug, Serialize)]
struct ExecResponseEntry {
    #[serde(rename = "Id")]
    id: AgentId,
    #[serde(rename = "GroupID")]
    group_id: GroupId,
    /// The task output re-emitted as raw JSON.
    #[serde(rename = "Output")]
    output: serde_json::Value,
    #[serde(rename = "Error")]
    error: String,
    #[serde(rename = "Retcode")]
    retcode: i32,
    #[serde(rename = "InternalError")]
    internal_error: String,
    #[serde(rename = "ModuleError")]
    module_error: String,
}

fn envelope_entry(id: AgentId, response: TaskResponse) -> ExecResponseEntry {
    let output = match response.output.is_empty() {
        true => serde_json::Value::Null,
        false => serde_json::from_slice(&response.output)
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&response.output))),
    };
    ExecResponseEntry {
        id,
        group_id: response.group_id,
        output,
        error: response.task_error,
        retcode: response.retcode,
        internal_error: match response.internal_error {
            jackadi_common::message::InternalError::Ok => String::new(),
            other => other.as_ref().to_string(),
        },
        module_error: response.module_error,
    }
}

async fn run_task(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<HashMap<AgentId, ExecResponseEntry>>, ServerError> {
    authorize(&state, &user, "task", "exec")?;

    let Some(task_name) = parse_task_name(&req.task) else {
        return Err(ServerError::BadRequest(format!(
            "malformed task name `{}`",
            req.task
        )));
    };
    if let (Some(auth), Some(Extension(AuthedUser(user)))) = (&state.auth, &user) {
        if !auth.allows_task(user, task_name.plugin, task_name.task) {
            return Err(ServerError::Forbidden);
        }
    }

    let (_, responses) = forward(&state, req).await?;
    Ok(Json(
        responses
            .into_iter()
            .map(|(id, response)| (id, envelope_entry(id, response)))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
    from_date: Option<TaskId>,
    to_date: Option<TaskId>,
    /// Comma-separated agent ids.
    targets: Option<String>,
}

async fn list_results(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "results", "list")?;

    let targets = match query.targets.as_deref() {
        Some(targets) => Some(
            jackadi_common::targets::parse_id_list(targets)
                .map_err(|e| ServerError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };

    let rows = state.results.list_results(&ListParams {
        offset: query.offset,
        limit: query.limit,
        from_date: query.from_date,
        to_date: query.to_date,
        targets,
    });
    Ok(Json(json!({ "results": rows })))
}

async fn get_result(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Path(id): Path<TaskId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "results", "get")?;

    match state.results.get_result(id)? {
        Some(result) => Ok(Json(json!(result))),
        None => Err(ServerError::NotFound(format!("result {id}"))),
    }
}

async fn get_request(
    State(state): State<AppState>,
    user: Option<Extension<AuthedUser>>,
    Path(id): Path<GroupId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize(&state, &user, "requests", "get")?;

    match state.results.get_request(id)? {
        Some(request) => Ok(Json(json!(request))),
        None => Err(ServerError::NotFound(format!("request {id}"))),
    }
}

pub(super) fn apply_auth(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    router.layer(middleware::from_fn_with_state(
        Arc::clone(state),
        auth_middleware,
    ))
}

use axum::{response::IntoResponse, Json};
use http::StatusCode;
use jackadi_common::db::DatabaseError;
use jackadi_common::{impl_into_status_code, impl_into_type_str};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use thiserror::Error;

use crate::auth::AuthError;
use crate::dispatch::DispatchError;
use crate::inventory::InventoryError;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind TCP listener: {0}")]
    TcpBind(#[source] std::io::Error),
    #[error("failed to bind unix socket: {0}")]
    SocketBind(#[source] std::io::Error),
    #[error("failed to serve: {0}")]
    Serve(#[source] std::io::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Error, strum_macros::AsRefStr)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("agent identity is ambiguous, pass addr to disambiguate")]
    AmbiguousIdentity,
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl_into_status_code!(ServerError, |value| match value {
    NotFound(_) => StatusCode::NOT_FOUND,
    BadRequest(_) => StatusCode::BAD_REQUEST,
    Unauthenticated => StatusCode::UNAUTHORIZED,
    Forbidden => StatusCode::FORBIDDEN,
    AmbiguousIdentity => StatusCode::CONFLICT,
    Inventory(e) => e.into(),
    Dispatch(e) => e.into(),
    Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
});

impl_into_type_str!(ServerError);

impl Serialize for ServerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("type", &String::from(self))?;
        state.serialize_field("error", &self.to_string())?;

        state.end()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from(&self);
        let mut response = Json(&self).into_response();
        *response.status_mut() = status;
        response
    }
}

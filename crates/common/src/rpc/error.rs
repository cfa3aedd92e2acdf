use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use thiserror::Error;

use crate::state::IdentityFieldDiff;

#[macro_export]
macro_rules! impl_into_type_str {
    ($name:path) => {
        impl From<&$name> for String {
            fn from(e: &$name) -> Self {
                e.as_ref().to_string()
            }
        }
    };

    ($name:path, |_| $body:expr) => {
        impl From<&$name> for String {
            fn from(_: &$name) -> Self {
                $body
            }
        }
    };

    ($name:path, |$from_var:ident| $body:expr) => {
        impl From<&$name> for String {
            fn from($from_var: &$name) -> Self {
                use $name::*;

                $body
            }
        }
    };
}

#[macro_export]
macro_rules! impl_into_status_code {
    ($name:path) => {
        impl From<&$name> for ::http::status::StatusCode {
            fn from(_: &$name) -> Self {
                Self::INTERNAL_SERVER_ERROR
            }
        }
    };

    ($name:path, |_| $body:expr) => {
        impl From<&$name> for ::http::status::StatusCode {
            fn from(_: &$name) -> Self {
                $body
            }
        }
    };

    ($name:path, |$from_var:ident| $body:expr) => {
        impl From<&$name> for ::http::status::StatusCode {
            fn from($from_var: &$name) -> Self {
                use $name::*;

                $body
            }
        }
    };
}

fn render_diff(diff: &[IdentityFieldDiff]) -> String {
    diff.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error, Serialize, Deserialize, AsRefStr)]
pub enum HandshakeError {
    #[error("agent is pending operator approval")]
    PermissionDenied,
    #[error("agent identity was rejected by an operator")]
    Rejected,
    #[error("agent id already registered with a different identity: {}", render_diff(.0))]
    RogueAgent(Vec<IdentityFieldDiff>),
    #[error("identity presented over the stream does not match the request")]
    IdentityMismatch,
    #[error("inventory error: {0}")]
    Internal(String),
}

#[derive(Debug, Error, Serialize, Deserialize, AsRefStr)]
pub enum PolicyError {
    #[error("plugin policy unavailable: {0}")]
    Unavailable(String),
}

impl_into_status_code!(HandshakeError, |e| match e {
    PermissionDenied | Rejected => ::http::StatusCode::FORBIDDEN,
    RogueAgent(_) | IdentityMismatch => ::http::StatusCode::CONFLICT,
    Internal(_) => ::http::StatusCode::INTERNAL_SERVER_ERROR,
});

//! Error types shared by the allocation authority and its clients.
//!
//! The server turns every [`Error`] into a JSON [`ErrorBody`] with a matching
//! HTTP status (see [`Error::status_code`]); the client turns a non-2xx
//! response back into [`Error::Remote`].

use crate::ErrorBody;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the allocation protocol.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The request was malformed: empty or unsupported biz tag, bad step.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Every optimistic update attempt lost to a concurrent writer.
    #[error("Allocation for `{biz_tag}` exhausted after {attempts} attempts")]
    AllocationExhausted { biz_tag: String, attempts: u32 },

    /// A request arrived while the service was shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The record store or another server-side dependency failed.
    #[error("Internal error: {context}")]
    Internal { context: String },

    /// The request never produced a response: connect, timeout, bad body.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The authority answered with an error status.
    #[error("Authority returned {status}: {message}")]
    Remote { status: u16, message: String },
}

impl Error {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn internal(context: impl core::fmt::Display) -> Self {
        Self::Internal {
            context: context.to_string(),
        }
    }

    pub fn transport(context: impl core::fmt::Display) -> Self {
        Self::Transport {
            context: context.to_string(),
        }
    }

    /// HTTP status the server answers with for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::AllocationExhausted { .. } => 409,
            Self::ServiceShutdown => 503,
            Self::Internal { .. } | Self::Transport { .. } => 500,
            Self::Remote { status, .. } => *status,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.status_code(),
            message: self.to_string(),
        }
    }
}

#[cfg(feature = "server")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self.to_body())).into_response()
    }
}

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    thiserror::Error,
};

/// Failures surfaced by the relay.
///
/// Only `Validation`, `SessionBusy` and `UnknownSession` reach an HTTP caller
/// synchronously; producer-side failures are turned into a terminal `error`
/// event on the session's channel.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("session {0} already has a request in flight")]
    SessionBusy(String),

    #[error("session not found: {0}")]
    UnknownSession(String),

    #[error("session {0} is already being drained")]
    AlreadyDraining(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("consumer for session {0} went away")]
    ConsumerGone(String),

    #[error("{0}")]
    Producer(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionBusy(_) | Self::AlreadyDraining(_) => StatusCode::CONFLICT,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::Cancelled | Self::ConsumerGone(_) | Self::Producer(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Missing {0}")]
    Validation(String),
    #[error("No conversation ID found")]
    ConversationNotFound,
    #[error("No AI message found")]
    NoAiMessage,
    #[error("token store error: {0}")]
    Token(String),
    #[error("{0}")]
    Downstream(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::ConversationNotFound | RelayError::NoAiMessage => StatusCode::NOT_FOUND,
            RelayError::Token(_)
            | RelayError::Downstream(_)
            | RelayError::Timeout(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps a transport failure from `reqwest`, keeping timeouts distinct.
    pub fn from_transport(what: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(what.to_string())
        } else {
            RelayError::Downstream(format!("{what} request failed: {err}"))
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

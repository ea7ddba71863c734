//! Relay error type and its JSON rendering.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::protocol::DeploymentMode;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),

    /// An upstream call answered with a non-success status.
    #[error("{context}: {status} - {body}")]
    Upstream {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("No session ID returned from Agent Engine")]
    MissingSessionId,

    #[error("Failed to get auth headers: {0}")]
    Auth(String),

    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Anything that escaped the handler; rendered without internals.
    #[error("Failed to process request in {mode} mode: {message}")]
    Unexpected {
        mode: DeploymentMode,
        message: String,
    },
}

impl RelayError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Reads the body of a failed upstream response into an error.
    pub async fn from_response(context: &'static str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::Upstream {
            context,
            status,
            body,
        }
    }

    /// Folds failures that are not part of the documented taxonomy into
    /// [`RelayError::Unexpected`] so they render with diagnostics.
    pub fn with_mode(self, mode: DeploymentMode) -> Self {
        match self {
            Self::Auth(_) | Self::Transport(_) => Self::Unexpected {
                mode,
                message: self.to_string(),
            },
            other => other,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::MissingSessionId
            | Self::Auth(_)
            | Self::Transport(_)
            | Self::Unexpected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<DeploymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_agent_engine: Option<bool>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            Self::Unexpected { mode, message } => {
                error!(mode = %mode, message = %message, "Unexpected relay failure");
                ErrorResponse {
                    error: "Internal server error".to_string(),
                    deployment_mode: Some(*mode),
                    use_agent_engine: Some(mode.uses_agent_engine()),
                }
            }
            other => {
                if status.is_server_error() {
                    error!(status = status.as_u16(), error = %other, "Relay error");
                } else {
                    debug!(status = status.as_u16(), error = %other, "Client error");
                }
                ErrorResponse {
                    error: other.to_string(),
                    deployment_mode: None,
                    use_agent_engine: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

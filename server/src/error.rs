//! Error types for the messaging core.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by a `DocumentStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A party may hold at most one room that is not closed.
    #[error("party {party_id} already has an open room")]
    PartyHasOpenRoom { party_id: String },

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

/// Errors returned by session, roster and log operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Closed rooms are inert until teardown removes them.
    #[error("room {0} is closed")]
    RoomClosed(String),

    #[error("transition rejected for room {room_id}: {reason}")]
    Precondition {
        room_id: String,
        reason: &'static str,
    },

    #[error("room {room_id} already claimed by {agent_id}")]
    AlreadyClaimed { room_id: String, agent_id: String },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("attachment could not be resolved: {0}")]
    Attachment(String),
}

impl CoreError {
    pub fn precondition(room_id: &str, reason: &'static str) -> Self {
        Self::Precondition {
            room_id: room_id.to_string(),
            reason,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::RoomNotFound(_) | CoreError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::RoomClosed(_)
            | CoreError::Precondition { .. }
            | CoreError::AlreadyClaimed { .. } => StatusCode::CONFLICT,
            CoreError::EmptyMessage | CoreError::Attachment(_) | CoreError::InvalidAgentId(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::Store(err) if err.is_retryable() => {
                tracing::error!("store error: {}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Store(err) => {
                tracing::error!("store error: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Errors that stop the service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

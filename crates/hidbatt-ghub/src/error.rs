//! Error types for the G HUB session

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GHubError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Registry channel closed")]
    RegistryClosed,
}

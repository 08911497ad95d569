use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no signed-in user to open a message session for")]
    MissingIdentity,
    #[error("invalid message endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("message transport failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("timed out after {0:?} opening message transport")]
    ConnectTimeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("attachment of {size} bytes exceeds the {limit} byte limit")]
    AttachmentTooLarge { size: usize, limit: usize },
    #[error("no signed-in user")]
    MissingIdentity,
}

use thiserror::Error;

/// Errors raised while talking to the upstream Live API.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("failed to encode upstream message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("upstream handshake failed: {0}")]
    Handshake(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

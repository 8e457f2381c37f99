use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AsrError {
    #[error("recognizer connection failed: {0}")]
    Connect(String),

    #[error("recognizer transport error: {0}")]
    Transport(String),

    #[error("recognizer handshake rejected with code {code}: {message}")]
    Handshake { code: u32, message: String },

    #[error("recognizer handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("recognizer protocol error: {0}")]
    Protocol(String),

    #[error("recognizer payload compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("recognizer payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("recognizer reconnect backing off for another {0:?}")]
    BackingOff(Duration),

    #[error("recognizer stream is not connected")]
    NotConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for AsrError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

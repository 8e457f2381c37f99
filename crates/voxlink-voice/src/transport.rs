use crate::error::VoiceError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use voxlink_types::{AudioFrame, ServerControl};

/// Outbound half of a device connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError>;

    async fn send_control(&self, message: ServerControl) -> Result<(), VoiceError>;

    /// Asks the connection to close. Further sends fail.
    async fn close(&self);
}

/// A message queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(Bytes),
    Control(ServerControl),
    Close,
}

/// [`Transport`] over a bounded channel drained by a single writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    async fn push(&self, message: Outbound) -> Result<(), VoiceError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| VoiceError::Transport("connection writer has shut down".to_string()))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        self.push(Outbound::Audio(frame.payload.clone())).await
    }

    async fn send_control(&self, message: ServerControl) -> Result<(), VoiceError> {
        self.push(Outbound::Control(message)).await
    }

    async fn close(&self) {
        let _ = self.push(Outbound::Close).await;
    }
}

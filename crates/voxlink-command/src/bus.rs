//! Publish/subscribe seam used to reach devices without a live session.

use crate::error::CommandError;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn json<T: Serialize>(topic: impl Into<String>, body: &T) -> Result<Self, CommandError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_string(body)?,
        })
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), CommandError>;

    /// Receives every message published after the call.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// In-process bus; devices and the gateway share one broadcast channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<(), CommandError> {
        if let Err(broadcast::error::SendError(message)) = self.tx.send(message) {
            // Nobody subscribed; like an unretained publish to a broker.
            debug!(topic = %message.topic, "bus message had no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

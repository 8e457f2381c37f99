use crate::rate_limit::RejectReason;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("message bus error: {0}")]
    Bus(String),

    #[error("failed to encode bus payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch rate limited: {0}")]
    RateLimited(RejectReason),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue for device {device_id} is full ({capacity} pending)")]
    Full { device_id: String, capacity: usize },
}

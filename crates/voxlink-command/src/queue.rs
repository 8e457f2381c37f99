//! Per-device priority queue of unsolicited notifications.
//!
//! Messages are ordered by priority (lower first) and then by insertion.
//! One worker task per device pops a message, dispatches it through the
//! [`CommandChannel`] and waits for its track to resolve before touching the
//! next one, so a device never has two commands in flight.

use crate::channel::CommandChannel;
use crate::config::QueueConfig;
use crate::error::{DispatchError, QueueError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use voxlink_types::{MessageStatus, TrackState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub id: u64,
    pub device_id: String,
    pub content: String,
    pub category: String,
    /// Lower is more urgent.
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub attempts: u32,
    /// Track of the latest dispatch attempt.
    pub track_id: Option<String>,
    pub last_error: Option<String>,
}

/// Point-in-time view of one device's queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub pending: Vec<QueuedMessage>,
    pub in_flight: Option<QueuedMessage>,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    pending: BTreeMap<(i32, u64), QueuedMessage>,
    in_flight: Option<QueuedMessage>,
    worker_running: bool,
    /// Set when the worker exits with nothing left to send.
    idle_since: Option<Instant>,
    history: VecDeque<QueuedMessage>,
    completed: usize,
    failed: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    devices: HashMap<String, DeviceQueue>,
    next_id: u64,
    last_sweep: Option<Instant>,
}

impl QueueState {
    /// Forgets devices that have been idle longer than `retention`. Runs at
    /// most once per `retention`.
    fn sweep(&mut self, now: Instant, retention: Duration) {
        if self
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < retention)
        {
            return;
        }
        self.last_sweep = Some(now);
        let before = self.devices.len();
        self.devices.retain(|_, queue| {
            queue.worker_running
                || queue
                    .idle_since
                    .is_some_and(|since| now.duration_since(since) < retention)
        });
        let purged = before - self.devices.len();
        if purged > 0 {
            debug!(purged, remaining = self.devices.len(), "message queue sweep");
        }
    }
}

struct Inner {
    channel: CommandChannel,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("message queue lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[derive(Clone)]
pub struct PriorityMessageQueue {
    inner: Arc<Inner>,
}

impl PriorityMessageQueue {
    pub fn new(channel: CommandChannel, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queues a message for `device_id` and makes sure a worker is draining
    /// that device. Returns the message id.
    pub fn enqueue(
        &self,
        device_id: &str,
        content: impl Into<String>,
        category: impl Into<String>,
        priority: i32,
        metadata: serde_json::Value,
    ) -> Result<u64, QueueError> {
        let mut state = self.inner.lock();
        state.sweep(Instant::now(), self.inner.config.idle_retention());
        state.next_id += 1;
        let id = state.next_id;
        let capacity = self.inner.config.max_pending_per_device;
        let queue = state.devices.entry(device_id.to_string()).or_default();
        if queue.pending.len() >= capacity {
            warn!(device_id, capacity, "queue full, rejecting message");
            return Err(QueueError::Full {
                device_id: device_id.to_string(),
                capacity,
            });
        }

        let message = QueuedMessage {
            id,
            device_id: device_id.to_string(),
            content: content.into(),
            category: category.into(),
            priority,
            metadata,
            enqueued_at: Utc::now(),
            status: MessageStatus::Pending,
            attempts: 0,
            track_id: None,
            last_error: None,
        };
        info!(
            device_id,
            message_id = id,
            priority,
            category = %message.category,
            "message queued"
        );
        queue.pending.insert((priority, id), message);
        queue.idle_since = None;

        if !queue.worker_running {
            queue.worker_running = true;
            tokio::spawn(drain_device(self.inner.clone(), device_id.to_string()));
        }
        Ok(id)
    }

    pub fn status(&self, device_id: &str) -> QueueStatus {
        let state = self.inner.lock();
        let Some(queue) = state.devices.get(device_id) else {
            return QueueStatus::default();
        };
        QueueStatus {
            pending: queue.pending.values().cloned().collect(),
            in_flight: queue.in_flight.clone(),
            completed: queue.completed,
            failed: queue.failed,
        }
    }

    /// Terminal messages for `device_id`, oldest first.
    pub fn history(&self, device_id: &str) -> Vec<QueuedMessage> {
        self.inner
            .lock()
            .devices
            .get(device_id)
            .map(|q| q.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .devices
            .get(device_id)
            .map(|q| q.pending.len() + usize::from(q.in_flight.is_some()))
            .unwrap_or(0)
    }

    /// Devices with queue state held in memory, idle ones included until
    /// they are swept.
    pub fn tracked_devices(&self) -> usize {
        self.inner.lock().devices.len()
    }
}

/// Outcome of one dispatch attempt.
enum Attempt {
    Delivered,
    Failed { error: String, retry_after: Option<Duration> },
}

async fn attempt(channel: &CommandChannel, message: &QueuedMessage, track_id: &str) -> Attempt {
    match channel
        .dispatch(&message.device_id, &message.content, track_id)
        .await
    {
        Ok(mut track) => match track.wait().await {
            TrackState::Completed => Attempt::Delivered,
            other => Attempt::Failed {
                error: format!("track ended {:?}", other),
                retry_after: None,
            },
        },
        Err(DispatchError::RateLimited(reason)) => Attempt::Failed {
            error: reason.to_string(),
            retry_after: Some(reason.retry_after(channel.limiter().config().cooldown())),
        },
        Err(e) => Attempt::Failed {
            error: e.to_string(),
            retry_after: None,
        },
    }
}

/// Worker for one device. Exits once the queue is empty; the flag is
/// cleared under the same lock `enqueue` checks it with.
async fn drain_device(inner: Arc<Inner>, device_id: String) {
    loop {
        let message = {
            let mut state = inner.lock();
            let Some(queue) = state.devices.get_mut(&device_id) else {
                return;
            };
            let Some((_, mut message)) = queue.pending.pop_first() else {
                queue.worker_running = false;
                queue.idle_since = Some(Instant::now());
                return;
            };
            message.status = MessageStatus::Sending;
            message.attempts += 1;
            message.track_id = Some(format!("{}-{}", message.id, uuid::Uuid::new_v4().simple()));
            queue.in_flight = Some(message.clone());
            message
        };
        let track_id = message.track_id.clone().unwrap_or_default();

        let outcome = attempt(&inner.channel, &message, &track_id).await;

        let retry_in = {
            let mut state = inner.lock();
            let queue = state.devices.entry(device_id.clone()).or_default();
            let mut message = queue.in_flight.take().unwrap_or(message);
            match outcome {
                Attempt::Delivered => {
                    message.status = MessageStatus::Completed;
                    message.last_error = None;
                    info!(
                        device_id = %device_id,
                        message_id = message.id,
                        track_id = %track_id,
                        attempts = message.attempts,
                        "message delivered"
                    );
                    queue.completed += 1;
                    archive(queue, message, inner.config.history_size);
                    None
                }
                Attempt::Failed { error, retry_after } => {
                    message.last_error = Some(error.clone());
                    if message.attempts <= inner.config.max_retries {
                        warn!(
                            device_id = %device_id,
                            message_id = message.id,
                            attempts = message.attempts,
                            "delivery failed, will retry: {}",
                            error
                        );
                        message.status = MessageStatus::Pending;
                        let delay = retry_after
                            .map_or(inner.config.retry_delay(), |d| d.max(inner.config.retry_delay()));
                        queue.pending.insert((message.priority, message.id), message);
                        Some(delay)
                    } else {
                        warn!(
                            device_id = %device_id,
                            message_id = message.id,
                            attempts = message.attempts,
                            "delivery failed permanently: {}",
                            error
                        );
                        message.status = MessageStatus::Failed;
                        queue.failed += 1;
                        archive(queue, message, inner.config.history_size);
                        None
                    }
                }
            }
        };

        if let Some(delay) = retry_in {
            tokio::time::sleep(delay).await;
        }
    }
}

fn archive(queue: &mut DeviceQueue, message: QueuedMessage, limit: usize) {
    if limit == 0 {
        return;
    }
    while queue.history.len() >= limit {
        queue.history.pop_front();
    }
    queue.history.push_back(message);
}

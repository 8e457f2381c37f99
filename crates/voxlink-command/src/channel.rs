//! Asynchronous command/acknowledgement protocol over the message bus.
//!
//! [`CommandChannel::dispatch`] publishes a `SPEAK` command and returns a
//! [`TrackHandle`] that follows the command through
//! `created -> sent -> acked -> completed`, or into `timed_out` / `failed`.
//! A router task consumes the devices' `ack` and `event` topics and advances
//! the matching tracks; per-track timers make sure every track ends.

use crate::bus::{BusMessage, MessageBus};
use crate::config::CommandConfig;
use crate::error::DispatchError;
use crate::rate_limit::{DeliveryRateLimiter, RateDecision};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voxlink_types::{AckMessage, CommandMessage, DeviceEvent, EventMessage, Topic, TrackState};

/// Live view of one dispatched command.
#[derive(Debug, Clone)]
pub struct TrackHandle {
    track_id: String,
    device_id: String,
    state: watch::Receiver<TrackState>,
}

impl TrackHandle {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> TrackState {
        *self.state.borrow()
    }

    /// Waits for the track to reach a terminal state.
    pub async fn wait(&mut self) -> TrackState {
        let resolved = self.state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match resolved {
            Ok(state) => state,
            // The sender only goes away once the track is resolved.
            Err(_) => {
                let last = *self.state.borrow();
                if last.is_terminal() {
                    last
                } else {
                    TrackState::Failed
                }
            }
        }
    }
}

#[derive(Debug)]
struct TrackEntry {
    device_id: String,
    state: watch::Sender<TrackState>,
}

type TrackMap = Arc<Mutex<HashMap<String, TrackEntry>>>;

fn lock(tracks: &TrackMap) -> MutexGuard<'_, HashMap<String, TrackEntry>> {
    match tracks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("track table lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn allowed(from: TrackState, to: TrackState) -> bool {
    use TrackState::*;
    matches!(
        (from, to),
        (Created, Sent)
            | (Created, Failed)
            | (Sent, Acked)
            | (Sent, TimedOut)
            | (Sent, Completed)
            | (Sent, Failed)
            | (Acked, Completed)
            | (Acked, Failed)
    )
}

/// Moves a track to `to` when the transition is legal. Resolved tracks are
/// dropped from the table.
fn transition(tracks: &TrackMap, track_id: &str, device_id: Option<&str>, to: TrackState) -> bool {
    let mut table = lock(tracks);
    let Some(entry) = table.get(track_id) else {
        return false;
    };
    if device_id.is_some_and(|d| d != entry.device_id) {
        warn!(track_id, device_id = ?device_id, "track reported by a different device");
        return false;
    }
    let from = *entry.state.borrow();
    if !allowed(from, to) {
        debug!(track_id, ?from, ?to, "ignoring track transition");
        return false;
    }
    entry.state.send_replace(to);
    if to.is_terminal() {
        table.remove(track_id);
    }
    true
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    limiter: DeliveryRateLimiter,
    config: CommandConfig,
    tracks: TrackMap,
    router: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Reaches devices over the bus. Cheap to clone.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

impl CommandChannel {
    /// Subscribes to the bus and starts routing device acknowledgements.
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        limiter: DeliveryRateLimiter,
        config: CommandConfig,
    ) -> Self {
        let tracks: TrackMap = Arc::new(Mutex::new(HashMap::new()));
        let router = tokio::spawn(route(bus.subscribe(), tracks.clone()));
        Self {
            inner: Arc::new(Inner {
                bus,
                limiter,
                config,
                tracks,
                router,
            }),
        }
    }

    pub fn limiter(&self) -> &DeliveryRateLimiter {
        &self.inner.limiter
    }

    /// Tracks not yet resolved.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.tracks).len()
    }

    pub fn track_state(&self, track_id: &str) -> Option<TrackState> {
        lock(&self.inner.tracks)
            .get(track_id)
            .map(|e| *e.state.borrow())
    }

    /// Publishes a `SPEAK` command for `device_id`.
    ///
    /// Dispatching a `track_id` that is still in flight returns the existing
    /// track instead of publishing again. A rate-limited dispatch creates no
    /// track at all.
    pub async fn dispatch(
        &self,
        device_id: &str,
        text: &str,
        track_id: &str,
    ) -> Result<TrackHandle, DispatchError> {
        let rx = {
            let mut table = lock(&self.inner.tracks);
            if let Some(existing) = table.get(track_id) {
                debug!(track_id, device_id, "track already in flight");
                return Ok(TrackHandle {
                    track_id: track_id.to_string(),
                    device_id: existing.device_id.clone(),
                    state: existing.state.subscribe(),
                });
            }
            if let RateDecision::Rejected(reason) = self.inner.limiter.check(device_id) {
                info!(device_id, track_id, "dispatch rejected: {}", reason);
                return Err(DispatchError::RateLimited(reason));
            }
            let (tx, rx) = watch::channel(TrackState::Created);
            table.insert(
                track_id.to_string(),
                TrackEntry {
                    device_id: device_id.to_string(),
                    state: tx,
                },
            );
            rx
        };

        // Marked sent before publishing so a fast acknowledgement is not lost.
        transition(&self.inner.tracks, track_id, None, TrackState::Sent);
        let published = match BusMessage::json(
            Topic::Command.for_device(device_id),
            &CommandMessage::speak(text, track_id),
        ) {
            Ok(message) => self.inner.bus.publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(device_id, track_id, "command publish failed: {}", e);
            transition(&self.inner.tracks, track_id, None, TrackState::Failed);
            return Err(e.into());
        }

        info!(device_id, track_id, "command sent");
        tokio::spawn(watch_track(
            self.inner.tracks.clone(),
            track_id.to_string(),
            device_id.to_string(),
            rx.clone(),
            self.inner.config.clone(),
        ));

        Ok(TrackHandle {
            track_id: track_id.to_string(),
            device_id: device_id.to_string(),
            state: rx,
        })
    }
}

/// Enforces the ACK and completion windows of one track.
async fn watch_track(
    tracks: TrackMap,
    track_id: String,
    device_id: String,
    mut state: watch::Receiver<TrackState>,
    config: CommandConfig,
) {
    let acked = tokio::time::timeout(config.ack_timeout(), async {
        state
            .wait_for(|s| *s != TrackState::Sent)
            .await
            .map(|s| *s)
    })
    .await;
    match acked {
        Err(_) => {
            if transition(&tracks, &track_id, None, TrackState::TimedOut) {
                warn!(
                    device_id = %device_id,
                    track_id = %track_id,
                    timeout_ms = config.ack_timeout_ms,
                    "command not acknowledged"
                );
            }
            return;
        }
        Ok(Err(_)) => return,
        Ok(Ok(s)) if s.is_terminal() => return,
        Ok(Ok(_)) => {}
    }

    let completed = tokio::time::timeout(config.completion_timeout(), async {
        state.wait_for(|s| s.is_terminal()).await.map(|s| *s)
    })
    .await;
    if completed.is_err() && transition(&tracks, &track_id, None, TrackState::Failed) {
        warn!(
            device_id = %device_id,
            track_id = %track_id,
            timeout_ms = config.completion_timeout_ms,
            "command acknowledged but never completed"
        );
    }
}

/// Applies device acknowledgements and events to the track table.
async fn route(mut rx: broadcast::Receiver<BusMessage>, tracks: TrackMap) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "command router lagged behind the bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some((device_id, topic)) = Topic::parse(&message.topic) else {
            continue;
        };
        match topic {
            Topic::Command => {}
            Topic::Ack => match serde_json::from_str::<AckMessage>(&message.payload) {
                Ok(ack) if ack.is_received() => {
                    if transition(&tracks, &ack.track_id, Some(device_id), TrackState::Acked) {
                        info!(device_id, track_id = %ack.track_id, "command acknowledged");
                    }
                }
                Ok(ack) => debug!(device_id, evt = %ack.evt, "ignoring ack"),
                Err(e) => warn!(device_id, "malformed ack: {}", e),
            },
            Topic::Event => match serde_json::from_str::<EventMessage>(&message.payload) {
                Ok(event) => {
                    let to = match event.evt {
                        DeviceEvent::AudioPlaying => TrackState::Acked,
                        DeviceEvent::SpeakDone => TrackState::Completed,
                        DeviceEvent::SpeakFailed => TrackState::Failed,
                        DeviceEvent::Other => continue,
                    };
                    if transition(&tracks, &event.track_id, Some(device_id), to) {
                        info!(device_id, track_id = %event.track_id, state = ?to, "command progressed");
                    }
                }
                Err(e) => warn!(device_id, "malformed event: {}", e),
            },
        }
    }
    debug!("command router stopped");
}

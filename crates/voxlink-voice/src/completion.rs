//! Detection of the moment a finished dialogue's audio has actually played.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Resolves once the device has (probably) finished playing a reply.
#[async_trait]
pub trait CompletionDetector: Send + Sync {
    /// Waits until playback is considered done. `buffered` is the estimated
    /// amount of audio the device still holds when the wait begins.
    async fn wait(&self, buffered: Duration);

    /// Called when a new reply starts; reports for earlier replies no longer
    /// count.
    fn reply_started(&self) {}

    /// Called when the device reports that playback finished.
    fn playback_finished(&self) {}
}

#[derive(Debug, Clone)]
pub struct FixedDelayCompletion {
    delay: Duration,
}

impl FixedDelayCompletion {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl CompletionDetector for FixedDelayCompletion {
    async fn wait(&self, buffered: Duration) {
        tokio::time::sleep(self.delay + buffered).await;
    }
}

/// Waits for the device's `playback finished` report, or a fallback timeout.
///
/// A report is latched until the next reply starts, so one that arrives
/// before the wait begins still ends it.
#[derive(Debug)]
pub struct DevicePlaybackCompletion {
    finished: Notify,
    reported: AtomicBool,
    fallback: Duration,
}

impl DevicePlaybackCompletion {
    pub fn new(fallback: Duration) -> Self {
        Self {
            finished: Notify::new(),
            reported: AtomicBool::new(false),
            fallback,
        }
    }
}

#[async_trait]
impl CompletionDetector for DevicePlaybackCompletion {
    async fn wait(&self, buffered: Duration) {
        let notified = self.finished.notified();
        tokio::pin!(notified);
        // Register before checking the latch so a concurrent report is not lost.
        notified.as_mut().enable();
        if self.reported.swap(false, Ordering::AcqRel) {
            return;
        }

        let budget = self.fallback + buffered;
        if tokio::time::timeout(budget, notified).await.is_err() {
            debug!(
                timeout_ms = budget.as_millis() as u64,
                "device never reported playback end"
            );
        }
        self.reported.store(false, Ordering::Release);
    }

    fn reply_started(&self) {
        self.reported.store(false, Ordering::Release);
    }

    fn playback_finished(&self) {
        self.reported.store(true, Ordering::Release);
        self.finished.notify_waiters();
    }
}

use crate::completion::{CompletionDetector, DevicePlaybackCompletion, FixedDelayCompletion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

fn default_silence_threshold_ms() -> u64 {
    800
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

fn default_wake_grace_ms() -> u64 {
    1_000
}

fn default_frame_interval_ms() -> u64 {
    55
}

fn default_frame_duration_ms() -> u64 {
    60
}

fn default_recognition_timeout_ms() -> u64 {
    10_000
}

fn default_tick_ms() -> u64 {
    100
}

fn default_completion_delay_ms() -> u64 {
    500
}

fn default_playback_timeout_ms() -> u64 {
    15_000
}

fn default_outbound_capacity() -> usize {
    256
}

/// How the end of a finished dialogue's playback is detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStrategy {
    /// Wait a fixed delay plus the audio still buffered on the device.
    #[default]
    FixedDelay,
    /// Wait for the device to report `playback finished`.
    DevicePlayback,
}

/// Timing and policy knobs of a live audio session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Silence after speech that ends an utterance in auto-listen mode.
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,
    /// An idle session without voice for this long is closed outright.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Voice detections are suppressed this long after a wake word.
    #[serde(default = "default_wake_grace_ms")]
    pub wake_grace_ms: u64,
    /// Minimum delay between two outbound audio frames.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Playback length of one outbound frame, used to estimate buffered audio.
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,
    /// Longest wait for a final result after the utterance was closed.
    #[serde(default = "default_recognition_timeout_ms")]
    pub recognition_timeout_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub completion: CompletionStrategy,
    #[serde(default = "default_completion_delay_ms")]
    pub completion_delay_ms: u64,
    /// Fallback for [`CompletionStrategy::DevicePlayback`] when the device
    /// never reports.
    #[serde(default = "default_playback_timeout_ms")]
    pub playback_timeout_ms: u64,
    /// Capacity of the per-connection outbound queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            wake_grace_ms: default_wake_grace_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            frame_duration_ms: default_frame_duration_ms(),
            recognition_timeout_ms: default_recognition_timeout_ms(),
            tick_ms: default_tick_ms(),
            completion: CompletionStrategy::default(),
            completion_delay_ms: default_completion_delay_ms(),
            playback_timeout_ms: default_playback_timeout_ms(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl SessionConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn wake_grace(&self) -> Duration {
        Duration::from_millis(self.wake_grace_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Builds the detector selected by [`SessionConfig::completion`].
    pub fn completion_detector(&self) -> Arc<dyn CompletionDetector> {
        let delay = Duration::from_millis(self.completion_delay_ms);
        match self.completion {
            CompletionStrategy::FixedDelay => Arc::new(FixedDelayCompletion::new(delay)),
            CompletionStrategy::DevicePlayback => Arc::new(DevicePlaybackCompletion::new(
                Duration::from_millis(self.playback_timeout_ms),
            )),
        }
    }
}

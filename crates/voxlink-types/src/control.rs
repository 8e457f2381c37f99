//! Control messages exchanged with a device over its live audio transport.
//!
//! Binary transport frames carry audio; text frames carry these JSON
//! messages, discriminated by their `type` field.

use crate::{ListenMode, SessionMode};
use serde::{Deserialize, Serialize};

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceControl {
    /// Opening message of a connection.
    Hello {
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Listening lifecycle driven by the device.
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Wake word text when `state` is `detect`.
        #[serde(default)]
        text: Option<String>,
    },
    /// Barge-in: stop whatever the server is saying.
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Device-side playback report.
    Playback { state: PlaybackState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    /// The device's wake-word engine fired.
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Finished,
}

/// Messages sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControl {
    /// Recognized text echoed to the device UI.
    Stt { text: String },
    /// Speech lifecycle.
    Tts {
        state: TtsState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Device-facing mode indicator.
    Status { state: String },
    Error { message: String },
}

impl ServerControl {
    pub fn status(mode: SessionMode) -> Self {
        Self::Status {
            state: mode.label().to_string(),
        }
    }

    pub fn tts(state: TtsState, text: Option<String>) -> Self {
        Self::Tts { state, text }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

//! Payloads and topic names of the device command bus.
//!
//! Each device has three logical channels: `command` (server to device),
//! `ack` and `event` (device to server). Payloads are JSON.

use serde::{Deserialize, Serialize};

/// The three per-device bus channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Command,
    Ack,
    Event,
}

impl Topic {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Ack => "ack",
            Self::Event => "event",
        }
    }

    /// Full topic name for a device, e.g. `device/kitchen-1/ack`.
    pub fn for_device(self, device_id: &str) -> String {
        format!("device/{}/{}", device_id, self.suffix())
    }

    /// Splits a full topic name back into device id and channel.
    ///
    /// Returns `None` for topics outside the `device/{id}/{channel}` scheme.
    pub fn parse(topic: &str) -> Option<(&str, Topic)> {
        let rest = topic.strip_prefix("device/")?;
        let (device_id, suffix) = rest.rsplit_once('/')?;
        if device_id.is_empty() {
            return None;
        }
        let channel = match suffix {
            "command" => Self::Command,
            "ack" => Self::Ack,
            "event" => Self::Event,
            _ => return None,
        };
        Some((device_id, channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Wake the device and speak the text.
    Speak,
    /// Wake the device without speaking.
    Wake,
}

/// Server-to-device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub cmd: CommandKind,
    #[serde(default)]
    pub text: String,
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl CommandMessage {
    pub fn speak(text: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            cmd: CommandKind::Speak,
            text: text.into(),
            track_id: track_id.into(),
            audio_url: None,
        }
    }
}

/// Device confirmation that a command was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub evt: String,
    pub track_id: String,
}

impl AckMessage {
    pub const RECEIVED: &'static str = "CMD_RECEIVED";

    pub fn received(track_id: impl Into<String>) -> Self {
        Self {
            evt: Self::RECEIVED.to_string(),
            track_id: track_id.into(),
        }
    }

    pub fn is_received(&self) -> bool {
        self.evt == Self::RECEIVED
    }
}

/// Device lifecycle event for a previously acknowledged command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub evt: DeviceEvent,
    #[serde(default)]
    pub track_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    #[serde(rename = "EVT_AUDIO_PLAYING")]
    AudioPlaying,
    #[serde(rename = "EVT_SPEAK_DONE")]
    SpeakDone,
    #[serde(rename = "EVT_SPEAK_FAILED")]
    SpeakFailed,
    #[serde(other)]
    Other,
}

impl DeviceEvent {
    /// Whether the event ends the command's track.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SpeakDone | Self::SpeakFailed)
    }
}

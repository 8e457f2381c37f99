//! Shared types for the voxlink device gateway.
//!
//! This crate holds the data model every other voxlink crate agrees on:
//! session modes, synthesized sentences and their kind tags, command
//! track lifecycle states, queued-message statuses, and the two wire
//! vocabularies (device control messages and command-bus payloads).
//!
//! Nothing here performs I/O. Keeping these definitions in one leaf crate
//! lets the recognizer client, the audio session and the command channel
//! exchange values without depending on each other.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod bus;
pub mod control;

pub use bus::{AckMessage, CommandKind, CommandMessage, DeviceEvent, EventMessage, Topic};
pub use control::{DeviceControl, ListenState, PlaybackState, ServerControl, TtsState};

/// Conversational mode of a live audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Nothing in flight; inbound audio only feeds the pre-roll buffer.
    #[default]
    Idle,
    /// Voice detected, audio is being streamed to the recognizer.
    Listening,
    /// Silence followed speech; waiting for the recognizer's final text.
    AwaitingRecognition,
    /// A reply is being drained to the transport.
    Speaking,
}

impl SessionMode {
    /// Returns the label sent to devices in `status` messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::AwaitingRecognition => "recognizing",
            Self::Speaking => "speaking",
        }
    }
}

/// How the device asked the server to listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Voice-activity detection decides where utterances start and end.
    #[default]
    Auto,
    /// Hold-to-talk: the device brackets the utterance with start/stop.
    Manual,
}

/// Position of a synthesized sentence inside one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceKind {
    First,
    Middle,
    Last,
}

/// An opaque compressed audio payload with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u64,
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One unit of synthesized speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub kind: SentenceKind,
    pub text: String,
    pub frames: Vec<AudioFrame>,
    /// Set by the synthesizer when it knows this is the opening chunk of a
    /// reply, independently of the `kind` tag it attached.
    pub is_first_chunk: bool,
}

impl Sentence {
    pub fn new(kind: SentenceKind, text: impl Into<String>, frames: Vec<AudioFrame>) -> Self {
        Self {
            kind,
            text: text.into(),
            frames,
            is_first_chunk: false,
        }
    }

    /// A frameless closing marker used to terminate a reply.
    pub fn terminator() -> Self {
        Self::new(SentenceKind::Last, String::new(), Vec::new())
    }
}

/// Lifecycle of one asynchronous command dispatched to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Created,
    Sent,
    Acked,
    Completed,
    TimedOut,
    Failed,
}

impl TrackState {
    /// Returns `true` once the track can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    /// Returns `true` for the terminal states that count as delivery failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::TimedOut | Self::Failed)
    }
}

/// Status of a message held by the priority queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Completed,
    Failed,
}

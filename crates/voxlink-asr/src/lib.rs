//! Streaming speech-recognition client for the voxlink gateway.
//!
//! A [`RecognitionClient`] holds one persistent WebSocket link to a remote
//! streaming recognizer. The link is opened lazily on the first
//! voice-bearing frame of an utterance, negotiated with a single handshake
//! request, and then fed audio-only packets. A background reader task
//! decodes server responses and reports them as [`RecognitionEvent`]s.
//!
//! The wire format is a compact binary framing (see [`protocol`]): a
//! four-byte header, an optional sequence number, a big-endian payload
//! length and a gzip-compressed payload.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::{
    RecognitionClient, RecognitionEvent, RecognitionEventKind, RecognitionStream, StreamState,
};
pub use config::RecognizerConfig;
pub use error::AsrError;

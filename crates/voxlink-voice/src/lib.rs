//! Live audio sessions for the voxlink gateway.
//!
//! Each device connection is served by one [`AudioSession`]: it gates inbound
//! audio with a voice-activity detector, streams utterances to the
//! recognizer, asks the reply generator for an answer and plays the
//! synthesized sentences back through an [`OutputSequencer`].
//!
//! The reply generator, synthesizer, voice-activity detector and device
//! transport are traits so the session can be driven without any network
//! or speech engine attached.

pub mod completion;
pub mod config;
pub mod error;
pub mod reply;
pub mod sequencer;
pub mod session;
pub mod tasks;
pub mod transport;
pub mod vad;

pub use completion::{CompletionDetector, DevicePlaybackCompletion, FixedDelayCompletion};
pub use config::{CompletionStrategy, SessionConfig};
pub use error::VoiceError;
pub use reply::{
    Reply, ReplyGenerator, SilentReplyGenerator, SpeechSynthesizer, TextOnlySynthesizer,
};
pub use sequencer::{OutputSequencer, ReplyReport};
pub use session::{AudioSession, CloseReason, Inbound, SessionParts, SessionSnapshot};
pub use tasks::PendingTasks;
pub use transport::{ChannelTransport, Outbound, Transport};
pub use vad::{FrameSizeVad, VoiceActivityDetector};

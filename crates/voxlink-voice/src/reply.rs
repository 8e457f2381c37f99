//! Seams to the reply generator and speech synthesizer.
//!
//! Both live outside the gateway. A session only needs "give me a reply for
//! this text" and "give me the sentences of this reply, in order".

use crate::error::VoiceError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use voxlink_types::{Sentence, SentenceKind};

/// A generated reply to one recognized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The dialogue ends after this reply has played.
    pub end_dialogue: bool,
}

impl Reply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_dialogue: false,
        }
    }

    pub fn closing(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_dialogue: true,
        }
    }
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Returns `None` when the utterance needs no spoken answer.
    async fn reply(&self, device_id: &str, text: &str) -> Result<Option<Reply>, VoiceError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Starts synthesis and yields sentences in generation order. The
    /// channel closes when the synthesizer has nothing more to say.
    async fn synthesize(&self, reply: &Reply) -> Result<mpsc::Receiver<Sentence>, VoiceError>;
}

/// Declines every turn.
#[derive(Debug, Default, Clone)]
pub struct SilentReplyGenerator;

#[async_trait]
impl ReplyGenerator for SilentReplyGenerator {
    async fn reply(&self, device_id: &str, text: &str) -> Result<Option<Reply>, VoiceError> {
        debug!(device_id, chars = text.len(), "no reply generator configured");
        Ok(None)
    }
}

/// Splits the reply into sentences and sends them without audio, so the
/// device can display the text.
#[derive(Debug, Default, Clone)]
pub struct TextOnlySynthesizer;

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '\u{3002}', '\u{ff01}', '\u{ff1f}', '\n'];

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if SENTENCE_ENDS.contains(&c) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

#[async_trait]
impl SpeechSynthesizer for TextOnlySynthesizer {
    async fn synthesize(&self, reply: &Reply) -> Result<mpsc::Receiver<Sentence>, VoiceError> {
        let sentences = split_sentences(&reply.text);
        let (tx, rx) = mpsc::channel(sentences.len().max(1));
        let count = sentences.len();
        for (i, text) in sentences.into_iter().enumerate() {
            let kind = if i + 1 == count {
                SentenceKind::Last
            } else if i == 0 {
                SentenceKind::First
            } else {
                SentenceKind::Middle
            };
            let mut sentence = Sentence::new(kind, text, Vec::new());
            sentence.is_first_chunk = i == 0;
            tx.send(sentence)
                .await
                .map_err(|_| VoiceError::Synthesis("sentence receiver dropped".to_string()))?;
        }
        Ok(rx)
    }
}

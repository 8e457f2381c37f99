//! Ordered, paced delivery of one reply's sentences to the device.

use crate::config::SessionConfig;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use voxlink_types::{AudioFrame, Sentence, SentenceKind, ServerControl, TtsState};

/// What happened to one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyReport {
    pub frames_sent: u64,
    pub sentences: usize,
    /// The closing sentence was delivered.
    pub completed: bool,
    pub aborted: bool,
    pub transport_failed: bool,
    /// Estimated audio still queued on the device when delivery ended.
    pub buffered: Duration,
}

/// Single writer of a reply's audio and speech-lifecycle messages.
///
/// Exactly one `tts start` and one `tts stop` go out per reply no matter how
/// the synthesizer tagged its sentences: the first emitted sentence is always
/// `First`, later `First` tags become `Middle`, the first `Last` closes the
/// reply, and a stream that ends without one gets a frameless terminator.
pub struct OutputSequencer {
    device_id: String,
    transport: Arc<dyn Transport>,
    abort: Arc<AtomicBool>,
    frames_total: Arc<AtomicU64>,
    frame_interval: Duration,
    frame_duration: Duration,
    first_emitted: bool,
    closed: bool,
    next_frame_at: Option<Instant>,
    started_at: Option<Instant>,
    report: ReplyReport,
}

impl OutputSequencer {
    pub fn new(
        device_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        abort: Arc<AtomicBool>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            abort,
            frames_total: Arc::new(AtomicU64::new(0)),
            frame_interval: config.frame_interval(),
            frame_duration: config.frame_duration(),
            first_emitted: false,
            closed: false,
            next_frame_at: None,
            started_at: None,
            report: ReplyReport::default(),
        }
    }

    /// Also counts delivered frames into a session-wide counter.
    pub fn with_frame_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.frames_total = counter;
        self
    }

    pub fn report(&self) -> &ReplyReport {
        &self.report
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn aborted(&mut self) -> bool {
        if self.abort.load(Ordering::Acquire) {
            self.report.aborted = true;
        }
        self.report.aborted
    }

    fn relabel(&mut self, sentence: &Sentence) -> SentenceKind {
        if !self.first_emitted {
            if !sentence.is_first_chunk && sentence.kind != SentenceKind::First {
                debug!(
                    device_id = %self.device_id,
                    tagged = ?sentence.kind,
                    "promoting opening sentence to first"
                );
            }
            self.first_emitted = true;
            return SentenceKind::First;
        }
        match sentence.kind {
            SentenceKind::First => SentenceKind::Middle,
            other => other,
        }
    }

    /// Plays one sentence. Returns `false` once the reply cannot continue:
    /// it was aborted or has already been closed by a `Last` sentence.
    pub async fn play(&mut self, sentence: Sentence) -> bool {
        if self.closed {
            debug!(device_id = %self.device_id, "discarding sentence after reply end");
            return false;
        }
        if self.aborted() {
            return false;
        }

        let closes = sentence.kind == SentenceKind::Last;
        let kind = self.relabel(&sentence);
        self.report.sentences += 1;
        if !self.deliver(kind, sentence.text, &sentence.frames).await {
            return false;
        }
        if closes && kind != SentenceKind::Last {
            // A one-sentence reply tagged only `Last` still needs its stop.
            if !self.deliver(SentenceKind::Last, String::new(), &[]).await {
                return false;
            }
        }
        if closes {
            self.closed = true;
        }
        !self.closed
    }

    async fn deliver(&mut self, kind: SentenceKind, text: String, frames: &[AudioFrame]) -> bool {
        if kind == SentenceKind::First {
            self.control(ServerControl::tts(TtsState::Start, None)).await;
        }
        if !text.is_empty() {
            self.control(ServerControl::tts(TtsState::SentenceStart, Some(text)))
                .await;
        }

        for frame in frames {
            if let Some(at) = self.next_frame_at {
                tokio::time::sleep_until(at).await;
            }
            if self.aborted() {
                info!(
                    device_id = %self.device_id,
                    frames_sent = self.report.frames_sent,
                    "reply aborted mid-sentence"
                );
                return false;
            }
            if let Err(e) = self.transport.send_audio(frame).await {
                self.report.transport_failed = true;
                warn!(
                    device_id = %self.device_id,
                    frames_sent = self.report.frames_sent,
                    "audio frame write failed, dropping rest of sentence: {}",
                    e
                );
                break;
            }
            let now = Instant::now();
            self.started_at.get_or_insert(now);
            self.next_frame_at = Some(now + self.frame_interval);
            self.report.frames_sent += 1;
            self.frames_total.fetch_add(1, Ordering::Relaxed);
        }

        if kind == SentenceKind::Last {
            self.control(ServerControl::tts(TtsState::Stop, None)).await;
            self.report.completed = !self.report.transport_failed;
        }
        true
    }

    async fn control(&mut self, message: ServerControl) {
        if let Err(e) = self.transport.send_control(message).await {
            self.report.transport_failed = true;
            warn!(device_id = %self.device_id, "control write failed: {}", e);
        }
    }

    fn buffered(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let audio = self
            .frame_duration
            .saturating_mul(u32::try_from(self.report.frames_sent).unwrap_or(u32::MAX));
        audio.saturating_sub(started.elapsed())
    }

    /// Plays every sentence from `sentences` and closes the reply.
    pub async fn drain(mut self, mut sentences: mpsc::Receiver<Sentence>) -> ReplyReport {
        while let Some(sentence) = sentences.recv().await {
            if !self.play(sentence).await {
                break;
            }
        }
        if !self.closed && !self.aborted() {
            debug!(device_id = %self.device_id, "synthesizer ended without a closing sentence");
            self.play(Sentence::terminator()).await;
        }
        self.report.buffered = self.buffered();
        info!(
            device_id = %self.device_id,
            frames_sent = self.report.frames_sent,
            sentences = self.report.sentences,
            aborted = self.report.aborted,
            transport_failed = self.report.transport_failed,
            "reply drained"
        );
        self.report
    }
}

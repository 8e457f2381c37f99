//! The per-connection audio session state machine.
//!
//! An [`AudioSession`] owns everything tied to one live device connection:
//! the voice-activity detector, the recognizer link, the pre-roll buffer and
//! the background reply tasks. It runs as a single task driven by
//! [`AudioSession::run`], which multiplexes inbound device traffic,
//! recognition events, reply completions and a periodic timer tick.

use crate::completion::CompletionDetector;
use crate::config::SessionConfig;
use crate::reply::{ReplyGenerator, SpeechSynthesizer};
use crate::sequencer::{OutputSequencer, ReplyReport};
use crate::tasks::PendingTasks;
use crate::transport::Transport;
use crate::vad::VoiceActivityDetector;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use voxlink_asr::{
    AsrError, RecognitionEvent, RecognitionEventKind, RecognitionStream, StreamState,
};
use voxlink_types::{
    AudioFrame, DeviceControl, ListenMode, ListenState, PlaybackState, ServerControl,
    SessionMode, TtsState,
};

const INTERNAL_CHANNEL_CAPACITY: usize = 16;

/// Traffic received from the device.
#[derive(Debug, Clone)]
pub enum Inbound {
    Audio(AudioFrame),
    Control(DeviceControl),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The device went away.
    TransportClosed,
    /// No voice for longer than the idle timeout.
    IdleTimeout,
    /// A reply marked as the end of the dialogue finished playing.
    DialogueEnded,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransportClosed => "transport_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::DialogueEnded => "dialogue_ended",
        };
        f.write_str(s)
    }
}

/// Externally observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub mode: SessionMode,
    pub listen_mode: ListenMode,
    /// Replies started so far.
    pub replies: u64,
}

/// Collaborators and settings a session is built from.
pub struct SessionParts {
    pub device_id: String,
    pub config: Arc<SessionConfig>,
    /// Frames kept while idle and replayed when the recognizer connects.
    pub preroll_frames: usize,
    pub transport: Arc<dyn Transport>,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub completion: Arc<dyn CompletionDetector>,
    pub recognizer: Box<dyn RecognitionStream>,
    pub recognition_events: mpsc::Receiver<RecognitionEvent>,
}

enum Internal {
    ReplyFinished {
        reply: u64,
        report: ReplyReport,
        end_dialogue: bool,
    },
    DialogueEnded {
        reply: u64,
    },
}

pub struct AudioSession {
    id: String,
    device_id: String,
    config: Arc<SessionConfig>,
    mode: SessionMode,
    /// Listen mode requested by the device for the next utterance.
    listen_mode: ListenMode,
    /// Listen mode of the utterance the current reply answers.
    reply_listen_mode: ListenMode,
    voice_active: bool,
    /// Set on wake-word detection; voice is ignored for the grace window.
    woken_at: Option<Instant>,
    last_activity: Instant,
    silence_since: Option<Instant>,
    awaiting_since: Option<Instant>,
    abort: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    reply_seq: u64,
    replies_started: u64,
    preroll: VecDeque<AudioFrame>,
    preroll_frames: usize,
    transport: Arc<dyn Transport>,
    vad: Box<dyn VoiceActivityDetector>,
    replies: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    completion: Arc<dyn CompletionDetector>,
    recognizer: Box<dyn RecognitionStream>,
    recognition_events: Option<mpsc::Receiver<RecognitionEvent>>,
    tasks: PendingTasks,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: Option<mpsc::Receiver<Internal>>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl AudioSession {
    pub fn new(parts: SessionParts) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(SessionSnapshot {
            mode: SessionMode::Idle,
            listen_mode: ListenMode::Auto,
            replies: 0,
        });
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: parts.device_id,
            config: parts.config,
            mode: SessionMode::Idle,
            listen_mode: ListenMode::Auto,
            reply_listen_mode: ListenMode::Auto,
            voice_active: false,
            woken_at: None,
            last_activity: Instant::now(),
            silence_since: None,
            awaiting_since: None,
            abort: Arc::new(AtomicBool::new(false)),
            frames_sent: Arc::new(AtomicU64::new(0)),
            reply_seq: 0,
            replies_started: 0,
            preroll: VecDeque::with_capacity(parts.preroll_frames),
            preroll_frames: parts.preroll_frames,
            transport: parts.transport,
            vad: parts.vad,
            replies: parts.replies,
            synthesizer: parts.synthesizer,
            completion: parts.completion,
            recognizer: parts.recognizer,
            recognition_events: Some(parts.recognition_events),
            tasks: PendingTasks::new(),
            internal_tx,
            internal_rx: Some(internal_rx),
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Total audio frames delivered to the device by this session.
    pub fn frames_sent_counter(&self) -> Arc<AtomicU64> {
        self.frames_sent.clone()
    }

    /// Drives the session until the device disconnects or the session
    /// decides to close the connection itself.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) -> CloseReason {
        let (Some(mut recognition), Some(mut internal)) =
            (self.recognition_events.take(), self.internal_rx.take())
        else {
            return CloseReason::TransportClosed;
        };
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device_id = %self.device_id, session_id = %self.id, "audio session started");

        let reason = loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(Inbound::Audio(frame)) => self.on_audio(frame).await,
                    Some(Inbound::Control(control)) => self.on_control(control).await,
                    None => break CloseReason::TransportClosed,
                },
                Some(event) = recognition.recv() => self.on_recognition(event).await,
                Some(event) = internal.recv() => {
                    if let Some(reason) = self.on_internal(event).await {
                        break reason;
                    }
                }
                _ = tick.tick() => {
                    if let Some(reason) = self.on_tick().await {
                        break reason;
                    }
                }
            }
        };

        self.abort.store(true, Ordering::Release);
        let cancelled = self.tasks.cancel_all().await;
        self.recognizer.close().await;
        info!(
            device_id = %self.device_id,
            session_id = %self.id,
            %reason,
            cancelled,
            frames_sent = self.frames_sent.load(Ordering::Relaxed),
            "audio session closed"
        );
        reason
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            mode: self.mode,
            listen_mode: self.listen_mode,
            replies: self.replies_started,
        });
    }

    async fn set_mode(&mut self, mode: SessionMode) {
        if self.mode == mode {
            return;
        }
        debug!(device_id = %self.device_id, from = ?self.mode, to = ?mode, "session mode");
        self.mode = mode;
        self.publish();
        self.control(ServerControl::status(mode)).await;
    }

    async fn control(&mut self, message: ServerControl) {
        if let Err(e) = self.transport.send_control(message).await {
            debug!(device_id = %self.device_id, "control message dropped: {}", e);
        }
    }

    fn in_wake_grace(&self, now: Instant) -> bool {
        self.woken_at
            .is_some_and(|at| now.duration_since(at) < self.config.wake_grace())
    }

    fn push_preroll(&mut self, frame: AudioFrame) {
        if self.preroll_frames == 0 {
            return;
        }
        while self.preroll.len() >= self.preroll_frames {
            self.preroll.pop_front();
        }
        self.preroll.push_back(frame);
    }

    fn clear_utterance(&mut self) {
        self.preroll.clear();
        self.vad.reset();
        self.voice_active = false;
        self.silence_since = None;
        self.awaiting_since = None;
    }

    async fn on_audio(&mut self, frame: AudioFrame) {
        let now = Instant::now();
        let voice = self.vad.is_voice(&frame);
        if voice {
            self.last_activity = now;
        }

        match self.mode {
            SessionMode::Speaking => {
                if voice
                    && self.reply_listen_mode == ListenMode::Auto
                    && !self.in_wake_grace(now)
                {
                    self.barge_in("voice during playback").await;
                }
            }
            SessionMode::AwaitingRecognition => {}
            SessionMode::Idle => {
                if voice && self.in_wake_grace(now) {
                    debug!(device_id = %self.device_id, "voice suppressed after wake word");
                    self.push_preroll(frame);
                } else if voice {
                    self.start_utterance(frame).await;
                } else {
                    self.push_preroll(frame);
                }
            }
            SessionMode::Listening => {
                if voice {
                    self.voice_active = true;
                    self.silence_since = None;
                } else if self.voice_active {
                    self.silence_since.get_or_insert(now);
                }
                if let Err(e) = self.forward(&frame).await {
                    self.recognition_failed(e).await;
                }
            }
        }
    }

    async fn forward(&mut self, frame: &AudioFrame) -> Result<(), AsrError> {
        let preroll: Vec<AudioFrame> = self.preroll.drain(..).collect();
        self.recognizer.send_audio(frame, &preroll).await
    }

    async fn start_utterance(&mut self, frame: AudioFrame) {
        match self.forward(&frame).await {
            Ok(()) => {
                self.voice_active = true;
                self.silence_since = None;
                info!(device_id = %self.device_id, utterance = self.recognizer.utterance(), "voice detected");
                self.set_mode(SessionMode::Listening).await;
            }
            Err(AsrError::BackingOff(remaining)) => {
                debug!(
                    device_id = %self.device_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "recognizer unavailable, dropping utterance start"
                );
            }
            Err(e) => self.recognition_failed(e).await,
        }
    }

    async fn end_utterance(&mut self) {
        self.voice_active = false;
        self.silence_since = None;
        self.vad.reset();
        if self.recognizer.state() != StreamState::Streaming {
            debug!(device_id = %self.device_id, "utterance ended before recognizer connected");
            self.recognizer.close().await;
            self.set_mode(SessionMode::Idle).await;
            return;
        }
        self.awaiting_since = Some(Instant::now());
        self.set_mode(SessionMode::AwaitingRecognition).await;
        if let Err(e) = self.recognizer.finish_utterance().await {
            self.recognition_failed(e).await;
        }
    }

    async fn recognition_failed(&mut self, error: AsrError) {
        warn!(device_id = %self.device_id, "recognition failed: {}", error);
        self.recognition_unavailable().await;
    }

    /// The utterance produced no result; back to idle without closing the
    /// device connection.
    async fn recognition_unavailable(&mut self) {
        self.recognizer.close().await;
        self.clear_utterance();
        self.control(ServerControl::Error {
            message: "speech recognition unavailable".to_string(),
        })
        .await;
        self.set_mode(SessionMode::Idle).await;
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        if event.utterance != self.recognizer.utterance() {
            debug!(
                device_id = %self.device_id,
                utterance = event.utterance,
                "ignoring event from a previous utterance"
            );
            return;
        }
        let in_utterance = matches!(
            self.mode,
            SessionMode::Listening | SessionMode::AwaitingRecognition
        );

        match event.kind {
            RecognitionEventKind::Partial { text } => {
                debug!(device_id = %self.device_id, partial = %text, "partial result");
            }
            RecognitionEventKind::Final { text } => {
                self.recognizer.close().await;
                self.clear_utterance();
                if !in_utterance {
                    debug!(device_id = %self.device_id, "final result outside an utterance");
                    return;
                }
                let text = text.trim().to_string();
                if text.is_empty() {
                    info!(device_id = %self.device_id, "no speech recognized");
                    self.set_mode(SessionMode::Idle).await;
                    return;
                }
                info!(device_id = %self.device_id, chars = text.len(), "recognized utterance");
                self.control(ServerControl::Stt { text: text.clone() })
                    .await;
                self.start_reply(text).await;
            }
            RecognitionEventKind::Unavailable { reason } => {
                if in_utterance {
                    warn!(device_id = %self.device_id, "recognition unavailable: {}", reason);
                    self.recognition_unavailable().await;
                } else {
                    debug!(device_id = %self.device_id, "recognizer link dropped: {}", reason);
                    self.recognizer.close().await;
                }
            }
        }
    }

    async fn start_reply(&mut self, text: String) {
        let cancelled = self.tasks.cancel_all().await;
        if cancelled > 0 {
            debug!(device_id = %self.device_id, cancelled, "cancelled previous reply tasks");
        }
        self.reply_seq += 1;
        self.replies_started += 1;
        self.completion.reply_started();
        self.abort.store(false, Ordering::Release);
        self.reply_listen_mode = self.listen_mode;
        self.set_mode(SessionMode::Speaking).await;

        let reply = self.reply_seq;
        let device_id = self.device_id.clone();
        let replies = self.replies.clone();
        let synthesizer = self.synthesizer.clone();
        let sequencer = OutputSequencer::new(
            device_id.clone(),
            self.transport.clone(),
            self.abort.clone(),
            &self.config,
        )
        .with_frame_counter(self.frames_sent.clone());
        let done = self.internal_tx.clone();

        self.tasks.spawn(async move {
            let finished = |report: ReplyReport, end_dialogue: bool| Internal::ReplyFinished {
                reply,
                report,
                end_dialogue,
            };
            let answer = match replies.reply(&device_id, &text).await {
                Ok(Some(answer)) => answer,
                Ok(None) => {
                    let _ = done.send(finished(ReplyReport::default(), false)).await;
                    return;
                }
                Err(e) => {
                    warn!(device_id = %device_id, "reply generation failed: {}", e);
                    let _ = done.send(finished(ReplyReport::default(), false)).await;
                    return;
                }
            };
            let sentences = match synthesizer.synthesize(&answer).await {
                Ok(sentences) => sentences,
                Err(e) => {
                    warn!(device_id = %device_id, "speech synthesis failed: {}", e);
                    let _ = done.send(finished(ReplyReport::default(), false)).await;
                    return;
                }
            };
            let report = sequencer.drain(sentences).await;
            let _ = done.send(finished(report, answer.end_dialogue)).await;
        });
        self.publish();
    }

    async fn barge_in(&mut self, reason: &str) {
        let was_speaking = self.mode == SessionMode::Speaking;
        self.abort.store(true, Ordering::Release);
        let cancelled = self.tasks.cancel_all().await;
        self.reply_seq += 1;
        self.recognizer.close().await;
        self.clear_utterance();
        info!(
            device_id = %self.device_id,
            reason,
            cancelled,
            frames_sent = self.frames_sent.load(Ordering::Relaxed),
            "session aborted"
        );
        if was_speaking {
            self.control(ServerControl::tts(TtsState::Stop, None)).await;
        }
        self.set_mode(SessionMode::Idle).await;
    }

    async fn on_control(&mut self, control: DeviceControl) {
        let now = Instant::now();
        match control {
            DeviceControl::Hello { .. } => {
                self.control(ServerControl::status(self.mode)).await;
            }
            DeviceControl::Listen {
                state: ListenState::Start,
                mode,
                ..
            } => {
                self.last_activity = now;
                self.listen_mode = mode.unwrap_or(ListenMode::Auto);
                if matches!(
                    self.mode,
                    SessionMode::Speaking | SessionMode::AwaitingRecognition
                ) {
                    self.barge_in("listen start").await;
                }
                if self.listen_mode == ListenMode::Manual && self.mode == SessionMode::Idle {
                    self.voice_active = false;
                    self.set_mode(SessionMode::Listening).await;
                }
                self.publish();
            }
            DeviceControl::Listen {
                state: ListenState::Stop,
                ..
            } => {
                if self.mode == SessionMode::Listening {
                    self.end_utterance().await;
                }
            }
            DeviceControl::Listen {
                state: ListenState::Detect,
                text,
                ..
            } => {
                self.last_activity = now;
                self.woken_at = Some(now);
                info!(device_id = %self.device_id, wake_word = ?text, "wake word detected");
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    self.control(ServerControl::Stt { text }).await;
                }
            }
            DeviceControl::Abort { reason } => {
                let reason = reason.unwrap_or_else(|| "device abort".to_string());
                self.barge_in(&reason).await;
            }
            DeviceControl::Playback {
                state: PlaybackState::Finished,
            } => {
                self.completion.playback_finished();
            }
        }
    }

    async fn on_internal(&mut self, event: Internal) -> Option<CloseReason> {
        match event {
            Internal::ReplyFinished {
                reply,
                report,
                end_dialogue,
            } => {
                if reply != self.reply_seq {
                    return None;
                }
                self.last_activity = Instant::now();
                if self.mode == SessionMode::Speaking {
                    self.set_mode(SessionMode::Idle).await;
                }
                if end_dialogue && report.completed && !report.aborted {
                    let completion = self.completion.clone();
                    let done = self.internal_tx.clone();
                    let buffered = report.buffered;
                    self.tasks.spawn(async move {
                        completion.wait(buffered).await;
                        let _ = done.send(Internal::DialogueEnded { reply }).await;
                    });
                }
                None
            }
            Internal::DialogueEnded { reply } => {
                if reply != self.reply_seq || self.mode != SessionMode::Idle {
                    return None;
                }
                info!(device_id = %self.device_id, "dialogue finished, closing connection");
                self.transport.close().await;
                Some(CloseReason::DialogueEnded)
            }
        }
    }

    async fn on_tick(&mut self) -> Option<CloseReason> {
        let now = Instant::now();
        if self.woken_at.is_some() && !self.in_wake_grace(now) {
            self.woken_at = None;
        }

        match self.mode {
            SessionMode::Listening => {
                let silent_for = self.silence_since.map(|since| now.duration_since(since));
                if self.listen_mode == ListenMode::Auto
                    && silent_for.is_some_and(|d| d >= self.config.silence_threshold())
                {
                    debug!(device_id = %self.device_id, "silence after speech, closing utterance");
                    self.end_utterance().await;
                }
            }
            SessionMode::AwaitingRecognition => {
                let waited = self.awaiting_since.map(|since| now.duration_since(since));
                if waited.is_some_and(|d| d >= self.config.recognition_timeout()) {
                    warn!(device_id = %self.device_id, "no final result from recognizer");
                    self.recognition_unavailable().await;
                }
            }
            SessionMode::Idle => {
                if now.duration_since(self.last_activity) >= self.config.idle_timeout() {
                    info!(
                        device_id = %self.device_id,
                        idle_ms = self.config.idle_timeout_ms,
                        "idle timeout, closing connection"
                    );
                    self.transport.close().await;
                    return Some(CloseReason::IdleTimeout);
                }
            }
            SessionMode::Speaking => {}
        }
        None
    }
}

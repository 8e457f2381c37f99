//! End-to-end behaviour of the audio session with scripted collaborators.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use voxlink_asr::{AsrError, RecognitionEvent, RecognitionEventKind, RecognitionStream, StreamState};
use voxlink_types::{
    AudioFrame, DeviceControl, ListenMode, ListenState, PlaybackState, Sentence, SentenceKind,
    ServerControl, SessionMode, TtsState,
};
use voxlink_voice::{
    AudioSession, ChannelTransport, CloseReason, CompletionStrategy, FrameSizeVad, Inbound, Outbound, Reply,
    ReplyGenerator, SessionConfig, SessionParts, SessionSnapshot, SpeechSynthesizer, VoiceError,
};

#[derive(Debug, Default)]
struct RecognizerLog {
    frames: Vec<u64>,
    preroll: usize,
    connects: usize,
    finished: usize,
    closes: usize,
    utterance: u64,
}

struct FakeRecognizer {
    log: Arc<Mutex<RecognizerLog>>,
    state: StreamState,
    fail_connect: bool,
}

#[async_trait]
impl RecognitionStream for FakeRecognizer {
    fn state(&self) -> StreamState {
        self.state
    }

    fn utterance(&self) -> u64 {
        self.log.lock().unwrap().utterance
    }

    async fn send_audio(
        &mut self,
        frame: &AudioFrame,
        preroll: &[AudioFrame],
    ) -> Result<(), AsrError> {
        let mut log = self.log.lock().unwrap();
        if self.state == StreamState::Disconnected {
            if self.fail_connect {
                return Err(AsrError::Handshake {
                    code: 1001,
                    message: "bad app id".to_string(),
                });
            }
            self.state = StreamState::Streaming;
            log.connects += 1;
            log.utterance += 1;
            log.preroll += preroll.len();
        }
        log.frames.push(frame.seq);
        Ok(())
    }

    async fn finish_utterance(&mut self) -> Result<(), AsrError> {
        if self.state != StreamState::Streaming {
            return Err(AsrError::NotConnected);
        }
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if self.state == StreamState::Streaming {
            self.log.lock().unwrap().closes += 1;
        }
        self.state = StreamState::Disconnected;
    }
}

#[derive(Default)]
struct ScriptedReplies {
    heard: Mutex<Vec<String>>,
    answers: Mutex<VecDeque<Reply>>,
}

#[async_trait]
impl ReplyGenerator for ScriptedReplies {
    async fn reply(&self, _device_id: &str, text: &str) -> Result<Option<Reply>, VoiceError> {
        self.heard.lock().unwrap().push(text.to_string());
        Ok(self.answers.lock().unwrap().pop_front())
    }
}

/// Produces `sentences` sentences of `frames` voiced frames each.
struct FrameSynth {
    sentences: usize,
    frames: u64,
}

#[async_trait]
impl SpeechSynthesizer for FrameSynth {
    async fn synthesize(&self, reply: &Reply) -> Result<mpsc::Receiver<Sentence>, VoiceError> {
        let (tx, rx) = mpsc::channel(self.sentences.max(1));
        for i in 0..self.sentences {
            let kind = if i == 0 {
                SentenceKind::First
            } else if i + 1 == self.sentences {
                SentenceKind::Last
            } else {
                SentenceKind::Middle
            };
            let frames = (0..self.frames)
                .map(|seq| AudioFrame::new(seq, vec![9u8; 40]))
                .collect();
            tx.send(Sentence::new(kind, format!("{} #{}", reply.text, i), frames))
                .await
                .unwrap();
        }
        Ok(rx)
    }
}

struct Harness {
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<RecognitionEvent>,
    log: Arc<Mutex<RecognizerLog>>,
    replies: Arc<ScriptedReplies>,
    snapshot: watch::Receiver<SessionSnapshot>,
    frames: Arc<AtomicU64>,
    session: JoinHandle<CloseReason>,
}

struct Setup {
    config: SessionConfig,
    answers: Vec<Reply>,
    synth: FrameSynth,
    fail_connect: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
            answers: Vec::new(),
            synth: FrameSynth {
                sentences: 1,
                frames: 3,
            },
            fail_connect: false,
        }
    }
}

fn start(setup: Setup) -> Harness {
    let log = Arc::new(Mutex::new(RecognizerLog::default()));
    let replies = Arc::new(ScriptedReplies {
        answers: Mutex::new(setup.answers.into_iter().collect()),
        ..ScriptedReplies::default()
    });
    let (transport, outbound) = ChannelTransport::channel(1024);
    let (events_tx, events_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let config = Arc::new(setup.config);

    let session = AudioSession::new(SessionParts {
        device_id: "dev-1".to_string(),
        completion: config.completion_detector(),
        config,
        preroll_frames: 10,
        transport: Arc::new(transport),
        vad: Box::new(FrameSizeVad::default()),
        replies: replies.clone(),
        synthesizer: Arc::new(setup.synth),
        recognizer: Box::new(FakeRecognizer {
            log: log.clone(),
            state: StreamState::Disconnected,
            fail_connect: setup.fail_connect,
        }),
        recognition_events: events_rx,
    });
    let snapshot = session.subscribe();
    let frames = session.frames_sent_counter();
    let session = tokio::spawn(session.run(inbound_rx));

    Harness {
        inbound: inbound_tx,
        outbound,
        events: events_tx,
        log,
        replies,
        snapshot,
        frames,
        session,
    }
}

fn voice(seq: u64) -> Inbound {
    Inbound::Audio(AudioFrame::new(seq, vec![1u8; 80]))
}

fn silence(seq: u64) -> Inbound {
    Inbound::Audio(AudioFrame::new(seq, vec![0u8; 2]))
}

fn listen(state: ListenState, mode: Option<ListenMode>) -> Inbound {
    Inbound::Control(DeviceControl::Listen {
        state,
        mode,
        text: None,
    })
}

impl Harness {
    async fn send(&self, msg: Inbound) {
        self.inbound.send(msg).await.unwrap();
    }

    async fn wait_mode(&mut self, mode: SessionMode) {
        tokio::time::timeout(
            Duration::from_secs(30),
            self.snapshot.wait_for(|s| s.mode == mode),
        )
        .await
        .unwrap_or_else(|_| panic!("session never reached {:?}", mode))
        .unwrap();
    }

    /// Skips outbound traffic until a control message matching `pred`.
    async fn expect_control(&mut self, pred: impl Fn(&ServerControl) -> bool) -> ServerControl {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(30), self.outbound.recv())
                .await
                .expect("timed out waiting for control message")
                .expect("outbound closed");
            if let Outbound::Control(control) = msg {
                if pred(&control) {
                    return control;
                }
            }
        }
    }

    async fn expect_audio(&mut self, count: usize) {
        let mut seen = 0;
        while seen < count {
            let msg = tokio::time::timeout(Duration::from_secs(30), self.outbound.recv())
                .await
                .expect("timed out waiting for audio")
                .expect("outbound closed");
            if matches!(msg, Outbound::Audio(_)) {
                seen += 1;
            }
        }
    }

    async fn finalize(&self, text: &str) {
        let utterance = self.log.lock().unwrap().utterance;
        self.events
            .send(RecognitionEvent {
                utterance,
                kind: RecognitionEventKind::Final {
                    text: text.to_string(),
                },
            })
            .await
            .unwrap();
    }

    fn mode(&self) -> SessionMode {
        self.snapshot.borrow().mode
    }
}

fn is_tts(state: TtsState) -> impl Fn(&ServerControl) -> bool {
    move |c| matches!(c, ServerControl::Tts { state: s, .. } if *s == state)
}

#[tokio::test(start_paused = true)]
async fn utterance_is_recognized_after_silence() {
    let mut h = start(Setup::default());

    for seq in 1..=3 {
        h.send(voice(seq)).await;
    }
    h.wait_mode(SessionMode::Listening).await;
    h.send(silence(4)).await;
    h.send(silence(5)).await;
    h.wait_mode(SessionMode::AwaitingRecognition).await;

    {
        let log = h.log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.finished, 1);
        assert_eq!(log.frames, vec![1, 2, 3, 4, 5]);
    }

    h.finalize("turn on the light").await;
    let stt = h
        .expect_control(|c| matches!(c, ServerControl::Stt { .. }))
        .await;
    assert_eq!(
        stt,
        ServerControl::Stt {
            text: "turn on the light".to_string()
        }
    );
    h.wait_mode(SessionMode::Idle).await;

    assert_eq!(*h.replies.heard.lock().unwrap(), vec!["turn on the light"]);
    assert_eq!(h.log.lock().unwrap().closes, 1, "recognizer link released");
}

#[tokio::test(start_paused = true)]
async fn preroll_is_replayed_on_connect() {
    let mut h = start(Setup::default());
    for seq in 1..=4 {
        h.send(silence(seq)).await;
    }
    h.send(voice(5)).await;
    h.wait_mode(SessionMode::Listening).await;
    let log = h.log.lock().unwrap();
    assert_eq!(log.preroll, 4);
    assert_eq!(log.frames, vec![5]);
}

#[tokio::test(start_paused = true)]
async fn barge_in_stops_delivery() {
    let mut h = start(Setup {
        answers: vec![Reply::new("long answer")],
        synth: FrameSynth {
            sentences: 2,
            frames: 40,
        },
        ..Setup::default()
    });

    h.send(voice(1)).await;
    h.wait_mode(SessionMode::Listening).await;
    h.finalize("tell me a story").await;
    h.wait_mode(SessionMode::Speaking).await;
    h.expect_audio(3).await;

    h.send(voice(2)).await;
    h.wait_mode(SessionMode::Idle).await;
    let frozen = h.frames.load(Ordering::SeqCst);
    assert!(frozen >= 3 && frozen < 80, "frames_sent = {}", frozen);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.frames.load(Ordering::SeqCst), frozen);

    let mut audio_after = 0u64;
    let mut stopped = false;
    while let Ok(msg) = h.outbound.try_recv() {
        match msg {
            Outbound::Audio(_) => audio_after += 1,
            Outbound::Control(c) if is_tts(TtsState::Stop)(&c) => stopped = true,
            _ => {}
        }
    }
    assert_eq!(3 + audio_after, frozen, "no frames beyond the counter");
    assert!(stopped, "device told to stop playback");
    assert!(!h.session.is_finished());
}

#[tokio::test(start_paused = true)]
async fn manual_listening_is_not_interrupted_by_voice() {
    let mut h = start(Setup {
        answers: vec![Reply::new("sure")],
        synth: FrameSynth {
            sentences: 1,
            frames: 10,
        },
        ..Setup::default()
    });

    h.send(listen(ListenState::Start, Some(ListenMode::Manual))).await;
    h.wait_mode(SessionMode::Listening).await;
    h.send(voice(1)).await;
    h.send(silence(2)).await;
    // Silence alone never closes a hold-to-talk utterance.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.mode(), SessionMode::Listening);

    h.send(listen(ListenState::Stop, None)).await;
    h.wait_mode(SessionMode::AwaitingRecognition).await;
    h.finalize("what time is it").await;
    h.wait_mode(SessionMode::Speaking).await;
    h.expect_audio(2).await;

    for seq in 3..6 {
        h.send(voice(seq)).await;
    }
    h.expect_control(is_tts(TtsState::Stop)).await;
    h.wait_mode(SessionMode::Idle).await;
    assert_eq!(h.frames.load(Ordering::SeqCst), 10);
}

#[tokio::test(start_paused = true)]
async fn voice_right_after_wake_word_is_suppressed() {
    let mut h = start(Setup::default());

    h.send(Inbound::Control(DeviceControl::Listen {
        state: ListenState::Detect,
        mode: None,
        text: Some("hey vox".to_string()),
    }))
    .await;
    h.send(voice(1)).await;
    h.send(voice(2)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.mode(), SessionMode::Idle);
    assert_eq!(h.log.lock().unwrap().connects, 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    h.send(voice(3)).await;
    h.wait_mode(SessionMode::Listening).await;
    let log = h.log.lock().unwrap();
    assert_eq!(log.connects, 1);
    assert_eq!(log.preroll, 2, "suppressed frames kept as lead-in");
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_closed() {
    let mut config = SessionConfig::default();
    config.idle_timeout_ms = 3_000;
    let mut h = start(Setup {
        config,
        ..Setup::default()
    });

    h.send(silence(1)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.session.is_finished());

    let reason = tokio::time::timeout(Duration::from_secs(5), &mut h.session)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::IdleTimeout);

    let mut closed = false;
    while let Ok(msg) = h.outbound.try_recv() {
        closed |= msg == Outbound::Close;
    }
    assert!(closed);
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_returns_to_idle() {
    let mut h = start(Setup {
        fail_connect: true,
        ..Setup::default()
    });

    h.send(voice(1)).await;
    let err = h
        .expect_control(|c| matches!(c, ServerControl::Error { .. }))
        .await;
    assert!(matches!(err, ServerControl::Error { .. }));
    assert_eq!(h.mode(), SessionMode::Idle);
    assert!(!h.session.is_finished());
}

#[tokio::test(start_paused = true)]
async fn finished_dialogue_closes_after_playback() {
    let mut config = SessionConfig::default();
    config.completion_delay_ms = 500;
    let mut h = start(Setup {
        config,
        answers: vec![Reply::closing("goodbye")],
        ..Setup::default()
    });

    h.send(voice(1)).await;
    h.wait_mode(SessionMode::Listening).await;
    h.finalize("that's all").await;
    h.expect_control(is_tts(TtsState::Stop)).await;

    let reason = tokio::time::timeout(Duration::from_secs(5), &mut h.session)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, CloseReason::DialogueEnded);
}

#[tokio::test(start_paused = true)]
async fn new_reply_cancels_pending_dialogue_end() {
    let mut config = SessionConfig::default();
    config.completion_delay_ms = 5_000;
    let mut h = start(Setup {
        config,
        answers: vec![Reply::closing("goodbye"), Reply::new("oh, one more thing")],
        ..Setup::default()
    });

    h.send(voice(1)).await;
    h.wait_mode(SessionMode::Listening).await;
    h.finalize("bye").await;
    h.expect_control(is_tts(TtsState::Stop)).await;
    h.wait_mode(SessionMode::Idle).await;

    h.send(voice(2)).await;
    h.wait_mode(SessionMode::Listening).await;
    h.finalize("wait").await;
    h.wait_mode(SessionMode::Speaking).await;
    h.expect_control(is_tts(TtsState::Stop)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!h.session.is_finished());
    assert_eq!(h.snapshot.borrow().replies, 2);
}

#[tokio::test(start_paused = true)]
async fn playback_report_before_completion_wait_still_closes() {
    let mut config = SessionConfig::default();
    config.completion = CompletionStrategy::DevicePlayback;
    config.playback_timeout_ms = 15_000;
    let mut h = start(Setup {
        config,
        answers: vec![Reply::closing("goodbye")],
        // Text-only reply: nothing to pace, so the report can race the wait.
        synth: FrameSynth {
            sentences: 0,
            frames: 0,
        },
        ..Setup::default()
    });

    h.send(voice(1)).await;
    h.wait_mode(SessionMode::Listening).await;
    h.finalize("good night").await;
    h.expect_control(is_tts(TtsState::Stop)).await;
    h.send(Inbound::Control(DeviceControl::Playback {
        state: PlaybackState::Finished,
    }))
    .await;

    let reason = tokio::time::timeout(Duration::from_secs(2), &mut h.session)
        .await
        .expect("session waited for the playback fallback")
        .unwrap();
    assert_eq!(reason, CloseReason::DialogueEnded);
}

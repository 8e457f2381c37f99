//! Connection lifecycle of the streaming recognizer link.

use crate::config::RecognizerConfig;
use crate::error::AsrError;
use crate::protocol::{self, RecognitionPayload, ServerResponse, SUCCESS_CODE};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use voxlink_types::AudioFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
}

/// What the reader task reports for the utterance it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEventKind {
    Partial { text: String },
    /// End of utterance. Emitted at most once per utterance; `text` is empty
    /// when the recognizer heard no speech.
    Final { text: String },
    /// The link broke before a final result arrived.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionEvent {
    /// Connection generation the event belongs to. Events from a link the
    /// session has already dropped carry an older id and must be ignored.
    pub utterance: u64,
    pub kind: RecognitionEventKind,
}

/// Seam between the audio session and a recognizer link.
#[async_trait]
pub trait RecognitionStream: Send {
    fn state(&self) -> StreamState;

    /// Id of the utterance currently streaming (or last streamed).
    fn utterance(&self) -> u64;

    /// Forwards one frame, opening the link first if needed. On a fresh
    /// connect the `preroll` frames are replayed ahead of `frame`.
    async fn send_audio(
        &mut self,
        frame: &AudioFrame,
        preroll: &[AudioFrame],
    ) -> Result<(), AsrError>;

    /// Tells the recognizer no more audio follows for this utterance.
    async fn finish_utterance(&mut self) -> Result<(), AsrError>;

    /// Cancels the reader, awaits it and releases the socket.
    async fn close(&mut self);
}

/// Exponential delay between failed connection attempts.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            retry_at: None,
        }
    }

    fn check(&self, now: Instant) -> Result<(), AsrError> {
        match self.retry_at {
            Some(at) if at > now => Err(AsrError::BackingOff(at - now)),
            _ => Ok(()),
        }
    }

    fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32 << (self.failures - 1).min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

struct Link {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

/// A lazily connected link to the streaming recognizer for one session.
pub struct RecognitionClient {
    config: Arc<RecognizerConfig>,
    device_id: String,
    events: mpsc::Sender<RecognitionEvent>,
    state: StreamState,
    link: Option<Link>,
    utterance: u64,
    backoff: Backoff,
}

impl RecognitionClient {
    pub fn new(
        config: Arc<RecognizerConfig>,
        device_id: impl Into<String>,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        Self {
            config,
            device_id: device_id.into(),
            events,
            state: StreamState::Disconnected,
            link: None,
            utterance: 0,
            backoff,
        }
    }

    fn handshake_request(&self) -> serde_json::Value {
        let c = &self.config;
        json!({
            "app": {
                "appid": c.app_id,
                "cluster": c.cluster,
                "token": c.access_token,
            },
            "user": { "uid": self.device_id },
            "request": {
                "reqid": uuid::Uuid::new_v4().to_string(),
                "workflow": c.workflow,
                "show_utterances": true,
                "result_type": "single",
                "enable_punc": c.punctuate,
                "sequence": 1,
            },
            "audio": {
                "format": c.format,
                "codec": c.format,
                "rate": c.sample_rate,
                "bits": c.bits,
                "channel": c.channels,
                "language": c.language,
            },
        })
    }

    async fn connect(&mut self, preroll: &[AudioFrame]) -> Result<(), AsrError> {
        self.backoff.check(Instant::now())?;
        match self.open_link().await {
            Ok(link) => {
                self.backoff.reset();
                self.link = Some(link);
                self.state = StreamState::Streaming;
                info!(
                    device_id = %self.device_id,
                    utterance = self.utterance,
                    preroll = preroll.len(),
                    "recognizer stream ready"
                );
                for frame in preroll {
                    self.write_audio(&frame.payload, false).await?;
                }
                Ok(())
            }
            Err(e) => {
                self.state = StreamState::Disconnected;
                let delay = self.backoff.record_failure(Instant::now());
                warn!(
                    device_id = %self.device_id,
                    retry_in_ms = delay.as_millis() as u64,
                    "recognizer connect failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn open_link(&mut self) -> Result<Link, AsrError> {
        let budget = self.config.handshake_timeout();
        self.state = StreamState::Connecting;

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AsrError::Connect(e.to_string()))?;
        if !self.config.access_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer; {}", self.config.access_token))
                .map_err(|e| AsrError::Connect(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = timeout(budget, connect_async(request))
            .await
            .map_err(|_| AsrError::HandshakeTimeout(budget))?
            .map_err(|e| AsrError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        self.state = StreamState::Handshaking;
        sink.send(Message::binary(protocol::encode_full_request(
            &self.handshake_request(),
        )?))
        .await?;

        let reply = timeout(budget, next_binary(&mut stream))
            .await
            .map_err(|_| AsrError::HandshakeTimeout(budget))??;
        if let Err(e) = check_handshake(&reply) {
            let _ = sink.close().await;
            return Err(e);
        }

        self.utterance += 1;
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            stream,
            self.events.clone(),
            self.utterance,
            self.config.no_speech_ms,
            alive.clone(),
        ));
        Ok(Link {
            sink,
            reader,
            alive,
        })
    }

    async fn write_audio(&mut self, payload: &[u8], last: bool) -> Result<(), AsrError> {
        let link = self.link.as_mut().ok_or(AsrError::NotConnected)?;
        let frame = protocol::encode_audio(payload, last)?;
        link.sink.send(Message::binary(frame)).await?;
        Ok(())
    }

    fn link_alive(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.alive.load(Ordering::Acquire))
    }
}

#[async_trait]
impl RecognitionStream for RecognitionClient {
    fn state(&self) -> StreamState {
        if self.state == StreamState::Streaming && !self.link_alive() {
            return StreamState::Disconnected;
        }
        self.state
    }

    fn utterance(&self) -> u64 {
        self.utterance
    }

    async fn send_audio(
        &mut self,
        frame: &AudioFrame,
        preroll: &[AudioFrame],
    ) -> Result<(), AsrError> {
        if self.state == StreamState::Streaming && !self.link_alive() {
            debug!(device_id = %self.device_id, "recognizer link ended, reconnecting");
            self.close().await;
        }
        if self.state == StreamState::Disconnected {
            self.connect(preroll).await?;
        }
        if let Err(e) = self.write_audio(&frame.payload, false).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn finish_utterance(&mut self) -> Result<(), AsrError> {
        if self.state() != StreamState::Streaming {
            return Err(AsrError::NotConnected);
        }
        self.write_audio(&[], true).await
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.reader.abort();
            let _ = (&mut link.reader).await;
            let _ = link.sink.close().await;
            debug!(
                device_id = %self.device_id,
                utterance = self.utterance,
                "recognizer link closed"
            );
        }
        self.state = StreamState::Disconnected;
    }
}

impl Drop for RecognitionClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
    }
}

async fn next_binary(stream: &mut SplitStream<WsStream>) -> Result<Vec<u8>, AsrError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => return Ok(data.to_vec()),
            Message::Close(frame) => {
                return Err(AsrError::Connect(format!(
                    "recognizer closed during handshake: {:?}",
                    frame
                )))
            }
            _ => continue,
        }
    }
    Err(AsrError::Connect(
        "recognizer closed during handshake".to_string(),
    ))
}

fn check_handshake(frame: &[u8]) -> Result<(), AsrError> {
    match protocol::decode_response(frame)? {
        ServerResponse::Result { payload, .. } => {
            let parsed: RecognitionPayload = serde_json::from_value(payload)?;
            match parsed.code {
                Some(SUCCESS_CODE) | None => Ok(()),
                Some(code) => Err(AsrError::Handshake {
                    code,
                    message: parsed.message.unwrap_or_default(),
                }),
            }
        }
        ServerResponse::Ack { .. } => Ok(()),
        ServerResponse::Error { code, message } => Err(AsrError::Handshake { code, message }),
    }
}

/// Decodes responses until the utterance ends or the link breaks.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<RecognitionEvent>,
    utterance: u64,
    no_speech_ms: u64,
    alive: Arc<AtomicBool>,
) {
    let mut finished = false;
    let emit = |kind: RecognitionEventKind| {
        let events = events.clone();
        async move {
            let _ = events.send(RecognitionEvent { utterance, kind }).await;
        }
    };

    let failure = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break format!("recognizer read failed: {}", e),
            None => break "recognizer closed the stream".to_string(),
        };
        let data = match msg {
            Message::Binary(data) => data,
            Message::Close(_) => break "recognizer closed the stream".to_string(),
            Message::Text(text) => {
                warn!(utterance, "ignoring text frame from recognizer: {}", text.as_str());
                continue;
            }
            _ => continue,
        };
        let payload = match protocol::decode_response(&data) {
            Ok(ServerResponse::Result { payload, .. }) => payload,
            Ok(ServerResponse::Ack { sequence }) => {
                debug!(utterance, ?sequence, "recognizer ack");
                continue;
            }
            Ok(ServerResponse::Error { code, message }) => {
                break format!("recognizer error {}: {}", code, message)
            }
            Err(e) => break e.to_string(),
        };
        let parsed: RecognitionPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(e) => break format!("malformed recognizer result: {}", e),
        };
        if parsed.is_error() {
            break format!(
                "recognizer error {}: {}",
                parsed.code.unwrap_or_default(),
                parsed.message.clone().unwrap_or_default()
            );
        }
        if finished {
            continue;
        }

        let text = parsed.text().to_string();
        let no_speech = text.is_empty() && parsed.duration_ms() >= no_speech_ms;
        if parsed.is_definite() || no_speech {
            finished = true;
            info!(utterance, no_speech, chars = text.len(), "utterance recognized");
            emit(RecognitionEventKind::Final { text }).await;
        } else if !text.is_empty() {
            emit(RecognitionEventKind::Partial { text }).await;
        }
    };

    alive.store(false, Ordering::Release);
    if finished {
        debug!(utterance, "recognizer link ended after final result: {}", failure);
    } else {
        warn!(utterance, "recognizer stream ended: {}", failure);
        emit(RecognitionEventKind::Unavailable { reason: failure }).await;
    }
}

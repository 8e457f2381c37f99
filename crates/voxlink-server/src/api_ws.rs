//! Device WebSocket endpoint and session registry.
//!
//! Every device holds one WebSocket at `/ws`. Binary frames carry encoded
//! audio in both directions and text frames carry JSON control messages.
//! The socket is split: a writer task drains the session's bounded
//! [`Outbound`] queue while the handler forwards inbound traffic to the
//! [`AudioSession`].

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::Instrument;
use uuid::Uuid;
use voxlink_asr::RecognitionClient;
use voxlink_types::{AudioFrame, DeviceControl};
use voxlink_voice::{
    AudioSession, ChannelTransport, CloseReason, FrameSizeVad, Inbound, Outbound, SessionParts,
};

/// Longest accepted device id.
const MAX_DEVICE_ID_LEN: usize = 128;

/// Grace period for the writer to flush after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

const INBOUND_CAPACITY: usize = 64;

/// Header some firmwares use instead of the query parameter.
const DEVICE_ID_HEADER: &str = "device-id";

#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub device_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session limit of {0} reached")]
    Full(usize),
}

/// Type alias for the session map to satisfy clippy complexity checks.
type SessionMap = HashMap<String, (Uuid, mpsc::Sender<Outbound>)>;

/// Live device sessions, bounded by `server.max_connections`.
///
/// A device has at most one session. Registering a device that is already
/// connected asks the old connection to close and takes its slot.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Whether a session for `device_id` would be accepted right now.
    pub async fn has_room(&self, device_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(device_id) || sessions.len() < self.max_sessions
    }

    /// Registers a session and returns its id.
    pub async fn register(
        &self,
        device_id: &str,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<Uuid, RegistryError> {
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(device_id) && sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }
        if let Some((old_id, old_sender)) =
            sessions.insert(device_id.to_string(), (session_id, sender))
        {
            if let Err(e) = old_sender.try_send(Outbound::Close) {
                tracing::debug!(device_id, "old session already closing: {}", e);
            }
            tracing::info!(
                device_id,
                old_session = %old_id,
                "replaced existing device session"
            );
        }
        Ok(session_id)
    }

    /// Removes a session if the session ID still matches.
    pub async fn remove(&self, device_id: &str, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(device_id)
            .is_some_and(|(current, _)| *current == session_id)
        {
            sessions.remove(device_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.sessions.read().await.contains_key(device_id)
    }
}

fn resolve_device_id(params: WsConnectParams, headers: &HeaderMap) -> Option<String> {
    let id = params.device_id.or_else(|| {
        headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })?;
    let id = id.trim();
    if id.is_empty() || id.len() > MAX_DEVICE_ID_LEN || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

/// WebSocket handler: `GET /ws?device_id=...`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(device_id) = resolve_device_id(params, &headers) else {
        tracing::warn!("websocket connect without a usable device id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    if !state.sessions.has_room(&device_id).await {
        tracing::warn!(
            device_id = %device_id,
            max_connections = state.config.server.max_connections,
            "session limit reached, refusing device"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

/// Handles one device connection from upgrade to close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, device_id: String) {
    let (tx, rx) = mpsc::channel::<Outbound>(state.config.session.outbound_capacity.max(1));

    let session_id = match state.sessions.register(&device_id, tx.clone()).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(device_id = %device_id, "dropping device connection: {}", e);
            let mut socket = socket;
            let _ = socket.send(AxumMessage::Close(None)).await;
            return;
        }
    };

    let span = tracing::info_span!(
        "device_session",
        device_id = %device_id,
        session_id = %session_id
    );
    let reason = serve_device(socket, &state, &device_id, session_id, tx, rx)
        .instrument(span)
        .await;

    tracing::info!(
        device_id = %device_id,
        session_id = %session_id,
        reason = %reason.map_or_else(|| "aborted".to_string(), |r| r.to_string()),
        "device session closed"
    );
}

async fn serve_device(
    socket: WebSocket,
    state: &AppState,
    device_id: &str,
    session_id: Uuid,
    tx: mpsc::Sender<Outbound>,
    mut rx: mpsc::Receiver<Outbound>,
) -> Option<CloseReason> {
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Audio(payload) => AxumMessage::Binary(payload),
                Outbound::Control(control) => match serde_json::to_string(&control) {
                    Ok(json) => AxumMessage::Text(json.into()),
                    Err(e) => {
                        tracing::error!("failed to serialize control message: {}", e);
                        continue;
                    }
                },
                Outbound::Close => {
                    let _ = sender.send(AxumMessage::Close(None)).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);
    let recognizer = RecognitionClient::new(state.recognizer.clone(), device_id, events_tx);
    let session = AudioSession::new(SessionParts {
        device_id: device_id.to_string(),
        config: state.session.clone(),
        preroll_frames: state.recognizer.preroll_frames,
        transport: Arc::new(ChannelTransport::new(tx)),
        vad: Box::new(FrameSizeVad::default()),
        replies: state.replies.clone(),
        synthesizer: state.synthesizer.clone(),
        completion: state.session.completion_detector(),
        recognizer: Box::new(recognizer),
        recognition_events: events_rx,
    });
    tracing::info!("device session started");

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let mut session_task = tokio::spawn(session.run(inbound_rx));

    let finished = tokio::select! {
        res = &mut session_task => res,
        () = forward_inbound(&mut receiver, inbound_tx) => session_task.await,
    };
    let reason = match finished {
        Ok(reason) => Some(reason),
        Err(e) => {
            tracing::error!("device session task failed: {}", e);
            None
        }
    };

    // The registry holds the last writer handle besides the session's own.
    state.sessions.remove(device_id, session_id).await;
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        tracing::debug!("writer did not drain in time");
        send_task.abort();
    }
    reason
}

/// Forwards device traffic to the session until the socket closes.
/// Dropping `inbound` tells the session its transport is gone.
async fn forward_inbound(receiver: &mut SplitStream<WebSocket>, inbound: mpsc::Sender<Inbound>) {
    let mut seq = 0u64;
    while let Some(Ok(message)) = receiver.next().await {
        let item = match message {
            AxumMessage::Binary(payload) => {
                seq += 1;
                Inbound::Audio(AudioFrame::new(seq, payload))
            }
            AxumMessage::Text(text) => match serde_json::from_str::<DeviceControl>(text.as_str()) {
                Ok(control) => Inbound::Control(control),
                Err(e) => {
                    tracing::debug!("ignoring malformed control message: {}", e);
                    continue;
                }
            },
            AxumMessage::Close(_) => break,
            _ => continue,
        };
        if inbound.send(item).await.is_err() {
            break;
        }
    }
}

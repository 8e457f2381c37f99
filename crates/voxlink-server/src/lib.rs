//! Voxlink gateway process wiring.

pub mod api_ws;
pub mod config;

use axum::{routing::get, Extension, Json, Router};
use config::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use voxlink_asr::RecognizerConfig;
use voxlink_command::{
    CommandChannel, DeliveryRateLimiter, LocalBus, MessageBus, PriorityMessageQueue,
};
use voxlink_voice::{
    ReplyGenerator, SessionConfig, SilentReplyGenerator, SpeechSynthesizer, TextOnlySynthesizer,
};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub recognizer: Arc<RecognizerConfig>,
    pub session: Arc<SessionConfig>,
    /// Live device sessions.
    pub sessions: api_ws::SessionRegistry,
    /// Bus used to reach devices outside a live session.
    pub bus: Arc<dyn MessageBus>,
    pub commands: CommandChannel,
    /// Unsolicited notifications waiting for delivery.
    pub queue: PriorityMessageQueue,
    pub replies: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl AppState {
    /// Builds the state with the in-process bus and the built-in reply seams.
    ///
    /// Must be called inside a tokio runtime; the command router is spawned
    /// here.
    pub fn new(config: Config) -> Self {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new(config.command.bus_capacity));
        Self::with_parts(
            config,
            bus,
            Arc::new(SilentReplyGenerator),
            Arc::new(TextOnlySynthesizer),
        )
    }

    pub fn with_parts(
        config: Config,
        bus: Arc<dyn MessageBus>,
        replies: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let limiter = DeliveryRateLimiter::new(config.rate_limit.clone());
        let commands = CommandChannel::spawn(bus.clone(), limiter, config.command.clone());
        let queue = PriorityMessageQueue::new(commands.clone(), config.queue.clone());
        Self {
            recognizer: Arc::new(config.recognizer.clone()),
            session: Arc::new(config.session.clone()),
            sessions: api_ws::SessionRegistry::new(config.server.max_connections),
            config: Arc::new(config),
            bus,
            commands,
            queue,
            replies,
            synthesizer,
        }
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
        "pending_commands": state.commands.outstanding(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(Extension(Arc::new(state)))
}

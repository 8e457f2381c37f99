use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_url() -> String {
    "ws://127.0.0.1:8765/asr".to_string()
}

fn default_cluster() -> String {
    "streaming_common".to_string()
}

fn default_format() -> String {
    "opus".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_bits() -> u16 {
    16
}

fn default_language() -> String {
    "zh-CN".to_string()
}

fn default_workflow() -> String {
    "audio_in,resample,partition,vad,fe,decode,itn,nlu_punctuate".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_no_speech_ms() -> u64 {
    3_000
}

fn default_preroll_frames() -> usize {
    10
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Connection and audio-format settings for the remote recognizer.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default, skip_serializing)]
    pub access_token: String,

    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_bits")]
    pub bits: u16,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default = "default_true")]
    pub punctuate: bool,

    /// Budget for the TCP/WebSocket connect and, separately, for the
    /// handshake response.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Empty text after this much audio counts as "no speech".
    #[serde(default = "default_no_speech_ms")]
    pub no_speech_ms: u64,
    /// Frames of pre-utterance audio replayed on connect.
    #[serde(default = "default_preroll_frames")]
    pub preroll_frames: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_true() -> bool {
    true
}

impl RecognizerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            app_id: String::new(),
            cluster: default_cluster(),
            access_token: String::new(),
            format: default_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits: default_bits(),
            language: default_language(),
            workflow: default_workflow(),
            punctuate: true,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            no_speech_ms: default_no_speech_ms(),
            preroll_frames: default_preroll_frames(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl fmt::Debug for RecognizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognizerConfig")
            .field("url", &self.url)
            .field("app_id", &self.app_id)
            .field("cluster", &self.cluster)
            .field("access_token", &"[REDACTED]")
            .field("format", &self.format)
            .field("sample_rate", &self.sample_rate)
            .field("language", &self.language)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("no_speech_ms", &self.no_speech_ms)
            .field("preroll_frames", &self.preroll_frames)
            .finish()
    }
}

//! Gateway configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use voxlink_asr::RecognizerConfig;
use voxlink_command::{CommandConfig, QueueConfig, RateLimitConfig};
use voxlink_voice::SessionConfig;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Streaming recognizer endpoint and audio format.
    #[serde(default)]
    pub recognizer: RecognizerConfig,

    /// Live audio session timing.
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub command: CommandConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Most device sessions served at once. Further upgrades get `503`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxlink_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXLINK_HOST` overrides `server.host`
/// - `VOXLINK_PORT` overrides `server.port`
/// - `VOXLINK_LOG_LEVEL` overrides `logging.level`
/// - `VOXLINK_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXLINK_RECOGNIZER_URL` overrides `recognizer.url`
/// - `VOXLINK_RECOGNIZER_APP_ID` overrides `recognizer.app_id`
/// - `VOXLINK_RECOGNIZER_TOKEN` overrides `recognizer.access_token`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `VOXLINK_*` overrides looked up through `var`.
pub fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("VOXLINK_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("VOXLINK_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("VOXLINK_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("VOXLINK_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = var("VOXLINK_RECOGNIZER_URL") {
        config.recognizer.url = url;
    }
    if let Some(app_id) = var("VOXLINK_RECOGNIZER_APP_ID") {
        config.recognizer.app_id = app_id;
    }
    if let Some(token) = var("VOXLINK_RECOGNIZER_TOKEN") {
        config.recognizer.access_token = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_connections, 512);
        assert_eq!(config.session.silence_threshold_ms, 800);
        assert_eq!(config.queue.max_retries, 3);
    }

    #[test]
    fn sections_parse_with_partial_tables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100
max_connections = 4

[recognizer]
url = "wss://asr.example/stream"
app_id = "app-1"
access_token = "s3cret"

[session]
completion = "device_playback"

[rate_limit]
max_per_second = 1

[command]
ack_timeout_ms = 2500
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.max_connections, 4);
        assert_eq!(config.recognizer.url, "wss://asr.example/stream");
        assert_eq!(config.rate_limit.max_per_second, 1);
        assert_eq!(config.rate_limit.burst_limit, 5);
        assert_eq!(config.command.ack_timeout_ms, 2500);
        assert_eq!(
            config.session.completion,
            voxlink_voice::CompletionStrategy::DevicePlayback
        );

        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("VOXLINK_PORT", "7000"),
            ("VOXLINK_HOST", "0.0.0.0"),
            ("VOXLINK_LOG_JSON", "1"),
            ("VOXLINK_RECOGNIZER_TOKEN", "from-env"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert!(config.logging.json);
        assert_eq!(config.recognizer.access_token, "from-env");

        // Unparseable values leave the setting alone.
        let mut config = Config::default();
        apply_overrides(&mut config, |key| (key == "VOXLINK_PORT").then(|| "nope".to_string()));
        assert_eq!(config.server.port, 8000);
    }
}

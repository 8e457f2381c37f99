use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_per_minute() -> u32 {
    20
}

fn default_max_per_second() -> u32 {
    2
}

fn default_burst_limit() -> u32 {
    5
}

fn default_burst_window_ms() -> u64 {
    5_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_completion_timeout_ms() -> u64 {
    120_000
}

fn default_bus_capacity() -> usize {
    256
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_pending_per_device() -> usize {
    100
}

fn default_history_size() -> usize {
    50
}

fn default_idle_retention_ms() -> u64 {
    600_000
}

/// Per-device limits on outbound commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_max_per_second")]
    pub max_per_second: u32,
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// How often idle device entries are purged.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_minute: default_max_per_minute(),
            max_per_second: default_max_per_second(),
            burst_limit: default_burst_limit(),
            burst_window_ms: default_burst_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// A dispatched command not acknowledged within this window times out.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// An acknowledged command not completed within this window fails.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// Capacity of the in-process bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl CommandConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries after the first failed attempt before a message is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_pending_per_device")]
    pub max_pending_per_device: usize,
    /// Terminal messages kept per device for status reporting.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// A device with nothing pending or in flight is forgotten, history and
    /// counters included, once it has been idle this long.
    #[serde(default = "default_idle_retention_ms")]
    pub idle_retention_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_pending_per_device: default_max_pending_per_device(),
            history_size: default_history_size(),
            idle_retention_ms: default_idle_retention_ms(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_retention(&self) -> Duration {
        Duration::from_millis(self.idle_retention_ms)
    }
}

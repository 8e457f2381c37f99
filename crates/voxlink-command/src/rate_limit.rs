//! Per-device rate limiting of outbound commands.

use crate::config::RateLimitConfig;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The device is in cooldown after an earlier violation.
    CoolingDown { remaining: Duration },
    PerMinute,
    /// Too many sends in the last second. `hard` rejections also start a
    /// cooldown.
    PerSecond { hard: bool },
    Burst,
}

impl RejectReason {
    /// Whether this rejection put the device into cooldown.
    pub fn starts_cooldown(&self) -> bool {
        matches!(
            self,
            Self::PerMinute | Self::Burst | Self::PerSecond { hard: true }
        )
    }

    /// Earliest moment a retry can succeed, given the limiter's configured
    /// `cooldown`.
    pub fn retry_after(&self, cooldown: Duration) -> Duration {
        match self {
            Self::CoolingDown { remaining } => *remaining,
            Self::PerSecond { hard: false } => SECOND,
            _ => cooldown,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoolingDown { remaining } => {
                write!(f, "cooling down for another {}ms", remaining.as_millis())
            }
            Self::PerMinute => f.write_str("per-minute limit reached"),
            Self::PerSecond { hard: false } => f.write_str("per-second limit reached"),
            Self::PerSecond { hard: true } => f.write_str("per-second limit exceeded twice over"),
            Self::Burst => f.write_str("burst limit reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Rejected(RejectReason),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Counters reported for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateStats {
    pub last_minute: usize,
    pub last_second: usize,
    pub burst: u32,
    pub cooldown_remaining: Option<Duration>,
}

impl RateStats {
    pub fn cooling_down(&self) -> bool {
        self.cooldown_remaining.is_some()
    }
}

#[derive(Debug)]
struct DeviceChannelState {
    /// Accepted sends within the last minute, oldest first.
    sends: VecDeque<Instant>,
    /// Every attempt within the last second, accepted or not.
    attempts: VecDeque<Instant>,
    burst_count: u32,
    burst_started: Instant,
    cooldown_until: Option<Instant>,
}

impl DeviceChannelState {
    fn new(now: Instant) -> Self {
        Self {
            sends: VecDeque::new(),
            attempts: VecDeque::new(),
            burst_count: 0,
            burst_started: now,
            cooldown_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .sends
            .front()
            .is_some_and(|t| now.duration_since(*t) >= MINUTE)
        {
            self.sends.pop_front();
        }
        while self
            .attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= SECOND)
        {
            self.attempts.pop_front();
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }

    fn last_second(&self, now: Instant) -> usize {
        self.sends
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < SECOND)
            .count()
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn expired(&self, now: Instant) -> bool {
        self.sends.is_empty() && self.attempts.is_empty() && self.cooldown_remaining(now).is_none()
    }
}

#[derive(Debug)]
struct LimiterState {
    devices: HashMap<String, DeviceChannelState>,
    last_sweep: Instant,
}

/// Process-wide limiter shared by every command dispatch.
///
/// State is partitioned by device id behind one short-lived mutex that is
/// never held across an await.
#[derive(Clone, Debug)]
pub struct DeliveryRateLimiter {
    config: Arc<RateLimitConfig>,
    state: Arc<Mutex<LimiterState>>,
}

impl DeliveryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(LimiterState {
                devices: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    pub fn check(&self, device_id: &str) -> RateDecision {
        self.check_at(device_id, Instant::now())
    }

    /// Records an attempt to send to `device_id` at `now` and decides whether
    /// it may go out.
    pub fn check_at(&self, device_id: &str, now: Instant) -> RateDecision {
        let cfg = &self.config;
        let mut state = self.lock();
        self.sweep(&mut state, now);

        let device = state
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceChannelState::new(now));
        device.prune(now);

        if let Some(remaining) = device.cooldown_remaining(now) {
            return RateDecision::Rejected(RejectReason::CoolingDown { remaining });
        }

        if now.duration_since(device.burst_started) >= cfg.burst_window() {
            device.burst_count = 0;
            device.burst_started = now;
        }
        device.attempts.push_back(now);

        let reason = if device.sends.len() >= cfg.max_per_minute as usize {
            Some(RejectReason::PerMinute)
        } else if device.attempts.len() > 2 * cfg.max_per_second as usize {
            Some(RejectReason::PerSecond { hard: true })
        } else if device.last_second(now) >= cfg.max_per_second as usize {
            Some(RejectReason::PerSecond { hard: false })
        } else if device.burst_count >= cfg.burst_limit {
            Some(RejectReason::Burst)
        } else {
            None
        };

        match reason {
            None => {
                device.sends.push_back(now);
                device.burst_count += 1;
                RateDecision::Allowed
            }
            Some(soft) if !soft.starts_cooldown() => {
                debug!(device_id, "throttled: {}", soft);
                RateDecision::Rejected(soft)
            }
            Some(reason) => {
                device.cooldown_until = Some(now + cfg.cooldown());
                warn!(
                    device_id,
                    cooldown_ms = cfg.cooldown_ms,
                    "rate limit violated ({}), entering cooldown",
                    reason
                );
                RateDecision::Rejected(reason)
            }
        }
    }

    fn sweep(&self, state: &mut LimiterState, now: Instant) {
        if now.duration_since(state.last_sweep) < self.config.sweep_interval() {
            return;
        }
        state.last_sweep = now;
        let before = state.devices.len();
        state.devices.retain(|_, device| {
            device.prune(now);
            !device.expired(now)
        });
        let purged = before - state.devices.len();
        if purged > 0 {
            debug!(purged, remaining = state.devices.len(), "rate limiter sweep");
        }
    }

    pub fn stats(&self, device_id: &str) -> Option<RateStats> {
        self.stats_at(device_id, Instant::now())
    }

    pub fn stats_at(&self, device_id: &str, now: Instant) -> Option<RateStats> {
        let mut state = self.lock();
        let device = state.devices.get_mut(device_id)?;
        device.prune(now);
        let burst = if now.duration_since(device.burst_started) >= self.config.burst_window() {
            0
        } else {
            device.burst_count
        };
        Some(RateStats {
            last_minute: device.sends.len(),
            last_second: device.last_second(now),
            burst,
            cooldown_remaining: device.cooldown_remaining(now),
        })
    }

    /// Devices currently tracked. Idle entries disappear on the next sweep.
    pub fn tracked_devices(&self) -> usize {
        self.lock().devices.len()
    }
}

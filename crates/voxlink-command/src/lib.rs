//! Out-of-session command delivery for voxlink devices.
//!
//! Devices that have no live audio session are reached over a publish/subscribe
//! [`MessageBus`]. The [`CommandChannel`] publishes `SPEAK` commands and tracks
//! their acknowledgement, the [`DeliveryRateLimiter`] keeps any one device from
//! being flooded, and the [`PriorityMessageQueue`] orders unsolicited
//! notifications so that each device has at most one command in flight.

pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod queue;
pub mod rate_limit;

pub use bus::{BusMessage, LocalBus, MessageBus};
pub use channel::{CommandChannel, TrackHandle};
pub use config::{CommandConfig, QueueConfig, RateLimitConfig};
pub use error::{CommandError, DispatchError, QueueError};
pub use queue::{PriorityMessageQueue, QueueStatus, QueuedMessage};
pub use rate_limit::{DeliveryRateLimiter, RateDecision, RateStats, RejectReason};

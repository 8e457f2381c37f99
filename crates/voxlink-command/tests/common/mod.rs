#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use voxlink_command::{
    BusMessage, CommandChannel, CommandConfig, DeliveryRateLimiter, LocalBus, MessageBus,
    RateLimitConfig,
};
use voxlink_types::{AckMessage, CommandMessage, DeviceEvent, EventMessage, Topic};

/// How the simulated device answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Acknowledge, play for `delay`, report done.
    Complete,
    /// Acknowledge, play for `delay`, report failure.
    Fail,
    /// Acknowledge and never finish.
    AckOnly,
    /// Never answer.
    Silent,
}

pub struct FakeDevice {
    pub received: Arc<Mutex<Vec<CommandMessage>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub fn texts(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.text.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_device(
    bus: Arc<LocalBus>,
    device_id: &str,
    behaviour: Behaviour,
    delay: Duration,
) -> FakeDevice {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let mut rx = bus.subscribe();
    let device_id = device_id.to_string();
    let command_topic = Topic::Command.for_device(&device_id);

    let task = tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            if message.topic != command_topic {
                continue;
            }
            let command: CommandMessage = serde_json::from_str(&message.payload).unwrap();
            log.lock().unwrap().push(command.clone());
            if behaviour == Behaviour::Silent {
                continue;
            }

            let ack = BusMessage::json(
                Topic::Ack.for_device(&device_id),
                &AckMessage::received(command.track_id.clone()),
            )
            .unwrap();
            bus.publish(ack).await.unwrap();

            let evt = match behaviour {
                Behaviour::Complete => DeviceEvent::SpeakDone,
                Behaviour::Fail => DeviceEvent::SpeakFailed,
                _ => continue,
            };
            tokio::time::sleep(delay).await;
            let event = BusMessage::json(
                Topic::Event.for_device(&device_id),
                &EventMessage {
                    evt,
                    track_id: command.track_id,
                },
            )
            .unwrap();
            bus.publish(event).await.unwrap();
        }
    });

    FakeDevice { received, task }
}

pub fn generous_limits() -> RateLimitConfig {
    RateLimitConfig {
        max_per_minute: 1_000,
        max_per_second: 100,
        burst_limit: 100,
        ..RateLimitConfig::default()
    }
}

pub fn channel(bus: &Arc<LocalBus>, limits: RateLimitConfig, config: CommandConfig) -> CommandChannel {
    CommandChannel::spawn(bus.clone(), DeliveryRateLimiter::new(limits), config)
}

/// Polls `cond` on the paused clock until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

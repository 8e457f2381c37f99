mod common;

use common::{channel, generous_limits, spawn_device, wait_until, Behaviour};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use voxlink_command::{
    CommandConfig, LocalBus, PriorityMessageQueue, QueueConfig, QueueError, RateLimitConfig,
};
use voxlink_types::MessageStatus;

fn command_config() -> CommandConfig {
    CommandConfig {
        ack_timeout_ms: 1_000,
        completion_timeout_ms: 10_000,
        bus_capacity: 64,
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        max_retries: 2,
        retry_delay_ms: 500,
        max_pending_per_device: 10,
        history_size: 5,
        idle_retention_ms: 600_000,
    }
}

#[tokio::test(start_paused = true)]
async fn lower_priority_value_goes_first() {
    let bus = Arc::new(LocalBus::new(64));
    let device = spawn_device(bus.clone(), "d1", Behaviour::Complete, Duration::from_millis(200));
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        queue_config(),
    );

    queue.enqueue("d1", "weather", "info", 5, json!({})).unwrap();
    queue.enqueue("d1", "alarm", "alert", 0, json!({})).unwrap();
    queue.enqueue("d1", "doorbell", "alert", 0, json!({"door": "front"})).unwrap();

    wait_until(|| queue.status("d1").completed == 3).await;
    assert_eq!(device.texts(), vec!["alarm", "doorbell", "weather"]);

    let history = queue.history("d1");
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|m| m.status == MessageStatus::Completed));
    assert!(history.iter().all(|m| m.attempts == 1));
    assert_eq!(history[1].metadata["door"], "front");
    assert_eq!(queue.pending_count("d1"), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_the_limit() {
    let bus = Arc::new(LocalBus::new(64));
    let device = spawn_device(bus.clone(), "d2", Behaviour::Silent, Duration::ZERO);
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        queue_config(),
    );

    queue.enqueue("d2", "anyone home?", "info", 1, json!(null)).unwrap();
    wait_until(|| queue.status("d2").failed == 1).await;

    // One attempt plus two retries.
    assert_eq!(device.count(), 3);
    let history = queue.history("d2");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::Failed);
    assert_eq!(history[0].attempts, 3);
    assert!(history[0].last_error.as_deref().unwrap().contains("TimedOut"));

    // Every attempt used a fresh track.
    let received = device.received.lock().unwrap().clone();
    assert_ne!(received[0].track_id, received[1].track_id);
    assert_ne!(received[1].track_id, received[2].track_id);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(device.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn one_command_in_flight_per_device() {
    let bus = Arc::new(LocalBus::new(64));
    let device = spawn_device(bus.clone(), "d3", Behaviour::Complete, Duration::from_secs(2));
    let channel = channel(&bus, generous_limits(), command_config());
    let queue = PriorityMessageQueue::new(channel.clone(), queue_config());

    for i in 0..4 {
        queue.enqueue("d3", format!("note {}", i), "info", 3, json!({})).unwrap();
    }

    let mut peak = 0;
    wait_until(|| {
        peak = peak.max(channel.outstanding());
        queue.status("d3").completed == 4
    })
    .await;
    assert_eq!(peak, 1);
    assert_eq!(device.count(), 4);
}

#[tokio::test(start_paused = true)]
async fn devices_drain_independently() {
    let bus = Arc::new(LocalBus::new(64));
    let slow = spawn_device(bus.clone(), "slow", Behaviour::Silent, Duration::ZERO);
    let fast = spawn_device(bus.clone(), "fast", Behaviour::Complete, Duration::from_millis(100));
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        queue_config(),
    );

    queue.enqueue("slow", "wait for me", "info", 0, json!({})).unwrap();
    queue.enqueue("fast", "go", "info", 0, json!({})).unwrap();

    wait_until(|| queue.status("fast").completed == 1).await;
    assert_eq!(fast.count(), 1);
    assert_eq!(slow.count(), 1);
    let slow_status = queue.status("slow");
    assert_eq!(slow_status.completed, 0);
    assert_eq!(slow_status.failed, 0);
    let in_flight = slow_status.in_flight.unwrap();
    assert_eq!(in_flight.status, MessageStatus::Sending);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_messages_wait_and_retry() {
    let bus = Arc::new(LocalBus::new(64));
    let device = spawn_device(bus.clone(), "d4", Behaviour::Complete, Duration::ZERO);
    let limits = RateLimitConfig {
        max_per_second: 1,
        ..generous_limits()
    };
    let queue = PriorityMessageQueue::new(
        channel(&bus, limits, command_config()),
        QueueConfig {
            max_retries: 5,
            ..queue_config()
        },
    );

    queue.enqueue("d4", "first", "info", 0, json!({})).unwrap();
    queue.enqueue("d4", "second", "info", 0, json!({})).unwrap();

    wait_until(|| queue.status("d4").completed == 2).await;
    assert_eq!(device.texts(), vec!["first", "second"]);
    let history = queue.history("d4");
    assert_eq!(history[1].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_new_messages() {
    let bus = Arc::new(LocalBus::new(64));
    let _device = spawn_device(bus.clone(), "d5", Behaviour::Silent, Duration::ZERO);
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        QueueConfig {
            max_pending_per_device: 2,
            ..queue_config()
        },
    );

    queue.enqueue("d5", "a", "info", 0, json!({})).unwrap();
    queue.enqueue("d5", "b", "info", 0, json!({})).unwrap();
    let err = queue.enqueue("d5", "c", "info", 0, json!({})).unwrap_err();
    assert_eq!(
        err,
        QueueError::Full {
            device_id: "d5".to_string(),
            capacity: 2
        }
    );
    // Other devices are unaffected.
    assert!(queue.enqueue("d6", "c", "info", 0, json!({})).is_ok());
}

#[tokio::test(start_paused = true)]
async fn history_is_bounded() {
    let bus = Arc::new(LocalBus::new(64));
    let _device = spawn_device(bus.clone(), "d7", Behaviour::Complete, Duration::ZERO);
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        queue_config(),
    );

    for i in 0..8 {
        queue.enqueue("d7", format!("m{}", i), "info", 0, json!({})).unwrap();
    }
    wait_until(|| queue.status("d7").completed == 8).await;

    let texts: Vec<_> = queue.history("d7").into_iter().map(|m| m.content).collect();
    assert_eq!(texts, vec!["m3", "m4", "m5", "m6", "m7"]);
}

#[tokio::test(start_paused = true)]
async fn idle_devices_are_forgotten() {
    let bus = Arc::new(LocalBus::new(64));
    let _old = spawn_device(bus.clone(), "old", Behaviour::Complete, Duration::ZERO);
    let _new = spawn_device(bus.clone(), "new", Behaviour::Complete, Duration::ZERO);
    let queue = PriorityMessageQueue::new(
        channel(&bus, generous_limits(), command_config()),
        QueueConfig {
            idle_retention_ms: 5_000,
            ..queue_config()
        },
    );

    queue.enqueue("old", "hello", "info", 0, json!({})).unwrap();
    wait_until(|| queue.status("old").completed == 1).await;
    assert_eq!(queue.tracked_devices(), 1);

    // Still inside the retention window: history survives.
    tokio::time::sleep(Duration::from_secs(1)).await;
    queue.enqueue("new", "hi", "info", 0, json!({})).unwrap();
    assert_eq!(queue.tracked_devices(), 2);
    assert_eq!(queue.history("old").len(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    queue.enqueue("new", "again", "info", 0, json!({})).unwrap();
    assert_eq!(queue.tracked_devices(), 1);
    assert_eq!(queue.status("old").completed, 0);
    assert!(queue.history("old").is_empty());

    // "new" had gone idle as well, so it starts over.
    wait_until(|| queue.status("new").completed == 1).await;
}

#[tokio::test(start_paused = true)]
async fn cooldown_rejection_waits_out_the_cooldown() {
    let bus = Arc::new(LocalBus::new(64));
    let device = spawn_device(bus.clone(), "d8", Behaviour::Complete, Duration::ZERO);
    let limits = RateLimitConfig {
        burst_limit: 1,
        burst_window_ms: 1_000,
        cooldown_ms: 3_000,
        ..generous_limits()
    };
    let queue = PriorityMessageQueue::new(
        channel(&bus, limits, command_config()),
        QueueConfig {
            max_retries: 1,
            retry_delay_ms: 100,
            ..queue_config()
        },
    );

    let start = tokio::time::Instant::now();
    queue.enqueue("d8", "first", "info", 0, json!({})).unwrap();
    queue.enqueue("d8", "second", "info", 0, json!({})).unwrap();

    // The single retry lands after the cooldown instead of inside it.
    wait_until(|| queue.status("d8").completed == 2).await;
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(queue.status("d8").failed, 0);
    assert_eq!(device.texts(), vec!["first", "second"]);
    assert_eq!(queue.history("d8")[1].attempts, 2);
}

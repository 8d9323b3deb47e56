//! Stream bus: run-scoped event fan-out.
//!
//! The executor only publishes; subscription and delivery to clients is
//! the bus's responsibility. Unlike the unbounded process-global emitter
//! this replaces, the in-process implementation bounds both per-run
//! channel state (evicted on terminal runs or idleness) and subscriber
//! counts (capped, with a warning when the cap is hit).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core::errors::{EngineError, Result};
use crate::engine::progress::StepEventEnvelope;

/// Publish/subscribe seam between the engine and its transport layer.
pub trait StreamBus: Send + Sync {
    /// Fire-and-forget publication; a run with no subscribers is fine.
    fn publish(&self, run_id: &str, event: StepEventEnvelope);

    /// Opens a subscription to a run's events from this point onward.
    fn subscribe(&self, run_id: &str) -> Result<async_broadcast::Receiver<StepEventEnvelope>>;
}

struct RunChannel {
    sender: async_broadcast::Sender<StepEventEnvelope>,
    /// Keeps the channel open while no subscriber is attached yet.
    _keepalive: async_broadcast::InactiveReceiver<StepEventEnvelope>,
    last_publish: Instant,
}

/// In-process bus backed by one broadcast channel per run.
pub struct InProcessBus {
    channels: DashMap<String, RunChannel>,
    capacity: usize,
    max_subscribers: usize,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_limits(256, 64)
    }

    /// `capacity` bounds buffered events per run (oldest dropped on
    /// overflow); `max_subscribers` bounds concurrent receivers per run.
    pub fn with_limits(capacity: usize, max_subscribers: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
            max_subscribers,
        }
    }

    fn with_channel<T>(&self, run_id: &str, f: impl FnOnce(&mut RunChannel) -> T) -> T {
        let mut entry = self.channels.entry(run_id.to_string()).or_insert_with(|| {
            let (mut sender, receiver) = async_broadcast::broadcast(self.capacity);
            sender.set_overflow(true);
            RunChannel {
                sender,
                _keepalive: receiver.deactivate(),
                last_publish: Instant::now(),
            }
        });
        f(entry.value_mut())
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .get(run_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drops a run's channel; call when the run reaches a terminal state.
    pub fn evict(&self, run_id: &str) {
        if self.channels.remove(run_id).is_some() {
            debug!(run_id, "evicted stream channel");
        }
    }

    /// Drops channels with no publication for longer than `ttl`.
    pub fn evict_idle(&self, ttl: Duration) {
        let before = self.channels.len();
        self.channels
            .retain(|_, channel| channel.last_publish.elapsed() < ttl);
        let evicted = before - self.channels.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle stream channels");
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBus for InProcessBus {
    fn publish(&self, run_id: &str, event: StepEventEnvelope) {
        self.with_channel(run_id, |channel| {
            channel.last_publish = Instant::now();
            // Inactive (no subscribers) and overflow outcomes are both
            // fine for fire-and-forget publication.
            let _ = channel.sender.try_broadcast(event);
        });
    }

    fn subscribe(&self, run_id: &str) -> Result<async_broadcast::Receiver<StepEventEnvelope>> {
        let limit = self.max_subscribers;
        self.with_channel(run_id, |channel| {
            let current = channel.sender.receiver_count();
            if current >= limit {
                warn!(run_id, current, limit, "subscriber limit reached for run");
                return Err(EngineError::SubscriberLimit {
                    run_id: run_id.to_string(),
                    limit,
                });
            }
            Ok(channel.sender.new_receiver())
        })
    }
}

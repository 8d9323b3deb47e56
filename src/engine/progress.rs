//! Progress emission: per-node streaming writers and step events.
//!
//! The emitter accumulates partial output per node, publishes discrete
//! step events to the stream bus, and holds no subscriber list of its own;
//! fan-out to clients is entirely the bus's job. Per-node writer state is
//! bounded: it is dropped on terminal events and evictable by TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::bus::StreamBus;

/// Lifecycle stage of a step event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStage {
    Start,
    Complete,
    Error,
}

/// A discrete progress event for one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub stage: StepStage,
    pub node_id: String,
    pub node_kind: String,
    pub payload: Value,
}

/// Envelope with run correlation and ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub run_id: String,
    pub timestamp_ms: u64,
    pub event: StepEvent,
}

/// Global sequence counter for events
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next event sequence number
pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Accumulates a node's partial text output across token events. The
/// buffer resets exactly on complete or error, so a later burst of tokens
/// starts a clean accumulation.
#[derive(Debug)]
pub struct StreamingWriter {
    buffer: String,
    last_touched: Instant,
}

impl StreamingWriter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last_touched: Instant::now(),
        }
    }

    /// Appends a token and returns the accumulated text so far.
    pub fn push_token(&mut self, token: &str) -> &str {
        self.buffer.push_str(token);
        self.last_touched = Instant::now();
        &self.buffer
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_touched = Instant::now();
    }
}

impl Default for StreamingWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes step events for node executions and owns the per-node
/// streaming writers for one process.
pub struct ProgressEmitter {
    bus: Arc<dyn StreamBus>,
    writers: DashMap<(String, String), StreamingWriter>,
}

impl ProgressEmitter {
    pub fn new(bus: Arc<dyn StreamBus>) -> Self {
        Self {
            bus,
            writers: DashMap::new(),
        }
    }

    fn publish(&self, run_id: &str, stage: StepStage, node_id: &str, node_kind: &str, payload: Value) {
        let envelope = StepEventEnvelope {
            version: 1,
            sequence: next_sequence(),
            run_id: run_id.to_string(),
            timestamp_ms: now_ms(),
            event: StepEvent {
                stage,
                node_id: node_id.to_string(),
                node_kind: node_kind.to_string(),
                payload,
            },
        };
        // Fire-and-forget: a run with no listeners still executes.
        self.bus.publish(run_id, envelope);
    }

    /// Announces a node starting, with its resolved input as payload.
    pub fn node_started(&self, run_id: &str, node_id: &str, node_kind: &str, input: Value) {
        self.publish(run_id, StepStage::Start, node_id, node_kind, input);
    }

    /// Accumulates one streamed token and publishes the running buffer.
    pub fn token(&self, run_id: &str, node_id: &str, node_kind: &str, token: &str) {
        let key = (run_id.to_string(), node_id.to_string());
        let mut writer = self.writers.entry(key).or_default();
        let buffer = writer.push_token(token).to_string();
        drop(writer);
        self.publish(
            run_id,
            StepStage::Start,
            node_id,
            node_kind,
            json!({"token": token, "buffer": buffer}),
        );
    }

    /// Carries arbitrary metadata through unchanged.
    pub fn metadata(&self, run_id: &str, node_id: &str, node_kind: &str, metadata: Value) {
        self.publish(
            run_id,
            StepStage::Start,
            node_id,
            node_kind,
            json!({"metadata": metadata}),
        );
    }

    /// Publishes completion and resets the node's accumulation.
    pub fn node_completed(&self, run_id: &str, node_id: &str, node_kind: &str, output: Value) {
        self.writers
            .remove(&(run_id.to_string(), node_id.to_string()));
        self.publish(run_id, StepStage::Complete, node_id, node_kind, output);
    }

    /// Publishes failure and resets the node's accumulation.
    pub fn node_failed(&self, run_id: &str, node_id: &str, node_kind: &str, message: &str) {
        self.writers
            .remove(&(run_id.to_string(), node_id.to_string()));
        self.publish(
            run_id,
            StepStage::Error,
            node_id,
            node_kind,
            json!({"message": message}),
        );
    }

    /// Drops all writer state for a run once it reaches a terminal status.
    pub fn run_finished(&self, run_id: &str) {
        self.writers.retain(|(rid, _), _| rid != run_id);
    }

    /// Evicts writers untouched for longer than `ttl`; a belt-and-braces
    /// bound for runs that never reached a terminal event.
    pub fn evict_idle(&self, ttl: Duration) {
        let before = self.writers.len();
        self.writers
            .retain(|_, writer| writer.last_touched.elapsed() < ttl);
        let evicted = before - self.writers.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle streaming writers");
        }
    }

    /// Accumulated buffer for a node, if any tokens are in flight.
    pub fn buffer(&self, run_id: &str, node_id: &str) -> Option<String> {
        self.writers
            .get(&(run_id.to_string(), node_id.to_string()))
            .map(|w| w.buffer().to_string())
    }
}

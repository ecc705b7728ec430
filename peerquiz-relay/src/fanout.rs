//! Broadcast Fanout
//!
//! Serializes an event once and pushes it onto the outbound queue of
//! every matching connection. Fire-and-forget: no acknowledgment, no
//! cross-connection ordering promise. Events from a single caller are
//! enqueued in publish order on every queue, so each client observes a
//! single source's events in submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peerquiz_core::ServerMessage;
use tracing::{debug, warn};

use crate::gateway::{ConnId, EnqueueError, Gateway};

/// Fanout counters.
#[derive(Debug, Default)]
pub struct FanoutCounters {
    pub published: AtomicU64,
    pub deliveries: AtomicU64,
    pub filtered: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FanoutCountersSnapshot {
    pub published: u64,
    pub deliveries: u64,
    pub filtered: u64,
    pub failed: u64,
}

impl FanoutCounters {
    pub fn snapshot(&self) -> FanoutCountersSnapshot {
        FanoutCountersSnapshot {
            published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Pushes events to the gateway's live connections.
pub struct Fanout {
    gateway: Arc<Gateway>,
    counters: FanoutCounters,
}

impl Fanout {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            counters: FanoutCounters::default(),
        }
    }

    /// Broadcast one event.
    ///
    /// - `topic`: events tagged with a topic reach connections whose
    ///   filter matches plus unfiltered connections; untagged events
    ///   reach everyone.
    /// - `exclude`: skip the originating connection, if any.
    ///
    /// A failed enqueue on one connection never interrupts delivery to
    /// the rest; a full queue schedules that connection for closure.
    pub fn publish(&self, message: &ServerMessage, topic: Option<&str>, exclude: Option<ConnId>) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to serialize broadcast");
                return;
            }
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let handles = self.gateway.snapshot_handles();
        debug!(
            kind = message.kind(),
            topic = topic.unwrap_or("-"),
            connections = handles.len(),
            "publishing event"
        );

        for handle in handles {
            if Some(handle.id()) == exclude {
                continue;
            }
            if let Some(topic) = topic {
                // A connection without a filter receives everything.
                if let Some(filter) = handle.topic() {
                    if filter != topic {
                        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
            match handle.enqueue(payload.clone()) {
                Ok(()) => {
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(EnqueueError::QueueFull) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.gateway.drop_slow(&handle);
                }
                Err(EnqueueError::Closed) => {
                    // Connection raced shut mid-broadcast; fail safe.
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn counters(&self) -> &FanoutCounters {
        &self.counters
    }
}

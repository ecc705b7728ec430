//! Periodic Reconciler
//!
//! Recurring task that expires stale presence entries (announcing each
//! one offline exactly once), sweeps aged cache entries, and logs
//! aggregate health figures. This is the only place that iterates the
//! stores wholesale, so its cadence is floored by
//! `RelayConfig::reconciler_interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerquiz_core::ServerMessage;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::fanout::Fanout;
use crate::gateway::Gateway;
use crate::presence::PresenceRegistry;

/// Reconciler counters.
#[derive(Debug, Default)]
pub struct ReconcilerCounters {
    pub cycles: AtomicU64,
    pub presence_expired: AtomicU64,
    pub cache_swept: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconcilerCountersSnapshot {
    pub cycles: u64,
    pub presence_expired: u64,
    pub cache_swept: u64,
}

impl ReconcilerCounters {
    pub fn snapshot(&self) -> ReconcilerCountersSnapshot {
        ReconcilerCountersSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            presence_expired: self.presence_expired.load(Ordering::Relaxed),
            cache_swept: self.cache_swept.load(Ordering::Relaxed),
        }
    }
}

/// One reconciliation pass: presence expiry, then cache sweep.
pub fn reconcile(
    presence: &PresenceRegistry,
    cache: &CacheStore,
    fanout: &Fanout,
    gateway: &Gateway,
    window: Duration,
    counters: &ReconcilerCounters,
) {
    counters.cycles.fetch_add(1, Ordering::Relaxed);

    let offline = presence.expire_stale(window);
    for username in &offline {
        info!(username = %username, "user offline");
        fanout.publish(&ServerMessage::user_offline(username), None, None);
    }
    counters
        .presence_expired
        .fetch_add(offline.len() as u64, Ordering::Relaxed);

    let swept = cache.sweep();
    counters.cache_swept.fetch_add(swept as u64, Ordering::Relaxed);

    debug!(
        connections = gateway.connection_count(),
        presence = presence.len(),
        cache_entries = cache.len(),
        expired = offline.len(),
        swept,
        "reconciler cycle"
    );
}

/// Background task driving `reconcile` on a fixed interval until the
/// shutdown signal fires.
pub async fn reconciler_task(
    presence: Arc<PresenceRegistry>,
    cache: Arc<CacheStore>,
    fanout: Arc<Fanout>,
    gateway: Arc<Gateway>,
    cadence: Duration,
    window: Duration,
    counters: Arc<ReconcilerCounters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(cadence);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = cadence.as_secs(),
        expiry_window_secs = window.as_secs(),
        "reconciler started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                reconcile(&presence, &cache, &fanout, &gateway, window, &counters);
            }
        }
    }

    let snapshot = counters.snapshot();
    info!(
        cycles = snapshot.cycles,
        presence_expired = snapshot.presence_expired,
        cache_swept = snapshot.cache_swept,
        "reconciler stopped"
    );
}

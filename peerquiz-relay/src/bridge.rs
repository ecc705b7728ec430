//! Change Bridge
//!
//! Supervised task that subscribes to the backend store's per-table
//! change feed over WebSocket. Each notification first invalidates the
//! cache entries scoped to the changed table, then broadcasts a
//! `realtime_update` tagged with that table so per-topic subscribers
//! can filter.
//!
//! The feed disconnecting is a degraded mode, not a fatal one: the
//! task reconnects with bounded exponential backoff and jitter, and in
//! the meantime the cache keeps serving entries until their TTL runs
//! out on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerquiz_core::{ChangeEvent, ChangeNotification, CoreError};
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::RelayConfig;
use crate::fanout::Fanout;

/// Tables the relay watches. Answers and votes are the only rows whose
/// mutations matter to connected clients.
const WATCHED_TABLES: &[&str] = &["answers", "votes"];

/// Change bridge counters.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub notifications: AtomicU64,
    pub invalidated_keys: AtomicU64,
    pub malformed: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BridgeCountersSnapshot {
    pub notifications: u64,
    pub invalidated_keys: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

impl BridgeCounters {
    pub fn snapshot(&self) -> BridgeCountersSnapshot {
        BridgeCountersSnapshot {
            notifications: self.notifications.load(Ordering::Relaxed),
            invalidated_keys: self.invalidated_keys.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

enum SessionEnd {
    /// Shutdown was signalled; the supervisor should stop.
    Shutdown,
    /// The feed closed cleanly; the supervisor should reconnect.
    Closed { processed: u64 },
    /// The connection or stream failed; the supervisor should
    /// reconnect. Carries how much was processed first so a productive
    /// session still resets the backoff ladder.
    Failed {
        processed: u64,
        error: tokio_tungstenite::tungstenite::Error,
    },
}

/// Apply one raw feed payload: invalidate, then broadcast.
///
/// Invalidation strictly precedes the broadcast so a client that
/// refetches on receipt never reads the stale entry.
fn apply_notification(
    cache: &CacheStore,
    fanout: &Fanout,
    counters: &BridgeCounters,
    payload: &str,
) {
    let notification: ChangeNotification = match serde_json::from_str(payload) {
        Ok(notification) => notification,
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            let err = CoreError::MalformedNotification(e.to_string());
            warn!(error = %err, "rejecting change feed payload");
            return;
        }
    };

    counters.notifications.fetch_add(1, Ordering::Relaxed);
    let removed = cache.invalidate_topic(&notification.table);
    counters
        .invalidated_keys
        .fetch_add(removed as u64, Ordering::Relaxed);
    debug!(
        table = %notification.table,
        event = notification.event_type.as_str(),
        invalidated = removed,
        "change notification applied"
    );

    let event = ChangeEvent::from_notification(notification);
    let topic = event.topic().to_string();
    fanout.publish(&event.to_message(), Some(&topic), None);
}

/// One connected session against the feed. Returns when the feed
/// closes, errors, or shutdown is signalled.
async fn run_session(
    config: &RelayConfig,
    cache: &CacheStore,
    fanout: &Fanout,
    counters: &BridgeCounters,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut stream = match connect_async(&config.change_feed_url).await {
        Ok((stream, _)) => stream,
        Err(error) => return SessionEnd::Failed { processed: 0, error },
    };
    info!(url = %config.change_feed_url, "change feed connected");

    let mut processed = 0u64;
    for table in WATCHED_TABLES {
        let subscribe = json!({ "type": "subscribe", "table": table }).to_string();
        if let Err(error) = stream.send(Message::Text(subscribe)).await {
            return SessionEnd::Failed { processed, error };
        }
    }

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    // Unsubscribe is a normal close, best effort.
                    let _ = stream.close(None).await;
                    return SessionEnd::Shutdown;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        apply_notification(cache, fanout, counters, &text);
                        processed += 1;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Closed { processed };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return SessionEnd::Failed { processed, error },
                }
            }
        }
    }
}

/// Base delay for the next connect attempt. Any session that processed
/// traffic restarts the ladder, however it ended; only back-to-back
/// unproductive sessions climb it.
fn backoff_after(current: Duration, processed: u64, config: &RelayConfig) -> Duration {
    if processed > 0 {
        config.feed_backoff_initial
    } else {
        current
    }
}

fn with_jitter(base: Duration) -> Duration {
    let quarter = (base.as_millis() / 4) as u64;
    let jitter = if quarter == 0 {
        0
    } else {
        rand::rng().random_range(0..=quarter)
    };
    base + Duration::from_millis(jitter)
}

/// Supervisor loop: connect, stream, and on failure reconnect with
/// exponential backoff capped at the configured ceiling.
pub async fn change_bridge_task(
    config: RelayConfig,
    cache: Arc<CacheStore>,
    fanout: Arc<Fanout>,
    counters: Arc<BridgeCounters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = config.feed_backoff_initial;

    info!("change bridge started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let processed = match run_session(&config, &cache, &fanout, &counters, &mut shutdown_rx)
            .await
        {
            SessionEnd::Shutdown => break,
            SessionEnd::Closed { processed } => {
                warn!(processed, "change feed closed");
                processed
            }
            SessionEnd::Failed { processed, error } => {
                warn!(processed, error = %error, "change feed session failed");
                processed
            }
        };
        backoff = backoff_after(backoff, processed, &config);

        counters.reconnects.fetch_add(1, Ordering::Relaxed);
        let delay = with_jitter(backoff);
        info!(delay_ms = delay.as_millis() as u64, "reconnecting to change feed");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(config.feed_backoff_max);
    }
    info!("change bridge stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Gateway;
    use crate::presence::PresenceRegistry;
    use serde_json::Value as JsonValue;

    fn setup() -> (Arc<Gateway>, Arc<Fanout>, CacheStore, BridgeCounters) {
        let presence = Arc::new(PresenceRegistry::new());
        let gateway = Arc::new(Gateway::new(presence, 16));
        let fanout = Arc::new(Fanout::new(Arc::clone(&gateway)));
        (gateway, fanout, CacheStore::new(), BridgeCounters::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_invalidates_then_broadcasts() {
        let (gateway, fanout, cache, counters) = setup();
        let (_conn, mut rx, _close) = gateway.register();

        cache.set("answers:U1-L2-Q01", json!([1]), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(10)).await;

        apply_notification(
            &cache,
            &fanout,
            &counters,
            r#"{"eventType":"INSERT","table":"answers","old":null,"new":{"question_id":"U1-L2-Q01"}}"#,
        );

        // The next read must be a miss, not the stale value.
        assert_eq!(cache.get("answers:U1-L2-Q01"), None);

        let payload = rx.try_recv().expect("broadcast expected");
        let value: JsonValue = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "realtime_update");
        assert_eq!(value["table"], "answers");
        assert_eq!(value["event"], "INSERT");
    }

    #[tokio::test]
    async fn test_notification_invalidation_is_table_scoped() {
        let (_gateway, fanout, cache, counters) = setup();
        cache.set("answers:Q1", json!(1), Duration::from_secs(30));
        cache.set("votes:Q1", json!(2), Duration::from_secs(30));

        apply_notification(
            &cache,
            &fanout,
            &counters,
            r#"{"eventType":"DELETE","table":"votes","old":{"id":9},"new":null}"#,
        );

        assert!(cache.get("answers:Q1").is_some());
        assert!(cache.get("votes:Q1").is_none());
        assert_eq!(counters.snapshot().invalidated_keys, 1);
    }

    #[tokio::test]
    async fn test_malformed_notification_counted_not_broadcast() {
        let (gateway, fanout, cache, counters) = setup();
        let (_conn, mut rx, _close) = gateway.register();

        apply_notification(&cache, &fanout, &counters, "not json");

        assert_eq!(counters.snapshot().malformed, 1);
        assert_eq!(counters.snapshot().notifications, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notifications_broadcast_in_arrival_order() {
        let (gateway, fanout, cache, counters) = setup();
        let (_conn, mut rx, _close) = gateway.register();

        for i in 0..4 {
            let payload = format!(
                r#"{{"eventType":"INSERT","table":"answers","new":{{"seq":{}}}}}"#,
                i
            );
            apply_notification(&cache, &fanout, &counters, &payload);
        }

        for i in 0..4 {
            let payload = rx.try_recv().expect("delivery expected");
            let value: JsonValue = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["data"]["seq"], i);
        }
    }

    #[test]
    fn test_productive_session_resets_backoff_regardless_of_ending() {
        let config = RelayConfig::default();
        let inflated = Duration::from_secs(16);
        // A session that relayed notifications restarts the ladder even
        // when it ends in a stream error.
        assert_eq!(
            backoff_after(inflated, 3, &config),
            config.feed_backoff_initial
        );
        assert_eq!(backoff_after(inflated, 0, &config), inflated);
    }

    #[test]
    fn test_jitter_bounded_by_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delayed = with_jitter(base);
            assert!(delayed >= base);
            assert!(delayed <= base + Duration::from_millis(250));
        }
    }
}

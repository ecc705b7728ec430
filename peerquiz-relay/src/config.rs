//! Relay Configuration
//!
//! Configuration is loaded from environment variables with sensible
//! defaults for development, following the `PEERQUIZ_` prefix.

use std::time::Duration;

/// Relay service configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ========================================================================
    // Listener
    // ========================================================================
    /// Bind host (default "0.0.0.0").
    pub bind_host: String,

    /// Bind port (default 4000).
    pub bind_port: u16,

    // ========================================================================
    // Presence
    // ========================================================================
    /// How long an identity with no live connections stays "online"
    /// before the reconciler announces it offline (default: 45s).
    pub presence_expiry_window: Duration,

    // ========================================================================
    // Cache
    // ========================================================================
    /// TTL applied by the cache-fronted read path (default: 30s).
    pub cache_default_ttl: Duration,

    /// How often the reconciler sweeps expired cache entries
    /// (default: 60s).
    pub cache_sweep_interval: Duration,

    // ========================================================================
    // Gateway
    // ========================================================================
    /// Per-connection outbound queue depth. A connection whose queue
    /// is full when a broadcast arrives is dropped (default: 64).
    pub outbound_queue_depth: usize,

    // ========================================================================
    // Backend
    // ========================================================================
    /// Base URL for read fallthrough on cache miss.
    pub backend_base_url: String,

    /// WebSocket URL of the backend change feed.
    pub change_feed_url: String,

    /// Timeout for a single backend fetch; on expiry the caller gets
    /// an error, never a hang (default: 3s).
    pub backend_fetch_timeout: Duration,

    /// Initial reconnect delay for the change feed (default: 500ms).
    pub feed_backoff_initial: Duration,

    /// Reconnect delay ceiling for the change feed (default: 30s).
    pub feed_backoff_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 4000,
            presence_expiry_window: Duration::from_secs(45),
            cache_default_ttl: Duration::from_secs(30),
            cache_sweep_interval: Duration::from_secs(60),
            outbound_queue_depth: 64,
            backend_base_url: "http://localhost:8000".to_string(),
            change_feed_url: "ws://localhost:8000/realtime".to_string(),
            backend_fetch_timeout: Duration::from_secs(3),
            feed_backoff_initial: Duration::from_millis(500),
            feed_backoff_max: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Create a RelayConfig from environment variables.
    ///
    /// Environment variables:
    /// - `PEERQUIZ_BIND`: Bind host (default: "0.0.0.0")
    /// - `PORT` / `PEERQUIZ_PORT`: Listener port (default: 4000)
    /// - `PEERQUIZ_PRESENCE_EXPIRY_SECS`: Presence grace window (default: 45)
    /// - `PEERQUIZ_CACHE_TTL_SECS`: Read-path cache TTL (default: 30)
    /// - `PEERQUIZ_CACHE_SWEEP_SECS`: Cache sweep interval (default: 60)
    /// - `PEERQUIZ_OUTBOUND_QUEUE_DEPTH`: Per-connection queue (default: 64)
    /// - `PEERQUIZ_BACKEND_URL`: Backend base URL
    /// - `PEERQUIZ_CHANGE_FEED_URL`: Change-feed WebSocket URL
    /// - `PEERQUIZ_BACKEND_TIMEOUT_SECS`: Backend fetch timeout (default: 3)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_host =
            std::env::var("PEERQUIZ_BIND").unwrap_or(defaults.bind_host);

        let bind_port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("PEERQUIZ_PORT").ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bind_port);

        let presence_expiry_window = env_secs(
            "PEERQUIZ_PRESENCE_EXPIRY_SECS",
            defaults.presence_expiry_window,
        );

        let cache_default_ttl =
            env_secs("PEERQUIZ_CACHE_TTL_SECS", defaults.cache_default_ttl);

        let cache_sweep_interval =
            env_secs("PEERQUIZ_CACHE_SWEEP_SECS", defaults.cache_sweep_interval);

        let outbound_queue_depth = std::env::var("PEERQUIZ_OUTBOUND_QUEUE_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.outbound_queue_depth);

        let backend_base_url =
            std::env::var("PEERQUIZ_BACKEND_URL").unwrap_or(defaults.backend_base_url);

        let change_feed_url =
            std::env::var("PEERQUIZ_CHANGE_FEED_URL").unwrap_or(defaults.change_feed_url);

        let backend_fetch_timeout = env_secs(
            "PEERQUIZ_BACKEND_TIMEOUT_SECS",
            defaults.backend_fetch_timeout,
        );

        Self {
            bind_host,
            bind_port,
            presence_expiry_window,
            cache_default_ttl,
            cache_sweep_interval,
            outbound_queue_depth,
            backend_base_url,
            change_feed_url,
            backend_fetch_timeout,
            feed_backoff_initial: defaults.feed_backoff_initial,
            feed_backoff_max: defaults.feed_backoff_max,
        }
    }

    /// Create a configuration for development/testing with short windows.
    pub fn development() -> Self {
        Self {
            presence_expiry_window: Duration::from_secs(5),
            cache_default_ttl: Duration::from_secs(2),
            cache_sweep_interval: Duration::from_secs(2),
            feed_backoff_initial: Duration::from_millis(50),
            feed_backoff_max: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Reconciler cadence: no finer than the smaller of a third of the
    /// presence expiry window and the cache sweep interval. This is the
    /// only unbounded-iteration path, so the floor keeps it from
    /// dominating CPU on large stores.
    pub fn reconciler_interval(&self) -> Duration {
        let floor = Duration::from_secs(1);
        let third = self.presence_expiry_window / 3;
        let interval = third.min(self.cache_sweep_interval);
        interval.max(floor)
    }
}

fn env_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_port, 4000);
        assert_eq!(config.presence_expiry_window, Duration::from_secs(45));
        assert_eq!(config.cache_default_ttl, Duration::from_secs(30));
        assert_eq!(config.outbound_queue_depth, 64);
    }

    #[test]
    fn test_reconciler_interval_takes_window_third() {
        let config = RelayConfig::default();
        // 45s / 3 = 15s, smaller than the 60s sweep interval.
        assert_eq!(config.reconciler_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_reconciler_interval_takes_sweep_when_smaller() {
        let config = RelayConfig {
            presence_expiry_window: Duration::from_secs(300),
            cache_sweep_interval: Duration::from_secs(10),
            ..RelayConfig::default()
        };
        assert_eq!(config.reconciler_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_reconciler_interval_floored() {
        let config = RelayConfig {
            presence_expiry_window: Duration::from_secs(1),
            cache_sweep_interval: Duration::from_millis(200),
            ..RelayConfig::default()
        };
        assert_eq!(config.reconciler_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_development_preset() {
        let config = RelayConfig::development();
        assert_eq!(config.presence_expiry_window, Duration::from_secs(5));
        assert_eq!(config.cache_default_ttl, Duration::from_secs(2));
    }
}

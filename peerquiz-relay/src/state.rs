//! Shared application state for Axum routers.

use std::sync::Arc;

use crate::backend::QueryFetcher;
use crate::bridge::BridgeCounters;
use crate::cache::CacheStore;
use crate::config::RelayConfig;
use crate::fanout::Fanout;
use crate::gateway::Gateway;
use crate::presence::PresenceRegistry;
use crate::reconciler::ReconcilerCounters;

/// Application-wide state shared across all routes and tasks.
///
/// The stores (presence, cache) and the connection registry are the
/// only shared mutable resources in the process; every field here is a
/// narrow, internally-synchronized contract.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub gateway: Arc<Gateway>,
    pub fanout: Arc<Fanout>,
    pub presence: Arc<PresenceRegistry>,
    pub cache: Arc<CacheStore>,
    pub backend: Arc<dyn QueryFetcher>,
    pub bridge_counters: Arc<BridgeCounters>,
    pub reconciler_counters: Arc<ReconcilerCounters>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up the stores and fanout for a given configuration.
    pub fn new(config: RelayConfig, backend: Arc<dyn QueryFetcher>) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&presence),
            config.outbound_queue_depth,
        ));
        let fanout = Arc::new(Fanout::new(Arc::clone(&gateway)));
        Self {
            config: Arc::new(config),
            gateway,
            fanout,
            presence,
            cache: Arc::new(CacheStore::new()),
            backend,
            bridge_counters: Arc::new(BridgeCounters::default()),
            reconciler_counters: Arc::new(ReconcilerCounters::default()),
            start_time: std::time::Instant::now(),
        }
    }
}

// Sub-state extractors for the cache-fronted read handlers.
crate::impl_from_ref!(Arc<RelayConfig>, config);
crate::impl_from_ref!(Arc<CacheStore>, cache);
crate::impl_from_ref!(Arc<dyn QueryFetcher>, backend);

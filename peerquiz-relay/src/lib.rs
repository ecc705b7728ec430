//! PEERQUIZ Relay - Real-Time Sync and Caching Layer
//!
//! This crate sits between many browser clients and the backend store
//! for the peerquiz classroom app. It absorbs read load with an
//! in-process TTL cache, tracks who is online, subscribes to the
//! backend's row-change feed, and pushes updates to every connected
//! client so nobody polls.
//!
//! Component map:
//! - [`gateway`]: WebSocket connection registry and inbound routing
//! - [`presence`]: identity -> last-seen/connection-set store
//! - [`cache`]: TTL'd key/value store with coarse topic invalidation
//! - [`bridge`]: supervised backend change-feed subscriber
//! - [`fanout`]: serialize-once broadcast to live connections
//! - [`reconciler`]: periodic presence expiry and cache sweep
//! - [`routes`]: cache-fronted REST reads and health

pub mod macros;

pub mod backend;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod presence;
pub mod reconciler;
pub mod routes;
pub mod state;

// Re-export commonly used types
pub use backend::{BackendClient, QueryFetcher};
pub use cache::CacheStore;
pub use config::RelayConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use fanout::Fanout;
pub use gateway::{ConnId, Gateway};
pub use presence::PresenceRegistry;
pub use state::AppState;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the relay's router: the WebSocket gateway, the cache-fronted
/// read routes, and health.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/healthz", get(routes::healthz))
        .route(
            "/api/questions/:question_id/answers",
            get(routes::get_answers),
        )
        .route("/api/questions/:question_id/votes", get(routes::get_votes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

//! Cache-Fronted Read Routes
//!
//! Thin REST layer in front of the backend store: reads consult the
//! cache first and repopulate it on miss with the configured TTL. The
//! relay's WebSocket clients mostly avoid these entirely; they exist
//! for initial page loads and late joiners.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backend::QueryFetcher;
use crate::cache::{CacheCountersSnapshot, CacheStore};
use crate::config::RelayConfig;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Question-scoped read against one table, cache first.
pub(crate) async fn cached_read(
    cache: &CacheStore,
    backend: &dyn QueryFetcher,
    ttl: std::time::Duration,
    table: &str,
    question_id: &str,
) -> ApiResult<JsonValue> {
    validate_question_id(question_id)?;
    let key = CacheStore::key(table, question_id);

    if let Some(value) = cache.get(&key) {
        debug!(%key, "cache hit");
        return Ok(value);
    }

    let value = backend.fetch(table, question_id).await?;
    cache.set(key, value.clone(), ttl);
    Ok(value)
}

fn validate_question_id(question_id: &str) -> ApiResult<()> {
    if question_id.is_empty() || question_id.len() > 64 {
        return Err(ApiError::invalid_input("question id must be 1-64 characters"));
    }
    if !question_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::invalid_input(
            "question id may contain only alphanumerics, '-' and '_'",
        ));
    }
    Ok(())
}

/// GET /api/questions/:question_id/answers
pub async fn get_answers(
    State(config): State<Arc<RelayConfig>>,
    State(cache): State<Arc<CacheStore>>,
    State(backend): State<Arc<dyn QueryFetcher>>,
    Path(question_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let value = cached_read(
        &cache,
        backend.as_ref(),
        config.cache_default_ttl,
        "answers",
        &question_id,
    )
    .await?;
    Ok(Json(value))
}

/// GET /api/questions/:question_id/votes
pub async fn get_votes(
    State(config): State<Arc<RelayConfig>>,
    State(cache): State<Arc<CacheStore>>,
    State(backend): State<Arc<dyn QueryFetcher>>,
    Path(question_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let value = cached_read(
        &cache,
        backend.as_ref(),
        config.cache_default_ttl,
        "votes",
        &question_id,
    )
    .await?;
    Ok(Json(value))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub presence: usize,
    pub cache_entries: usize,
    pub cache: CacheCountersSnapshot,
    pub gateway: crate::gateway::GatewayCountersSnapshot,
    pub fanout: crate::fanout::FanoutCountersSnapshot,
    pub bridge: crate::bridge::BridgeCountersSnapshot,
    pub reconciler: crate::reconciler::ReconcilerCountersSnapshot,
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.gateway.connection_count(),
        presence: state.presence.len(),
        cache_entries: state.cache.len(),
        cache: state.cache.counters().snapshot(),
        gateway: state.gateway.counters().snapshot(),
        fanout: state.fanout.counters().snapshot(),
        bridge: state.bridge_counters.snapshot(),
        reconciler: state.reconciler_counters.snapshot(),
    })
}

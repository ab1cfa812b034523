//! API Handlers
//!
//! HTTP request handlers for each record endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::loader::BatchFetch;
use crate::models::{ClearResponse, HealthResponse, LoadQuery, RecordResponse, StatsResponse};
use crate::record::{RecordKey, RemoteRecord};
use crate::record_cache::RecordCache;

/// Cache of raw remote records as served over HTTP.
pub type RemoteRecordCache = RecordCache<RecordKey, RemoteRecord>;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<RemoteRecordCache>,
}

impl AppState {
    pub fn new(cache: RemoteRecordCache) -> Self {
        Self {
            cache: Arc::new(cache),
        }
    }

    /// Builds the cache described by `config` over `upstream`.
    pub fn from_config(
        config: &Config,
        upstream: Arc<dyn BatchFetch<RecordKey, RemoteRecord>>,
    ) -> Result<Self> {
        let cache = RecordCache::from_config(config, upstream, Default::default())?;
        Ok(Self::new(cache))
    }
}

/// Handler for GET /records/:key
///
/// Loads a raw record, accepting cached copies no older than `max_age_ms`.
pub async fn get_record_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<LoadQuery>,
) -> Result<Json<RecordResponse>> {
    let key: RecordKey = key.parse()?;
    let record = state.cache.load(&key, query.max_age()).await?;
    debug!(%key, found = record.is_some(), "served record");

    Ok(Json(RecordResponse::new(key, record)))
}

/// Handler for DELETE /records/:key
pub async fn clear_record_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ClearResponse>> {
    let key: RecordKey = key.parse()?;
    state.cache.clear(&key).await?;

    Ok(Json(ClearResponse::key(key)))
}

/// Handler for DELETE /records
pub async fn clear_all_handler(State(state): State<AppState>) -> Result<Json<ClearResponse>> {
    state.cache.clear_all().await?;

    Ok(Json(ClearResponse::all(state.cache.partition())))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.cache.partition(),
        state.cache.stats(),
    ))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

//! Response DTOs for the record HTTP surface

use serde::Serialize;

use crate::cache::CacheStats;
use crate::record::{RecordKey, RemoteRecord};

/// Response body for `GET /records/:key`
///
/// `record` is `null` when the record is confirmed absent upstream.
#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub key: RecordKey,
    pub found: bool,
    pub record: Option<RemoteRecord>,
}

impl RecordResponse {
    pub fn new(key: RecordKey, record: Option<RemoteRecord>) -> Self {
        Self {
            key,
            found: record.is_some(),
            record,
        }
    }
}

/// Response body for both clear endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ClearResponse {
    /// Success message
    pub message: String,
    /// The cleared key, absent for a full clear
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<RecordKey>,
}

impl ClearResponse {
    pub fn key(key: RecordKey) -> Self {
        Self {
            message: format!("Key '{}' cleared", key),
            key: Some(key),
        }
    }

    pub fn all(partition: &str) -> Self {
        Self {
            message: format!("Partition '{}' cleared", partition),
            key: None,
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub partition: String,
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Share of requests answered by either tier
    pub hit_rate: f64,
}

impl StatsResponse {
    pub fn new(partition: impl Into<String>, stats: CacheStats) -> Self {
        Self {
            partition: partition.into(),
            hit_rate: stats.hit_rate(),
            stats,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

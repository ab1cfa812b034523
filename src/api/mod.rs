//! API Module
//!
//! HTTP inspection surface over a shared [`RecordCache`](crate::RecordCache).
//!
//! # Endpoints
//! - `GET /records/:key?max_age_ms=N` - Load a raw record
//! - `DELETE /records/:key` - Clear one key from both tiers
//! - `DELETE /records` - Clear the whole partition
//! - `GET /stats` - Get cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;

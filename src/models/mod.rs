//! Request and Response models for the record HTTP surface
//!
//! DTOs used for query strings and JSON response bodies.

pub mod requests;
pub mod responses;

pub use requests::LoadQuery;
pub use responses::{ClearResponse, HealthResponse, RecordResponse, StatsResponse};

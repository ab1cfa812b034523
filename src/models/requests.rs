//! Request DTOs for the record HTTP surface

use serde::Deserialize;

use crate::cache::MaxAge;

/// Query string of `GET /records/:key`
///
/// `max_age_ms` absent means any cached age is acceptable; `0` forces a fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadQuery {
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

impl LoadQuery {
    pub fn max_age(&self) -> MaxAge {
        self.max_age_ms.map_or(MaxAge::Unbounded, MaxAge::from_millis)
    }
}

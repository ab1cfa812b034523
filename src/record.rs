//! Reference record model
//!
//! A 32-byte record identifier with a canonical hex form, and the raw remote
//! record shape cached by default. Binary payloads are hex-encoded when
//! serialized so they round-trip byte-for-byte through any text store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CacheError;

/// Length of a record identifier in bytes.
pub const RECORD_KEY_LEN: usize = 32;

// == Record Key ==
/// Identifier of a remote record. Equality follows the canonical string form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey([u8; RECORD_KEY_LEN]);

impl RecordKey {
    pub const fn new(bytes: [u8; RECORD_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", self)
    }
}

impl FromStr for RecordKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; RECORD_KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| {
            CacheError::InvalidRequest(format!("invalid record key '{}': {}", s, e))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for RecordKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// == Remote Record ==
/// Raw record as returned by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Identifier of the program/entity owning the record
    pub owner: RecordKey,
    /// Balance held by the record
    pub balance: u64,
    /// True if the payload is executable code
    pub executable: bool,
    /// Raw payload bytes
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Epoch at which the record next owes rent, if tracked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

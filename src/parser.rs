//! Tagged record parsers
//!
//! A cache is built with one [`ParserTable`]: a static set of pure functions
//! selected by an explicit tag. Parsing happens after the raw record has been
//! cached, so a failing parser never affects the cached record or other
//! callers.

use std::any::Any;
use std::convert::Infallible;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::error::{CacheError, Result};

/// Error returned by a parser for a malformed record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<ParseError> for CacheError {
    fn from(err: ParseError) -> Self {
        CacheError::Parse(err.0)
    }
}

// == Parser Table ==
/// Static table of record parsers keyed by `Tag`.
///
/// Implementations are usually an enum of tags matched in `parse`, with one
/// view type (or an enum of views) as `Output`.
pub trait ParserTable<K, V>: Send + Sync {
    type Tag: Copy + Debug + Send + Sync + 'static;
    type Output: Send;

    fn parse(&self, tag: Self::Tag, key: &K, record: &V) -> std::result::Result<Self::Output, ParseError>;
}

/// Table with no parsers; only raw loads are possible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParsers;

impl<K, V> ParserTable<K, V> for NoParsers {
    type Tag = Infallible;
    type Output = Infallible;

    fn parse(&self, tag: Infallible, _key: &K, _record: &V) -> std::result::Result<Infallible, ParseError> {
        match tag {}
    }
}

// == Catch As Value ==
/// Runs a parser, turning both its error and any panic into
/// `CacheError::Parse`.
pub fn catch_as_value<T>(parse: impl FnOnce() -> std::result::Result<T, ParseError>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(parse)) {
        Ok(result) => result.map_err(CacheError::from),
        Err(payload) => Err(CacheError::Parse(format!(
            "parser panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Tag {
        Length,
        FirstByte,
    }

    struct BytesTable;

    impl ParserTable<String, Vec<u8>> for BytesTable {
        type Tag = Tag;
        type Output = usize;

        fn parse(&self, tag: Tag, _key: &String, record: &Vec<u8>) -> std::result::Result<usize, ParseError> {
            match tag {
                Tag::Length => Ok(record.len()),
                Tag::FirstByte => record
                    .first()
                    .map(|b| *b as usize)
                    .ok_or_else(|| ParseError::new("empty payload")),
            }
        }
    }

    #[test]
    fn test_table_dispatch_by_tag() {
        let table = BytesTable;
        let key = "k".to_string();
        let record = vec![9, 8, 7];

        assert_eq!(table.parse(Tag::Length, &key, &record).unwrap(), 3);
        assert_eq!(table.parse(Tag::FirstByte, &key, &record).unwrap(), 9);
    }

    #[test]
    fn test_catch_as_value_maps_error() {
        let result = catch_as_value(|| BytesTable.parse(Tag::FirstByte, &"k".to_string(), &vec![]));
        assert_eq!(result, Err(CacheError::Parse("empty payload".to_string())));
    }

    #[test]
    fn test_catch_as_value_catches_panic() {
        let result: Result<u8> = catch_as_value(|| {
            let bytes: Vec<u8> = Vec::new();
            Ok(bytes[3])
        });
        assert!(matches!(result, Err(CacheError::Parse(msg)) if msg.contains("panicked")));
    }

    #[test]
    fn test_catch_as_value_passes_success() {
        assert_eq!(catch_as_value(|| Ok::<_, ParseError>(5)), Ok(5));
    }
}

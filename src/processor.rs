//! Deterministic state machines fed by the journal.
//!
//! A [`Processor`] consumes committed entries in order and exposes its
//! contents for inspection. The reference implementation is a key-value
//! map that applies `{"key": ..., "value": ...}` records.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("invalid request")]
    InvalidRequest,
}

/// A deterministic applicator for committed journal entries.
///
/// Applying the same sequence of entries to two fresh processors must
/// produce identical `dump` output.
pub trait Processor: Send + Sync {
    /// Apply one committed entry. Returns the operation result.
    fn process(&mut self, data: &Value) -> Result<Value, ProcessorError>;

    /// Look up a single key.
    fn get(&self, key: &str) -> Option<Value>;

    /// Snapshot the full state, ordered by key.
    fn dump(&self) -> BTreeMap<String, Value>;
}

/// Key-value map processor. Commands are JSON objects carrying `key`
/// (a string) and `value` (any JSON value).
#[derive(Debug, Default)]
pub struct KvStore {
    entries: BTreeMap<String, Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Processor for KvStore {
    fn process(&mut self, data: &Value) -> Result<Value, ProcessorError> {
        let record = data.as_object().ok_or(ProcessorError::InvalidRequest)?;
        let key = record
            .get("key")
            .and_then(Value::as_str)
            .ok_or(ProcessorError::InvalidRequest)?;
        let value = record
            .get("value")
            .cloned()
            .ok_or(ProcessorError::InvalidRequest)?;

        self.entries.insert(key.to_owned(), value);
        Ok(Value::Null)
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn dump(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }
}

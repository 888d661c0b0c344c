use crate::value_objects::record::CanonicalRecord;
use crate::value_objects::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Watermark(String),
    Write(String),
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Watermark(msg) => write!(f, "watermark query: {msg}"),
            Self::Write(msg) => write!(f, "store write: {msg}"),
            Self::Query(msg) => write!(f, "store query: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionStats {
    pub rows: u64,
    pub min_ts: DateTime<Utc>,
    pub max_ts: DateTime<Utc>,
}

/// Read side shared by every store the verifier audits (file encodings and
/// the database alike).
pub trait PartitionInspector: Send + Sync {
    fn partition_stats(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<PartitionStats>, StoreError>;
}

/// The time-partitioned database store. Append-oriented: rows are never
/// deleted or updated, so callers must only hand over keys that are not
/// already present.
pub trait BarStore: PartitionInspector {
    /// Max timestamp durably stored for (symbol, timeframe), if any.
    fn watermark(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Timestamps already present within [start, end], for full-mode dedupe.
    fn existing_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StoreError>;

    fn insert(&self, records: &[CanonicalRecord]) -> Result<u64, StoreError>;
}

pub mod csv;
pub mod layout;
pub mod parquet;

use std::collections::BTreeMap;
use tidemark_domain::repositories::bar_store::PartitionStats;
use tidemark_domain::value_objects::record::CanonicalRecord;
use tidemark_domain::value_objects::timeframe::Timeframe;

/// Merges an existing partition with newly fetched records. Incoming rows win
/// on key collisions, output is sorted by timestamp.
pub fn merge_by_key(
    existing: Vec<CanonicalRecord>,
    incoming: &[CanonicalRecord],
) -> Vec<CanonicalRecord> {
    let mut by_ts: BTreeMap<i64, CanonicalRecord> = existing
        .into_iter()
        .map(|r| (r.timestamp.timestamp_millis(), r))
        .collect();
    for record in incoming {
        by_ts.insert(record.timestamp.timestamp_millis(), record.clone());
    }
    by_ts.into_values().collect()
}

/// Splits a batch into per-partition groups, preserving record order. Crawl
/// batches are single-partition already; file-sourced batches may not be.
pub fn group_by_partition(
    records: &[CanonicalRecord],
) -> Vec<((String, Timeframe), Vec<CanonicalRecord>)> {
    let mut groups: Vec<((String, Timeframe), Vec<CanonicalRecord>)> = Vec::new();
    for record in records {
        let key = (record.symbol.clone(), record.timeframe);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(record.clone()),
            None => groups.push((key, vec![record.clone()])),
        }
    }
    groups
}

pub fn stats_from_records(records: &[CanonicalRecord]) -> Option<PartitionStats> {
    let min_ts = records.iter().map(|r| r.timestamp).min()?;
    let max_ts = records.iter().map(|r| r.timestamp).max()?;
    Some(PartitionStats {
        rows: records.len() as u64,
        min_ts,
        max_ts,
    })
}

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_domain::repositories::bar_store::{BarStore, StoreError};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::value_objects::record::CanonicalRecord;
use tidemark_domain::value_objects::timeframe::Timeframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Full,
    Incremental,
}

/// Highest timestamp known durable per (symbol, timeframe). Shared across
/// workers; falls back to the store's own MAX(timestamp) on a cold miss.
#[derive(Default)]
pub struct WatermarkCache {
    inner: Mutex<HashMap<(String, Timeframe), DateTime<Utc>>>,
}

impl WatermarkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(symbol.to_string(), timeframe))
            .copied()
    }

    pub fn advance(&self, symbol: &str, timeframe: Timeframe, to: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = inner
            .entry((symbol.to_string(), timeframe))
            .or_insert(to);
        if to > *entry {
            *entry = to;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadReport {
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub write_retries: u32,
    pub fallback_to_full: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            write_retries: 3,
            fallback_to_full: false,
        }
    }
}

/// Upserts canonical records into the append-oriented store without ever
/// deleting rows: full mode dedupes against the keys already present,
/// incremental mode inserts only past the watermark.
pub struct DedupLoader {
    store: Arc<dyn BarStore>,
    watermarks: WatermarkCache,
    config: LoaderConfig,
}

impl DedupLoader {
    pub fn new(store: Arc<dyn BarStore>, config: LoaderConfig) -> Self {
        Self {
            store,
            watermarks: WatermarkCache::new(),
            config,
        }
    }

    /// Loads one batch. All records must belong to a single (symbol,
    /// timeframe) partition; the orchestrator guarantees that for crawl
    /// output, and file-sourced batches are grouped by the caller.
    pub fn load(&self, mode: LoadMode, records: &[CanonicalRecord]) -> Result<LoadReport, StoreError> {
        let Some(first) = records.first() else {
            return Ok(LoadReport {
                inserted: 0,
                skipped: 0,
            });
        };
        let symbol = first.symbol.clone();
        let timeframe = first.timeframe;
        if records
            .iter()
            .any(|r| r.symbol != symbol || r.timeframe != timeframe)
        {
            return Err(StoreError::Write(format!(
                "batch spans more than one partition (expected {symbol}/{})",
                timeframe.label()
            )));
        }

        match mode {
            LoadMode::Full => self.load_full(&symbol, timeframe, records),
            LoadMode::Incremental => self.load_incremental(&symbol, timeframe, records),
        }
    }

    fn load_full(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        records: &[CanonicalRecord],
    ) -> Result<LoadReport, StoreError> {
        let start = records.iter().map(|r| r.timestamp).min().unwrap_or_else(Utc::now);
        let end = records.iter().map(|r| r.timestamp).max().unwrap_or_else(Utc::now);
        let existing = self
            .store
            .existing_timestamps(symbol, timeframe, start, end)?;

        let fresh: Vec<CanonicalRecord> = records
            .iter()
            .filter(|r| !existing.contains(&r.timestamp))
            .cloned()
            .collect();
        let skipped = records.len() as u64 - fresh.len() as u64;
        let inserted = self.insert_with_retry(&fresh)?;
        self.watermarks.advance(symbol, timeframe, end);

        tracing::info!(
            symbol,
            timeframe = %timeframe,
            inserted,
            skipped,
            "full load complete"
        );
        metrics::counter!("tidemark.loader.rows_inserted_total").increment(inserted);
        Ok(LoadReport { inserted, skipped })
    }

    fn load_incremental(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        records: &[CanonicalRecord],
    ) -> Result<LoadReport, StoreError> {
        let watermark = match self.watermarks.get(symbol, timeframe) {
            Some(cached) => Some(cached),
            None => match self.store.watermark(symbol, timeframe) {
                Ok(stored) => stored,
                Err(err @ StoreError::Watermark(_)) if self.config.fallback_to_full => {
                    tracing::warn!(
                        symbol,
                        timeframe = %timeframe,
                        error = %err,
                        "watermark query failed, falling back to full load"
                    );
                    return self.load_full(symbol, timeframe, records);
                }
                Err(err) => return Err(err),
            },
        };

        let fresh: Vec<CanonicalRecord> = records
            .iter()
            .filter(|r| match watermark {
                Some(wm) => r.timestamp > wm,
                None => true,
            })
            .cloned()
            .collect();
        let skipped = records.len() as u64 - fresh.len() as u64;
        let inserted = self.insert_with_retry(&fresh)?;
        if let Some(max_ts) = records.iter().map(|r| r.timestamp).max() {
            self.watermarks.advance(symbol, timeframe, max_ts);
        }

        tracing::info!(
            symbol,
            timeframe = %timeframe,
            inserted,
            skipped,
            watermark = ?watermark,
            "incremental load complete"
        );
        metrics::counter!("tidemark.loader.rows_inserted_total").increment(inserted);
        Ok(LoadReport { inserted, skipped })
    }

    fn insert_with_retry(&self, records: &[CanonicalRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut attempt = 0u32;
        loop {
            match self.store.insert(records) {
                Ok(inserted) => return Ok(inserted),
                Err(err @ StoreError::Write(_)) if attempt < self.config.write_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "store write failed, retrying");
                    std::thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Lets the orchestrator stream crawl output straight into the store,
/// bypassing the file round trip. Failures stay scoped to the calling job.
pub struct LoaderSink {
    loader: Arc<DedupLoader>,
    mode: LoadMode,
}

impl LoaderSink {
    pub fn new(loader: Arc<DedupLoader>, mode: LoadMode) -> Self {
        Self { loader, mode }
    }
}

impl RecordSink for LoaderSink {
    fn name(&self) -> &str {
        "database loader"
    }

    fn write(&self, records: &[CanonicalRecord]) -> Result<usize, String> {
        let report = self
            .loader
            .load(self.mode, records)
            .map_err(|err| err.to_string())?;
        Ok(report.inserted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use tidemark_domain::repositories::bar_store::{PartitionInspector, PartitionStats};
    use tidemark_domain::value_objects::asset_class::AssetClass;
    use tidemark_domain::value_objects::record::ClassFields;

    /// Append-only store that records every insert verbatim, so tests can
    /// detect duplicate keys the loader failed to filter.
    #[derive(Default)]
    struct InMemoryStore {
        rows: Mutex<Vec<CanonicalRecord>>,
        fail_watermark: bool,
        fail_writes: Mutex<u32>,
    }

    impl PartitionInspector for InMemoryStore {
        fn partition_stats(
            &self,
            symbol: &str,
            timeframe: Timeframe,
        ) -> Result<Option<PartitionStats>, StoreError> {
            let rows = self.rows.lock().expect("lock");
            let matching: Vec<_> = rows
                .iter()
                .filter(|r| r.symbol == symbol && r.timeframe == timeframe)
                .collect();
            if matching.is_empty() {
                return Ok(None);
            }
            Ok(Some(PartitionStats {
                rows: matching.len() as u64,
                min_ts: matching.iter().map(|r| r.timestamp).min().expect("min"),
                max_ts: matching.iter().map(|r| r.timestamp).max().expect("max"),
            }))
        }
    }

    impl BarStore for InMemoryStore {
        fn watermark(
            &self,
            symbol: &str,
            timeframe: Timeframe,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            if self.fail_watermark {
                return Err(StoreError::Watermark("simulated outage".to_string()));
            }
            let rows = self.rows.lock().expect("lock");
            Ok(rows
                .iter()
                .filter(|r| r.symbol == symbol && r.timeframe == timeframe)
                .map(|r| r.timestamp)
                .max())
        }

        fn existing_timestamps(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<BTreeSet<DateTime<Utc>>, StoreError> {
            let rows = self.rows.lock().expect("lock");
            Ok(rows
                .iter()
                .filter(|r| {
                    r.symbol == symbol
                        && r.timeframe == timeframe
                        && r.timestamp >= start
                        && r.timestamp <= end
                })
                .map(|r| r.timestamp)
                .collect())
        }

        fn insert(&self, records: &[CanonicalRecord]) -> Result<u64, StoreError> {
            {
                let mut failures = self.fail_writes.lock().expect("lock");
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::Write("simulated write failure".to_string()));
                }
            }
            let mut rows = self.rows.lock().expect("lock");
            rows.extend_from_slice(records);
            Ok(records.len() as u64)
        }
    }

    fn bar(ts_secs: i64) -> CanonicalRecord {
        CanonicalRecord {
            symbol: "SPY".to_string(),
            asset_class: AssetClass::Etf,
            index_membership: "SP500".to_string(),
            timestamp: Utc.timestamp_opt(ts_secs, 0).single().expect("ts"),
            timeframe: Timeframe::Day,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            class_fields: ClassFields::Equity { adj_close: None },
            vwap: Some(1.0),
            simple_return: None,
            log_return: None,
            source: "FMP".to_string(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn full_load_twice_is_idempotent() {
        let store = Arc::new(InMemoryStore::default());
        let loader = DedupLoader::new(store.clone(), LoaderConfig::default());
        let batch = vec![bar(0), bar(86400), bar(172800)];

        let first = loader.load(LoadMode::Full, &batch).expect("first load");
        assert_eq!(first.inserted, 3);
        let second = loader.load(LoadMode::Full, &batch).expect("second load");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 3);

        let stats = store
            .partition_stats("SPY", Timeframe::Day)
            .expect("stats")
            .expect("present");
        assert_eq!(stats.rows, 3);
    }

    #[test]
    fn incremental_load_inserts_only_past_the_watermark() {
        let store = Arc::new(InMemoryStore::default());
        let loader = DedupLoader::new(store.clone(), LoaderConfig::default());
        loader
            .load(LoadMode::Full, &[bar(0), bar(86400)])
            .expect("seed");

        // Batch straddles the watermark (86400): only the two newer rows land.
        let report = loader
            .load(
                LoadMode::Incremental,
                &[bar(86400), bar(172800), bar(259200)],
            )
            .expect("incremental");
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);

        let stats = store
            .partition_stats("SPY", Timeframe::Day)
            .expect("stats")
            .expect("present");
        assert_eq!(stats.rows, 4);
        assert_eq!(
            loader.watermarks.get("SPY", Timeframe::Day).expect("wm"),
            Utc.timestamp_opt(259200, 0).single().expect("ts")
        );
    }

    #[test]
    fn cold_incremental_reads_the_watermark_from_the_store() {
        let store = Arc::new(InMemoryStore::default());
        store.insert(&[bar(0), bar(86400)]).expect("seed");
        let loader = DedupLoader::new(store.clone(), LoaderConfig::default());

        let report = loader
            .load(LoadMode::Incremental, &[bar(86400), bar(172800)])
            .expect("incremental");
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn watermark_outage_falls_back_to_full_when_configured() {
        let store = Arc::new(InMemoryStore {
            fail_watermark: true,
            ..InMemoryStore::default()
        });
        let strict = DedupLoader::new(store.clone(), LoaderConfig::default());
        let err = strict
            .load(LoadMode::Incremental, &[bar(0)])
            .expect_err("strict loader should surface the outage");
        assert!(matches!(err, StoreError::Watermark(_)));

        let lenient = DedupLoader::new(
            store,
            LoaderConfig {
                fallback_to_full: true,
                ..LoaderConfig::default()
            },
        );
        let report = lenient
            .load(LoadMode::Incremental, &[bar(0)])
            .expect("fallback");
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn write_failures_are_retried_within_budget() {
        let store = Arc::new(InMemoryStore {
            fail_writes: Mutex::new(2),
            ..InMemoryStore::default()
        });
        let loader = DedupLoader::new(store.clone(), LoaderConfig::default());
        let report = loader.load(LoadMode::Full, &[bar(0)]).expect("retried");
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn mixed_partition_batches_are_rejected() {
        let store = Arc::new(InMemoryStore::default());
        let loader = DedupLoader::new(store, LoaderConfig::default());
        let mut other = bar(0);
        other.symbol = "QQQ".to_string();
        let err = loader
            .load(LoadMode::Full, &[bar(0), other])
            .expect_err("mixed batch");
        assert!(matches!(err, StoreError::Write(_)));
    }
}

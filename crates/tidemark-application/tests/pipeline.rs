use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidemark_application::loader::{DedupLoader, LoadMode, LoaderConfig, LoaderSink};
use tidemark_application::orchestrator::{CancelFlag, JobFilter, Orchestrator, OrchestratorConfig};
use tidemark_application::verifier::{verify, VerifySource};
use tidemark_domain::entities::job::RunStatus;
use tidemark_domain::repositories::bar_store::{
    BarStore, PartitionInspector, PartitionStats, StoreError,
};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::repositories::source::{CrawlControl, FetchError, FetchRequest, SourceAdapter};
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::record::{CanonicalRecord, ClassFields};
use tidemark_domain::value_objects::symbol::SymbolDescriptor;
use tidemark_domain::value_objects::timeframe::Timeframe;
use tidemark_infrastructure::sink::csv::CsvSink;
use tidemark_infrastructure::sink::parquet::ParquetSink;

fn unique_tmp_dir(name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("tidemark_{name}_{}_{}", std::process::id(), now))
}

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0)
        .single()
        .expect("ts")
}

fn spy_descriptor() -> SymbolDescriptor {
    SymbolDescriptor {
        symbol: "SPY".to_string(),
        name: "SPDR S&P 500".to_string(),
        asset_class: AssetClass::Etf,
        index_membership: "SP500".to_string(),
        sector: "N/A".to_string(),
        industry: "N/A".to_string(),
        timeframes: vec![Timeframe::Day],
        years: 1,
        priority: 1,
    }
}

/// Serves three daily SPY bars newest-first, the way FMP does, with no
/// provider VWAP or returns. The pipeline is expected to sort, fill VWAP
/// cumulatively and derive returns.
struct ThreeDayAdapter;

impl SourceAdapter for ThreeDayAdapter {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        _ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        let closes = [(7, 100.5), (6, 101.0), (5, 100.0)];
        Ok(closes
            .iter()
            .map(|&(day, close)| CanonicalRecord {
                symbol: request.descriptor.symbol.clone(),
                asset_class: request.descriptor.asset_class,
                index_membership: request.descriptor.index_membership.clone(),
                timestamp: ts(day),
                timeframe: request.timeframe,
                open: close - 0.5,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0,
                class_fields: ClassFields::Equity {
                    adj_close: Some(close),
                },
                vwap: None,
                simple_return: None,
                log_return: None,
                source: "scripted".to_string(),
                ingested_at: Utc::now(),
            })
            .collect())
    }
}

/// Append-only store that keeps every inserted row, so double-inserts are
/// visible to assertions.
#[derive(Default)]
struct InMemoryStore {
    rows: Mutex<Vec<CanonicalRecord>>,
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
        let mut rows = self.rows.lock().expect("lock");
        rows.extend_from_slice(records);
        Ok(records.len() as u64)
    }
}

fn build_orchestrator() -> Orchestrator {
    let mut orchestrator = Orchestrator::new(OrchestratorConfig {
        workers: 2,
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        ..OrchestratorConfig::default()
    });
    orchestrator.register_adapter(
        &[AssetClass::Equity, AssetClass::Etf],
        Arc::new(ThreeDayAdapter),
        Duration::ZERO,
    );
    orchestrator
}

#[test]
fn crawl_sink_load_verify_round_trip() {
    let base = unique_tmp_dir("pipeline");
    let csv_sink = Arc::new(CsvSink::new(&base));
    let parquet_sink = Arc::new(ParquetSink::new(&base).expect("parquet sink"));
    let store = Arc::new(InMemoryStore::default());
    let loader = Arc::new(DedupLoader::new(store.clone(), LoaderConfig::default()));

    let orchestrator = build_orchestrator();
    let jobs = tidemark_application::orchestrator::build_jobs(
        &[spy_descriptor()],
        &JobFilter::default(),
        ts(8),
    );
    let sinks: Vec<Arc<dyn RecordSink>> = vec![
        csv_sink.clone(),
        parquet_sink.clone(),
        Arc::new(LoaderSink::new(loader.clone(), LoadMode::Full)),
    ];
    let summary = orchestrator.run(jobs, &sinks, &CancelFlag::new());
    assert_eq!(summary.successes(), 1);
    assert_eq!(summary.status(1.0), RunStatus::Passed);

    // Window post-processing: sorted ascending, first return is None, the
    // rest derive from consecutive closes, VWAP filled from typical prices.
    let records = csv_sink
        .read_partition("SPY", Timeframe::Day)
        .expect("read csv");
    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(records[0].simple_return, None);
    let r1 = records[1].simple_return.expect("return");
    assert!((r1 - 0.01).abs() < 1e-9);
    let lr1 = records[1].log_return.expect("log return");
    assert!((lr1 - 1.01f64.ln()).abs() < 1e-9);
    let r2 = records[2].simple_return.expect("return");
    assert!((r2 - (100.5 - 101.0) / 101.0).abs() < 1e-9);
    assert!(records.iter().all(|r| r.vwap.is_some()));

    // Parquet mirrors the CSV tree.
    let parquet_records = parquet_sink
        .read_partition("SPY", Timeframe::Day)
        .expect("read parquet");
    assert_eq!(parquet_records.len(), 3);
    assert_eq!(parquet_records[0].adj_close(), Some(100.0));

    // All three surfaces agree.
    let report = verify(
        &[("SPY".to_string(), Timeframe::Day)],
        &[
            VerifySource::new("csv", csv_sink.clone()),
            VerifySource::new("parquet", parquet_sink.clone()),
            VerifySource::new("database", store.clone()),
        ],
        0,
    )
    .expect("verify");
    assert!(report.is_consistent(), "{:?}", report.divergences);

    // A second identical crawl is a no-op everywhere.
    let orchestrator = build_orchestrator();
    let jobs = tidemark_application::orchestrator::build_jobs(
        &[spy_descriptor()],
        &JobFilter::default(),
        ts(8),
    );
    let summary = orchestrator.run(jobs, &sinks, &CancelFlag::new());
    assert_eq!(summary.successes(), 1);

    let stats = store
        .partition_stats("SPY", Timeframe::Day)
        .expect("stats")
        .expect("present");
    assert_eq!(stats.rows, 3);
    assert_eq!(
        csv_sink
            .read_partition("SPY", Timeframe::Day)
            .expect("read csv")
            .len(),
        3
    );
}

/// Serves three two-bar pages per job and trips the shared flag after the
/// first page, like an operator abort arriving mid-fetch.
struct PagedCancellingAdapter {
    cancel: CancelFlag,
}

impl SourceAdapter for PagedCancellingAdapter {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        let mut records = Vec::new();
        for page in 0..3u32 {
            if ctrl.is_cancelled() {
                break;
            }
            for i in 0..2u32 {
                let day = page * 2 + i + 1;
                records.push(CanonicalRecord {
                    symbol: request.descriptor.symbol.clone(),
                    asset_class: request.descriptor.asset_class,
                    index_membership: request.descriptor.index_membership.clone(),
                    timestamp: ts(day),
                    timeframe: request.timeframe,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1_000.0,
                    class_fields: ClassFields::Equity { adj_close: None },
                    vwap: None,
                    simple_return: None,
                    log_return: None,
                    source: "scripted".to_string(),
                    ingested_at: Utc::now(),
                });
            }
            self.cancel.cancel();
        }
        Ok(records)
    }
}

#[test]
fn cancellation_stops_new_jobs_and_truncates_paged_fetches() {
    let base = unique_tmp_dir("pipeline_cancel");
    let csv_sink = Arc::new(CsvSink::new(&base));
    let cancel = CancelFlag::new();

    let mut orchestrator = Orchestrator::new(OrchestratorConfig {
        workers: 1,
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        ..OrchestratorConfig::default()
    });
    orchestrator.register_adapter(
        &[AssetClass::Etf],
        Arc::new(PagedCancellingAdapter {
            cancel: cancel.clone(),
        }),
        Duration::ZERO,
    );

    let mut queued = spy_descriptor();
    queued.symbol = "QQQ".to_string();
    queued.priority = 2;
    let jobs = tidemark_application::orchestrator::build_jobs(
        &[spy_descriptor(), queued],
        &JobFilter::default(),
        ts(8),
    );
    assert_eq!(jobs.len(), 2);
    let sinks: Vec<Arc<dyn RecordSink>> = vec![csv_sink.clone()];
    let summary = orchestrator.run(jobs, &sinks, &cancel);

    // The in-flight fetch stops at its page boundary and lands the page it
    // completed; the queued job is never scheduled.
    assert!(cancel.is_cancelled());
    assert_eq!(summary.outcomes().len(), 1);
    assert_eq!(summary.successes(), 1);

    let records = csv_sink
        .read_partition("SPY", Timeframe::Day)
        .expect("read csv");
    assert_eq!(records.len(), 2);
    assert!(csv_sink
        .read_partition("QQQ", Timeframe::Day)
        .expect("read csv")
        .is_empty());
}

#[test]
fn file_partitions_reload_into_the_store_incrementally() {
    let base = unique_tmp_dir("pipeline_load");
    let csv_sink = Arc::new(CsvSink::new(&base));
    let store = Arc::new(InMemoryStore::default());
    let loader = DedupLoader::new(store.clone(), LoaderConfig::default());

    let orchestrator = build_orchestrator();
    let jobs = tidemark_application::orchestrator::build_jobs(
        &[spy_descriptor()],
        &JobFilter::default(),
        ts(8),
    );
    let sinks: Vec<Arc<dyn RecordSink>> = vec![csv_sink.clone()];
    orchestrator.run(jobs, &sinks, &CancelFlag::new());

    // Standalone load from the CSV tree, as the load command does.
    let partitions = csv_sink.partitions().expect("partitions");
    assert_eq!(partitions, vec![("SPY".to_string(), Timeframe::Day)]);
    let records = csv_sink
        .read_partition("SPY", Timeframe::Day)
        .expect("read");
    let report = loader
        .load(LoadMode::Incremental, &records)
        .expect("first load");
    assert_eq!(report.inserted, 3);

    // Reloading the same files inserts nothing new.
    let report = loader
        .load(LoadMode::Incremental, &records)
        .expect("second load");
    assert_eq!(report.inserted, 0);
    assert_eq!(report.skipped, 3);

    let stats = store
        .partition_stats("SPY", Timeframe::Day)
        .expect("stats")
        .expect("present");
    assert_eq!(stats.rows, 3);
}

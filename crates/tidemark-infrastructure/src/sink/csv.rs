use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use tidemark_domain::repositories::bar_store::{PartitionInspector, PartitionStats, StoreError};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::record::{CanonicalRecord, ClassFields};
use tidemark_domain::value_objects::timeframe::Timeframe;

use super::layout::SinkLayout;
use super::{group_by_partition, merge_by_key, stats_from_records};

/// Flat row shape for the CSV files. Class-specific fields become nullable
/// columns; the asset class column tells a reader which ones are meaningful.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    symbol: String,
    asset_class: String,
    index_membership: String,
    timestamp: String,
    timeframe: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
    turnover: Option<f64>,
    vwap: Option<f64>,
    simple_return: Option<f64>,
    log_return: Option<f64>,
    source: String,
    ingested_at: String,
}

impl From<&CanonicalRecord> for CsvRow {
    fn from(record: &CanonicalRecord) -> Self {
        Self {
            symbol: record.symbol.clone(),
            asset_class: record.asset_class.as_str().to_string(),
            index_membership: record.index_membership.clone(),
            timestamp: record.timestamp.to_rfc3339(),
            timeframe: record.timeframe.label().to_string(),
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            adj_close: record.adj_close(),
            turnover: record.turnover(),
            vwap: record.vwap,
            simple_return: record.simple_return,
            log_return: record.log_return,
            source: record.source.clone(),
            ingested_at: record.ingested_at.to_rfc3339(),
        }
    }
}

impl CsvRow {
    fn into_record(self) -> Result<CanonicalRecord, String> {
        let asset_class = AssetClass::parse(&self.asset_class)?;
        let class_fields = match asset_class {
            AssetClass::Crypto => ClassFields::Crypto {
                turnover: self.turnover,
            },
            AssetClass::Commodity => ClassFields::Commodity,
            AssetClass::Equity | AssetClass::Etf => ClassFields::Equity {
                adj_close: self.adj_close,
            },
        };
        Ok(CanonicalRecord {
            timestamp: parse_rfc3339(&self.timestamp)?,
            timeframe: Timeframe::parse(&self.timeframe)?,
            symbol: self.symbol,
            asset_class,
            index_membership: self.index_membership,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            class_fields,
            vwap: self.vwap,
            simple_return: self.simple_return,
            log_return: self.log_return,
            source: self.source,
            ingested_at: parse_rfc3339(&self.ingested_at)?,
        })
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("unsupported timestamp {value}: {err}"))
}

pub struct CsvSink {
    layout: SinkLayout,
}

impl CsvSink {
    pub fn new(base: impl Into<std::path::PathBuf>) -> Self {
        Self {
            layout: SinkLayout::new(base, "csv", "csv"),
        }
    }

    /// All (symbol, timeframe) partitions present in the CSV tree.
    pub fn partitions(&self) -> Result<Vec<(String, Timeframe)>, String> {
        Ok(self
            .layout
            .list_partitions()?
            .into_iter()
            .map(|p| (p.symbol, p.timeframe))
            .collect())
    }

    /// Reads one partition back, sorted by timestamp. Used by the standalone
    /// load command and by the verifier.
    pub fn read_partition(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<CanonicalRecord>, String> {
        let files: Vec<_> = self
            .layout
            .list_partitions()?
            .into_iter()
            .filter(|p| p.symbol == symbol && p.timeframe == timeframe)
            .collect();
        let mut merged = Vec::new();
        for file in files {
            let records = read_file(&file.path)?;
            merged = merge_by_key(merged, &records);
        }
        Ok(merged)
    }

    fn write_partition(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        incoming: &[CanonicalRecord],
    ) -> Result<usize, String> {
        let Some(first) = incoming.first() else {
            return Ok(0);
        };
        let asset_class = first.asset_class;
        let old_files = self
            .layout
            .partition_files(asset_class, symbol, timeframe)?;
        let mut existing = Vec::new();
        for path in &old_files {
            let records = read_file(path)?;
            existing = merge_by_key(existing, &records);
        }
        let existing_keys = existing.len();
        let merged = merge_by_key(existing, incoming);
        let added = merged.len() - existing_keys;

        let stats = stats_from_records(&merged)
            .ok_or_else(|| format!("no rows to write for {symbol}/{}", timeframe.label()))?;
        let dir = self.layout.partition_dir(asset_class, symbol);
        let target = dir.join(
            self.layout
                .file_name(symbol, timeframe, stats.min_ts, stats.max_ts),
        );

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &merged {
            writer
                .serialize(CsvRow::from(record))
                .map_err(|err| format!("failed to serialize CSV row: {err}"))?;
        }
        let contents = writer
            .into_inner()
            .map_err(|err| format!("failed to flush CSV buffer: {err}"))?;
        self.layout.write_atomically(&target, &contents)?;

        for old in old_files {
            if old != target {
                fs::remove_file(&old).map_err(|err| {
                    format!("failed to remove superseded {}: {}", old.display(), err)
                })?;
            }
        }
        tracing::debug!(
            symbol,
            timeframe = %timeframe,
            rows = merged.len(),
            file = %target.display(),
            "wrote CSV partition"
        );
        Ok(added)
    }
}

fn read_file(path: &Path) -> Result<Vec<CanonicalRecord>, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open CSV {}: {}", path.display(), err))?;
    let mut reader = csv::Reader::from_reader(file);
    let mut records = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        let row = result.map_err(|err| format!("failed to parse CSV row: {err}"))?;
        records.push(row.into_record()?);
    }
    Ok(records)
}

impl RecordSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn write(&self, records: &[CanonicalRecord]) -> Result<usize, String> {
        let mut added = 0;
        for ((symbol, timeframe), group) in group_by_partition(records) {
            added += self.write_partition(&symbol, timeframe, &group)?;
        }
        Ok(added)
    }
}

impl PartitionInspector for CsvSink {
    fn partition_stats(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<PartitionStats>, StoreError> {
        let records = self
            .read_partition(symbol, timeframe)
            .map_err(StoreError::Query)?;
        Ok(stats_from_records(&records))
    }
}

use arrow::array::{
    Array, Float64Array, Float64Builder, Int64Array, Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tidemark_domain::repositories::bar_store::{PartitionInspector, PartitionStats, StoreError};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::record::{CanonicalRecord, ClassFields};
use tidemark_domain::value_objects::timeframe::Timeframe;

use super::layout::SinkLayout;
use super::{group_by_partition, merge_by_key, stats_from_records};

/// Parquet mirror of the CSV tree, same layout and merge semantics.
/// Timestamps are epoch milliseconds, class-specific columns are nullable.
pub struct ParquetSink {
    layout: SinkLayout,
    props: WriterProperties,
}

impl ParquetSink {
    pub fn new(base: impl Into<std::path::PathBuf>) -> Result<Self, String> {
        let zstd = ZstdLevel::try_new(3).map_err(|err| format!("invalid zstd level: {err}"))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(zstd))
            .build();
        Ok(Self {
            layout: SinkLayout::new(base, "parquet", "parquet"),
            props,
        })
    }

    pub fn partitions(&self) -> Result<Vec<(String, Timeframe)>, String> {
        Ok(self
            .layout
            .list_partitions()?
            .into_iter()
            .map(|p| (p.symbol, p.timeframe))
            .collect())
    }

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

        let batch = build_batch(&merged)?;
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, bar_schema(), Some(self.props.clone()))
            .map_err(|err| format!("failed to create parquet writer: {err}"))?;
        writer
            .write(&batch)
            .map_err(|err| format!("failed to write parquet batch: {err}"))?;
        writer
            .close()
            .map_err(|err| format!("failed to finish parquet file: {err}"))?;
        self.layout.write_atomically(&target, &buffer)?;

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
            "wrote parquet partition"
        );
        Ok(added)
    }
}

impl RecordSink for ParquetSink {
    fn name(&self) -> &str {
        "parquet"
    }

    fn write(&self, records: &[CanonicalRecord]) -> Result<usize, String> {
        let mut added = 0;
        for ((symbol, timeframe), group) in group_by_partition(records) {
            added += self.write_partition(&symbol, timeframe, &group)?;
        }
        Ok(added)
    }
}

impl PartitionInspector for ParquetSink {
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

fn bar_schema() -> SchemaRef {
    static SCHEMA: std::sync::OnceLock<SchemaRef> = std::sync::OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("symbol", DataType::Utf8, false),
                Field::new("asset_class", DataType::Utf8, false),
                Field::new("index_membership", DataType::Utf8, false),
                Field::new("timestamp_ms", DataType::Int64, false),
                Field::new("timeframe", DataType::Utf8, false),
                Field::new("open", DataType::Float64, false),
                Field::new("high", DataType::Float64, false),
                Field::new("low", DataType::Float64, false),
                Field::new("close", DataType::Float64, false),
                Field::new("volume", DataType::Float64, false),
                Field::new("adj_close", DataType::Float64, true),
                Field::new("turnover", DataType::Float64, true),
                Field::new("vwap", DataType::Float64, true),
                Field::new("simple_return", DataType::Float64, true),
                Field::new("log_return", DataType::Float64, true),
                Field::new("source", DataType::Utf8, false),
                Field::new("ingested_at_ms", DataType::Int64, false),
            ]))
        })
        .clone()
}

fn build_batch(records: &[CanonicalRecord]) -> Result<RecordBatch, String> {
    let capacity = records.len();
    let mut symbol = StringBuilder::with_capacity(capacity, capacity * 8);
    let mut asset_class = StringBuilder::with_capacity(capacity, capacity * 8);
    let mut index_membership = StringBuilder::with_capacity(capacity, capacity * 8);
    let mut timestamp_ms = Int64Builder::with_capacity(capacity);
    let mut timeframe = StringBuilder::with_capacity(capacity, capacity * 5);
    let mut open = Float64Builder::with_capacity(capacity);
    let mut high = Float64Builder::with_capacity(capacity);
    let mut low = Float64Builder::with_capacity(capacity);
    let mut close = Float64Builder::with_capacity(capacity);
    let mut volume = Float64Builder::with_capacity(capacity);
    let mut adj_close = Float64Builder::with_capacity(capacity);
    let mut turnover = Float64Builder::with_capacity(capacity);
    let mut vwap = Float64Builder::with_capacity(capacity);
    let mut simple_return = Float64Builder::with_capacity(capacity);
    let mut log_return = Float64Builder::with_capacity(capacity);
    let mut source = StringBuilder::with_capacity(capacity, capacity * 8);
    let mut ingested_at_ms = Int64Builder::with_capacity(capacity);

    for record in records {
        symbol.append_value(&record.symbol);
        asset_class.append_value(record.asset_class.as_str());
        index_membership.append_value(&record.index_membership);
        timestamp_ms.append_value(record.timestamp.timestamp_millis());
        timeframe.append_value(record.timeframe.label());
        open.append_value(record.open);
        high.append_value(record.high);
        low.append_value(record.low);
        close.append_value(record.close);
        volume.append_value(record.volume);
        adj_close.append_option(record.adj_close());
        turnover.append_option(record.turnover());
        vwap.append_option(record.vwap);
        simple_return.append_option(record.simple_return);
        log_return.append_option(record.log_return);
        source.append_value(&record.source);
        ingested_at_ms.append_value(record.ingested_at.timestamp_millis());
    }

    RecordBatch::try_new(
        bar_schema(),
        vec![
            Arc::new(symbol.finish()),
            Arc::new(asset_class.finish()),
            Arc::new(index_membership.finish()),
            Arc::new(timestamp_ms.finish()),
            Arc::new(timeframe.finish()),
            Arc::new(open.finish()),
            Arc::new(high.finish()),
            Arc::new(low.finish()),
            Arc::new(close.finish()),
            Arc::new(volume.finish()),
            Arc::new(adj_close.finish()),
            Arc::new(turnover.finish()),
            Arc::new(vwap.finish()),
            Arc::new(simple_return.finish()),
            Arc::new(log_return.finish()),
            Arc::new(source.finish()),
            Arc::new(ingested_at_ms.finish()),
        ],
    )
    .map_err(|err| format!("failed to build parquet batch: {err}"))
}

fn read_file(path: &Path) -> Result<Vec<CanonicalRecord>, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open parquet {}: {}", path.display(), err))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|err| format!("failed to read parquet {}: {}", path.display(), err))?
        .build()
        .map_err(|err| format!("failed to read parquet {}: {}", path.display(), err))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|err| format!("failed to decode parquet batch: {err}"))?;
        decode_batch(&batch, &mut records)?;
    }
    Ok(records)
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<CanonicalRecord>) -> Result<(), String> {
    let symbol = utf8_column(batch, 0)?;
    let asset_class = utf8_column(batch, 1)?;
    let index_membership = utf8_column(batch, 2)?;
    let timestamp_ms = int64_column(batch, 3)?;
    let timeframe = utf8_column(batch, 4)?;
    let open = f64_column(batch, 5)?;
    let high = f64_column(batch, 6)?;
    let low = f64_column(batch, 7)?;
    let close = f64_column(batch, 8)?;
    let volume = f64_column(batch, 9)?;
    let adj_close = f64_column(batch, 10)?;
    let turnover = f64_column(batch, 11)?;
    let vwap = f64_column(batch, 12)?;
    let simple_return = f64_column(batch, 13)?;
    let log_return = f64_column(batch, 14)?;
    let source = utf8_column(batch, 15)?;
    let ingested_at_ms = int64_column(batch, 16)?;

    for row in 0..batch.num_rows() {
        let class = AssetClass::parse(asset_class.value(row))?;
        let class_fields = match class {
            AssetClass::Crypto => ClassFields::Crypto {
                turnover: opt_f64(turnover, row),
            },
            AssetClass::Commodity => ClassFields::Commodity,
            AssetClass::Equity | AssetClass::Etf => ClassFields::Equity {
                adj_close: opt_f64(adj_close, row),
            },
        };
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_ms.value(row))
            .single()
            .ok_or_else(|| format!("parquet row {row} has invalid timestamp"))?;
        let ingested_at = Utc
            .timestamp_millis_opt(ingested_at_ms.value(row))
            .single()
            .ok_or_else(|| format!("parquet row {row} has invalid ingested_at"))?;
        out.push(CanonicalRecord {
            symbol: symbol.value(row).to_string(),
            asset_class: class,
            index_membership: index_membership.value(row).to_string(),
            timestamp,
            timeframe: Timeframe::parse(timeframe.value(row))?,
            open: open.value(row),
            high: high.value(row),
            low: low.value(row),
            close: close.value(row),
            volume: volume.value(row),
            class_fields,
            vwap: opt_f64(vwap, row),
            simple_return: opt_f64(simple_return, row),
            log_return: opt_f64(log_return, row),
            source: source.value(row).to_string(),
            ingested_at,
        });
    }
    Ok(())
}

fn utf8_column(batch: &RecordBatch, index: usize) -> Result<&StringArray, String> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| format!("parquet column {index} is not utf8"))
}

fn int64_column(batch: &RecordBatch, index: usize) -> Result<&Int64Array, String> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| format!("parquet column {index} is not int64"))
}

fn f64_column(batch: &RecordBatch, index: usize) -> Result<&Float64Array, String> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| format!("parquet column {index} is not float64"))
}

fn opt_f64(array: &Float64Array, row: usize) -> Option<f64> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

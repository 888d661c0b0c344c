use std::fs;
use std::path::{Path, PathBuf};
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::timeframe::Timeframe;

use chrono::{DateTime, Utc};

/// On-disk layout shared by both file sinks:
/// `{base}/{format}/{asset_class}/{symbol}/{symbol}_{timeframe}_{start}_{end}.{ext}`
/// with dates as `YYYYMMDD`. One live file per (symbol, timeframe); a rewrite
/// that widens the window replaces the old file.
#[derive(Debug, Clone)]
pub struct SinkLayout {
    base: PathBuf,
    format: &'static str,
    ext: &'static str,
}

impl SinkLayout {
    pub fn new(base: impl Into<PathBuf>, format: &'static str, ext: &'static str) -> Self {
        Self {
            base: base.into(),
            format,
            ext,
        }
    }

    pub fn partition_dir(&self, asset_class: AssetClass, symbol: &str) -> PathBuf {
        self.base
            .join(self.format)
            .join(asset_class.as_str())
            .join(symbol)
    }

    pub fn file_name(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        format!(
            "{}_{}_{}_{}.{}",
            symbol,
            timeframe.label(),
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
            self.ext
        )
    }

    /// All files currently holding data for one (symbol, timeframe). Usually
    /// zero or one; more than one means an interrupted rewrite left a
    /// predecessor behind, and the caller merges and removes them.
    pub fn partition_files(
        &self,
        asset_class: AssetClass,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<PathBuf>, String> {
        let dir = self.partition_dir(asset_class, symbol);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_{}_", symbol, timeframe.label());
        let mut files = Vec::new();
        let entries = fs::read_dir(&dir)
            .map_err(|err| format!("failed to read sink dir {}: {}", dir.display(), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| format!("failed to read sink dir entry: {err}"))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(&format!(".{}", self.ext)) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Walks the whole tree and lists every partition present, for the load
    /// and verify commands. Timeframe comes from the file name.
    pub fn list_partitions(&self) -> Result<Vec<PartitionFile>, String> {
        let root = self.base.join(self.format);
        let mut partitions = Vec::new();
        if !root.exists() {
            return Ok(partitions);
        }
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir)
                .map_err(|err| format!("failed to read sink dir {}: {}", dir.display(), err))?;
            for entry in entries {
                let entry =
                    entry.map_err(|err| format!("failed to read sink dir entry: {err}"))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.ends_with(&format!(".{}", self.ext)) {
                    continue;
                }
                if let Some((symbol, timeframe)) = parse_partition_name(name) {
                    partitions.push(PartitionFile {
                        symbol,
                        timeframe,
                        path,
                    });
                }
            }
        }
        partitions.sort_by(|a, b| (&a.symbol, a.timeframe).cmp(&(&b.symbol, b.timeframe)));
        Ok(partitions)
    }

    /// Writes `contents` via a temp file in the target directory, then
    /// renames into place so readers never observe a half-written file.
    pub fn write_atomically(&self, target: &Path, contents: &[u8]) -> Result<(), String> {
        let dir = target
            .parent()
            .ok_or_else(|| format!("sink path {} has no parent", target.display()))?;
        fs::create_dir_all(dir)
            .map_err(|err| format!("failed to create sink dir {}: {}", dir.display(), err))?;
        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("partition"),
            std::process::id()
        ));
        fs::write(&tmp, contents)
            .map_err(|err| format!("failed to write {}: {}", tmp.display(), err))?;
        fs::rename(&tmp, target).map_err(|err| {
            format!(
                "failed to rename {} -> {}: {}",
                tmp.display(),
                target.display(),
                err
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct PartitionFile {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub path: PathBuf,
}

/// `{symbol}_{timeframe}_{start}_{end}` parsed from the back, so symbols
/// containing underscores still resolve.
fn parse_partition_name(name: &str) -> Option<(String, Timeframe)> {
    let stem = name.rsplit_once('.')?.0;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 4 {
        return None;
    }
    let label = parts[parts.len() - 3];
    let timeframe = Timeframe::parse(label).ok()?;
    let symbol = parts[..parts.len() - 3].join("_");
    if symbol.is_empty() {
        return None;
    }
    Some((symbol, timeframe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_dir(name: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("tidemark_{name}_{}_{}", std::process::id(), now))
    }

    #[test]
    fn file_name_encodes_partition_and_window() {
        let layout = SinkLayout::new("/data", "csv", "csv");
        let start = Utc.with_ymd_and_hms(2021, 1, 4, 0, 0, 0).single().expect("start");
        let end = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().expect("end");
        assert_eq!(
            layout.file_name("SPY", Timeframe::Day, start, end),
            "SPY_1day_20210104_20260102.csv"
        );
        assert_eq!(
            layout.partition_dir(AssetClass::Etf, "SPY"),
            PathBuf::from("/data/csv/etf/SPY")
        );
    }

    #[test]
    fn parse_partition_name_handles_underscored_symbols() {
        assert_eq!(
            parse_partition_name("BRK_B_1hour_20250101_20260101.csv"),
            Some(("BRK_B".to_string(), Timeframe::Hour))
        );
        assert_eq!(
            parse_partition_name("SPY_1day_20210104_20260102.parquet"),
            Some(("SPY".to_string(), Timeframe::Day))
        );
        assert_eq!(parse_partition_name("junk.csv"), None);
    }

    #[test]
    fn partition_files_and_list_partitions_round_trip() {
        let base = unique_tmp_dir("layout");
        let layout = SinkLayout::new(&base, "csv", "csv");
        let dir = layout.partition_dir(AssetClass::Crypto, "BTCUSDT");
        fs::create_dir_all(&dir).expect("create dir");
        fs::write(dir.join("BTCUSDT_1hour_20250101_20250601.csv"), "x").expect("write");
        fs::write(dir.join("BTCUSDT_1hour_20250101_20260101.csv"), "x").expect("write");
        fs::write(dir.join("BTCUSDT_1day_20250101_20260101.csv"), "x").expect("write");
        fs::write(dir.join("notes.txt"), "x").expect("write");

        let hourly = layout
            .partition_files(AssetClass::Crypto, "BTCUSDT", Timeframe::Hour)
            .expect("partition files");
        assert_eq!(hourly.len(), 2);

        let all = layout.list_partitions().expect("list");
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| p.symbol == "BTCUSDT"));
    }

    #[test]
    fn write_atomically_replaces_in_place() {
        let base = unique_tmp_dir("atomic");
        let layout = SinkLayout::new(&base, "csv", "csv");
        let target = base.join("csv/etf/SPY/SPY_1day_20250101_20260101.csv");
        layout.write_atomically(&target, b"one").expect("write");
        layout.write_atomically(&target, b"two").expect("rewrite");
        assert_eq!(fs::read(&target).expect("read"), b"two");
    }
}

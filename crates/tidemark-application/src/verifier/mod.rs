use std::sync::Arc;
use tidemark_domain::repositories::bar_store::{PartitionInspector, StoreError};
use tidemark_domain::value_objects::timeframe::Timeframe;

/// A storage surface the verifier compares: the CSV tree, the Parquet tree,
/// or the database itself.
pub struct VerifySource {
    pub name: String,
    pub inspector: Arc<dyn PartitionInspector>,
}

impl VerifySource {
    pub fn new(name: impl Into<String>, inspector: Arc<dyn PartitionInspector>) -> Self {
        Self {
            name: name.into(),
            inspector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// One source has the partition, the other does not.
    Presence {
        symbol: String,
        timeframe: Timeframe,
        present_in: String,
        missing_from: String,
    },
    /// Row counts differ by more than the tolerance.
    RowCount {
        symbol: String,
        timeframe: Timeframe,
        left: String,
        left_rows: u64,
        right: String,
        right_rows: u64,
    },
    /// Latest timestamps disagree, usually a stalled loader.
    MaxTimestamp {
        symbol: String,
        timeframe: Timeframe,
        left: String,
        right: String,
    },
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Divergence::Presence {
                symbol,
                timeframe,
                present_in,
                missing_from,
            } => write!(
                f,
                "{symbol}/{timeframe}: present in {present_in}, missing from {missing_from}"
            ),
            Divergence::RowCount {
                symbol,
                timeframe,
                left,
                left_rows,
                right,
                right_rows,
            } => write!(
                f,
                "{symbol}/{timeframe}: {left} has {left_rows} rows, {right} has {right_rows}"
            ),
            Divergence::MaxTimestamp {
                symbol,
                timeframe,
                left,
                right,
            } => write!(
                f,
                "{symbol}/{timeframe}: latest timestamp differs between {left} and {right}"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub partitions_checked: u64,
    pub divergences: Vec<Divergence>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// Compares each partition's row count and latest timestamp pairwise across
/// all sources. Counts within `tolerance_rows` of each other are treated as
/// equal so that in-flight loads do not page anyone.
pub fn verify(
    partitions: &[(String, Timeframe)],
    sources: &[VerifySource],
    tolerance_rows: u64,
) -> Result<VerifyReport, StoreError> {
    let mut report = VerifyReport::default();

    for (symbol, timeframe) in partitions {
        report.partitions_checked += 1;
        let mut stats = Vec::with_capacity(sources.len());
        for source in sources {
            stats.push((
                source.name.as_str(),
                source.inspector.partition_stats(symbol, *timeframe)?,
            ));
        }

        for i in 0..stats.len() {
            for j in (i + 1)..stats.len() {
                let (left_name, left) = &stats[i];
                let (right_name, right) = &stats[j];
                match (left, right) {
                    (Some(l), Some(r)) => {
                        if l.rows.abs_diff(r.rows) > tolerance_rows {
                            report.divergences.push(Divergence::RowCount {
                                symbol: symbol.clone(),
                                timeframe: *timeframe,
                                left: left_name.to_string(),
                                left_rows: l.rows,
                                right: right_name.to_string(),
                                right_rows: r.rows,
                            });
                        } else if l.max_ts != r.max_ts {
                            report.divergences.push(Divergence::MaxTimestamp {
                                symbol: symbol.clone(),
                                timeframe: *timeframe,
                                left: left_name.to_string(),
                                right: right_name.to_string(),
                            });
                        }
                    }
                    (Some(_), None) => report.divergences.push(Divergence::Presence {
                        symbol: symbol.clone(),
                        timeframe: *timeframe,
                        present_in: left_name.to_string(),
                        missing_from: right_name.to_string(),
                    }),
                    (None, Some(_)) => report.divergences.push(Divergence::Presence {
                        symbol: symbol.clone(),
                        timeframe: *timeframe,
                        present_in: right_name.to_string(),
                        missing_from: left_name.to_string(),
                    }),
                    (None, None) => {}
                }
            }
        }
    }

    for divergence in &report.divergences {
        tracing::warn!(%divergence, "consistency check divergence");
    }
    tracing::info!(
        partitions = report.partitions_checked,
        divergences = report.divergences.len(),
        "consistency check complete"
    );
    Ok(report)
}

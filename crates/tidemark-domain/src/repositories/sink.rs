use crate::value_objects::record::CanonicalRecord;

/// Consumer of finalized canonical records: file sinks and the database
/// loader both sit behind this. The orchestrator serializes calls per
/// (symbol, timeframe) partition, so implementations never see concurrent
/// writes to the same partition.
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Accepts a batch of records (possibly spanning partitions) and returns
    /// how many were newly persisted: records whose (symbol, timeframe,
    /// timestamp) key was not already present. Re-writes of existing keys
    /// update in place and do not count.
    fn write(&self, records: &[CanonicalRecord]) -> Result<usize, String>;
}

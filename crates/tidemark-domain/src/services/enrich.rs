use crate::value_objects::record::CanonicalRecord;

/// Window-level post-processing shared by all source adapters.
///
/// Sorts by timestamp, drops duplicate keys keeping the later-fetched value,
/// fills missing VWAP as cumulative (typical price x volume) / cumulative
/// volume over the window, and computes simple/log returns from consecutive
/// closes. Returns are never computed across adapter invocations: the first
/// record of the window keeps `None`.
pub fn finalize_window(mut records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
    if records.is_empty() {
        return records;
    }

    // Stable sort, so for equal timestamps the later-fetched element stays
    // behind the earlier one and the keep-last dedupe below picks it.
    records.sort_by_key(|r| r.timestamp);

    let mut out: Vec<CanonicalRecord> = Vec::with_capacity(records.len());
    for record in records {
        match out.last_mut() {
            Some(last) if last.timestamp == record.timestamp => *last = record,
            _ => out.push(record),
        }
    }

    let mut cum_pv = 0.0;
    let mut cum_volume = 0.0;
    let mut prev_close: Option<f64> = None;
    for record in out.iter_mut() {
        cum_pv += record.typical_price() * record.volume;
        cum_volume += record.volume;
        if record.vwap.is_none() && cum_volume > 0.0 {
            record.vwap = Some(cum_pv / cum_volume);
        }

        match prev_close {
            Some(prev) if prev != 0.0 => {
                record.simple_return = Some((record.close - prev) / prev);
                record.log_return = Some((record.close / prev).ln());
            }
            _ => {
                record.simple_return = None;
                record.log_return = None;
            }
        }
        prev_close = Some(record.close);
    }

    out
}

use crate::value_objects::asset_class::AssetClass;
use crate::value_objects::timeframe::Timeframe;
use chrono::{DateTime, Utc};

/// Fields that only exist for some asset classes. The persisted wide table
/// keeps them as nullable columns; in memory they stay tagged so a crypto
/// record can never carry an adjusted close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClassFields {
    Equity { adj_close: Option<f64> },
    Crypto { turnover: Option<f64> },
    Commodity,
}

/// One normalized OHLCV bar, independent of the provider that produced it.
/// Uniquely keyed by (symbol, timeframe, timestamp); a later fetch of the
/// same key supersedes rather than amends.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub index_membership: String,
    pub timestamp: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub class_fields: ClassFields,
    pub vwap: Option<f64>,
    pub simple_return: Option<f64>,
    pub log_return: Option<f64>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn key(&self) -> (&str, Timeframe, DateTime<Utc>) {
        (&self.symbol, self.timeframe, self.timestamp)
    }

    pub fn adj_close(&self) -> Option<f64> {
        match self.class_fields {
            ClassFields::Equity { adj_close } => adj_close,
            _ => None,
        }
    }

    pub fn turnover(&self) -> Option<f64> {
        match self.class_fields {
            ClassFields::Crypto { turnover } => turnover,
            _ => None,
        }
    }

    /// Typical price, the per-bar term of the cumulative VWAP fallback.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

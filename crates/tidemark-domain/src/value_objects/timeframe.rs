use serde::{Deserialize, Serialize};

/// Bar duration. The canonical labels (`1min`, `1hour`, `1day`) are what the
/// file names, the wide table, and the registry use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1min")]
    Minute,
    #[serde(rename = "1hour")]
    Hour,
    #[serde(rename = "1day")]
    Day,
}

impl Timeframe {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "1m" | "1min" | "minute" => Ok(Self::Minute),
            "1h" | "1hour" | "hour" => Ok(Self::Hour),
            "1d" | "1day" | "day" => Ok(Self::Day),
            _ => Err(format!("unsupported timeframe: {value}")),
        }
    }

    /// Comma-separated list, as found in the registry's `timeframes` column.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, String> {
        let mut out = Vec::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let timeframe = Self::parse(part)?;
            if !out.contains(&timeframe) {
                out.push(timeframe);
            }
        }
        if out.is_empty() {
            return Err(format!("no timeframes in: {value}"));
        }
        Ok(out)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Minute => "1min",
            Self::Hour => "1hour",
            Self::Day => "1day",
        }
    }

    pub fn step_seconds(&self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

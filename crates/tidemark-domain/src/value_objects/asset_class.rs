use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Etf,
    Crypto,
    Commodity,
}

impl AssetClass {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "equity" | "stock" | "stocks" => Ok(Self::Equity),
            "etf" => Ok(Self::Etf),
            "crypto" | "cryptocurrency" => Ok(Self::Crypto),
            "commodity" | "commodities" => Ok(Self::Commodity),
            other => Err(format!("unsupported asset class: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::Etf => "etf",
            Self::Crypto => "crypto",
            Self::Commodity => "commodity",
        }
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

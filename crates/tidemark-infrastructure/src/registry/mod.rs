use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::symbol::SymbolDescriptor;
use tidemark_domain::value_objects::timeframe::Timeframe;

/// One registry CSV row as written on disk. `timeframes` is a quoted
/// comma-separated list (`"1day,1hour"`); optional columns fall back to
/// defaults so a minimal registry stays usable.
#[derive(Debug, Deserialize)]
struct RegistryRow {
    symbol: String,
    #[serde(default)]
    name: String,
    asset_class: String,
    #[serde(default)]
    index_membership: String,
    #[serde(default)]
    sector: String,
    #[serde(default)]
    industry: String,
    timeframes: String,
    #[serde(default = "default_years")]
    years: u32,
    #[serde(default)]
    priority: i32,
}

fn default_years() -> u32 {
    5
}

/// Loads the symbol registry. Duplicate symbols and rows that fail to parse
/// are rejected outright rather than silently dropped: a broken registry
/// should stop the run before any API quota is spent.
pub fn load_registry(path: &Path) -> Result<Vec<SymbolDescriptor>, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open registry {}: {}", path.display(), err))?;
    let mut reader = csv::Reader::from_reader(file);

    let mut descriptors = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (index, result) in reader.deserialize::<RegistryRow>().enumerate() {
        let line = index + 2; // header is line 1
        let row = result.map_err(|err| format!("registry line {line}: {err}"))?;

        let symbol = row.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(format!("registry line {line}: empty symbol"));
        }
        if !seen.insert(symbol.clone()) {
            return Err(format!("registry line {line}: duplicate symbol {symbol}"));
        }

        let asset_class = AssetClass::parse(&row.asset_class)
            .map_err(|err| format!("registry line {line}: {err}"))?;
        let timeframes = Timeframe::parse_list(&row.timeframes)
            .map_err(|err| format!("registry line {line}: {err}"))?;
        if row.years == 0 {
            return Err(format!("registry line {line}: years must be at least 1"));
        }

        descriptors.push(SymbolDescriptor {
            name: if row.name.trim().is_empty() {
                symbol.clone()
            } else {
                row.name.trim().to_string()
            },
            symbol,
            asset_class,
            index_membership: or_na(&row.index_membership),
            sector: or_na(&row.sector),
            industry: or_na(&row.industry),
            timeframes,
            years: row.years,
            priority: row.priority,
        });
    }

    if descriptors.is_empty() {
        return Err(format!("registry {} has no rows", path.display()));
    }
    tracing::info!(path = %path.display(), symbols = descriptors.len(), "loaded registry");
    Ok(descriptors)
}

fn or_na(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "N/A".to_string()
    } else {
        trimmed.to_string()
    }
}

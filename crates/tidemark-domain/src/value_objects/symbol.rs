use crate::value_objects::asset_class::AssetClass;
use crate::value_objects::timeframe::Timeframe;

/// One instrument from the registry. Loaded once per run, immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDescriptor {
    pub symbol: String,
    pub name: String,
    pub asset_class: AssetClass,
    pub index_membership: String,
    pub sector: String,
    pub industry: String,
    pub timeframes: Vec<Timeframe>,
    pub years: u32,
    pub priority: i32,
}

pub mod asset_class;
pub mod record;
pub mod symbol;
pub mod timeframe;

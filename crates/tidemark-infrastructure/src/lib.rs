pub mod persistence;
pub mod providers;
pub mod registry;
pub mod sink;

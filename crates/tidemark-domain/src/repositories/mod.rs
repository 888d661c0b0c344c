pub mod bar_store;
pub mod sink;
pub mod source;

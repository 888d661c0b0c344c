pub mod questdb;

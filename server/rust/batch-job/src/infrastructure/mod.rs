pub mod config;
pub mod database;
pub mod operations;
pub mod reaper;
pub mod run_registry;

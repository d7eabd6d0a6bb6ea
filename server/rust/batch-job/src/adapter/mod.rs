pub mod data_source;
pub mod handler;
pub mod repository;

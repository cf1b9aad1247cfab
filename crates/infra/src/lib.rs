//! Infrastructure layer: connection pool, job stores, coordinator, config.

pub mod config;
pub mod db;
pub mod jobs;

mod integration_tests;

pub use config::{ConfigError, QueueConfig};

//! Database adapters: the shared connection pool and the migration runner.

pub mod connector;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod settings;

pub use connector::{Connector, PgConnector};
pub use error::PoolError;
pub use migrations::{MigrationError, MigrationOutcome, run_migrations};
pub use pool::{PoolManager, PoolStatus};
pub use settings::PoolSettings;

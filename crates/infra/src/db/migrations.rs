//! Schema migration runner.
//!
//! Runs separately from the job lifecycle: the stores never issue DDL. The
//! runner applies every pending migration found in a directory and reports
//! whether anything changed.

use std::collections::HashSet;
use std::path::Path;

use sqlx::PgPool;
use sqlx::migrate::{Migrate, MigrateError, Migrator};
use thiserror::Error;
use tracing::info;

/// Migration failure.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to load migrations from {dir}: {source}")]
    Load {
        dir: String,
        #[source]
        source: MigrateError,
    },

    #[error("failed to apply migrations: {0}")]
    Apply(#[from] MigrateError),

    #[error("failed to inspect applied migrations: {0}")]
    Inspect(#[from] sqlx::Error),
}

/// Result of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The schema was already current.
    NoChange,
    /// This many migrations were applied.
    Applied(usize),
}

/// Apply pending migrations from `dir` to the database behind `pool`.
pub async fn run_migrations(
    pool: &PgPool,
    dir: impl AsRef<Path>,
) -> Result<MigrationOutcome, MigrationError> {
    let dir = dir.as_ref();
    let migrator = Migrator::new(dir).await.map_err(|source| MigrationError::Load {
        dir: dir.display().to_string(),
        source,
    })?;

    let pending = {
        let mut conn = pool.acquire().await?;
        conn.ensure_migrations_table().await?;
        let applied: HashSet<i64> = conn
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.version)
            .collect();
        migrator
            .iter()
            .filter(|m| !m.migration_type.is_down_migration() && !applied.contains(&m.version))
            .count()
    };

    migrator.run(pool).await?;

    let outcome = if pending == 0 {
        info!("no new migrations to apply");
        MigrationOutcome::NoChange
    } else {
        info!(applied = pending, "migrations applied successfully");
        MigrationOutcome::Applied(pending)
    };
    Ok(outcome)
}

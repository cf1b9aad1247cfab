//! Tracing and logging setup shared by jobforge processes.

/// Initialize process-wide tracing with the format picked from the
/// environment (`JOBFORGE_LOG_FORMAT`, default JSON).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing subscriber configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;

//! Fixed resource limits applied to every pool.

use std::time::Duration;

/// Resource limits for the shared connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on live connections.
    pub max_connections: u32,
    /// Lower bound on live connections.
    pub min_connections: u32,
    /// Connections kept warm while idle.
    pub min_idle_connections: u32,
    /// Connections older than this are rotated out.
    pub max_lifetime: Duration,
    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,
    /// Interval of the background liveness check.
    pub health_check_period: Duration,
    /// Bound on establishing a single connection.
    pub connect_timeout: Duration,
    /// Deadline for the whole of `initialize` (construction + first ping).
    pub init_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 4,
            min_idle_connections: 3,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            health_check_period: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(15),
        }
    }
}

impl PoolSettings {
    /// Floor actually handed to the pool: sqlx has a single minimum, so the
    /// warm-idle requirement is folded into it, capped at `max_connections`.
    pub fn effective_min_connections(&self) -> u32 {
        self.min_connections
            .max(self.min_idle_connections)
            .min(self.max_connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operational_limits() {
        let s = PoolSettings::default();
        assert_eq!(s.max_connections, 20);
        assert_eq!(s.min_connections, 4);
        assert_eq!(s.min_idle_connections, 3);
        assert_eq!(s.connect_timeout, Duration::from_secs(10));
        assert_eq!(s.init_timeout, Duration::from_secs(15));
        assert_eq!(s.effective_min_connections(), 4);
    }

    #[test]
    fn effective_minimum_never_exceeds_maximum() {
        let s = PoolSettings {
            max_connections: 2,
            min_connections: 1,
            min_idle_connections: 5,
            ..PoolSettings::default()
        };
        assert_eq!(s.effective_min_connections(), 2);
    }
}

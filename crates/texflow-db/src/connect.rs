//! PostgreSQL connections for the document store.
//!
//! Store traffic comes from the scheduler loop, one call at a time, and
//! from compile jobs reading images while they stage a scratch directory.
//! The pool is sized from the worker count accordingly.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use texflow_core::{Error, Result};

/// Ceiling on connections regardless of worker count.
pub const MAX_CONNECTIONS: u32 = 16;

/// How long a caller waits for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::for_workers(1)
    }
}

impl ConnectOptions {
    /// One connection for the scheduler plus one per compile worker, capped.
    pub fn for_workers(workers: usize) -> Self {
        let wanted = u32::try_from(workers).unwrap_or(u32::MAX).saturating_add(1);
        Self {
            max_connections: wanted.clamp(2, MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Open a connection pool to `database_url`.
pub async fn connect(database_url: &str, options: ConnectOptions) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "store",
        component = "postgres",
        op = "connect",
        max_connections = options.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Connected to document store"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_from_workers() {
        assert_eq!(ConnectOptions::for_workers(0).max_connections, 2);
        assert_eq!(ConnectOptions::for_workers(4).max_connections, 5);
        assert_eq!(ConnectOptions::for_workers(64).max_connections, MAX_CONNECTIONS);
    }

    #[test]
    fn test_acquire_timeout_override() {
        let options = ConnectOptions::default().acquire_timeout(Duration::from_secs(5));
        assert_eq!(options.acquire_timeout, Duration::from_secs(5));
        assert_eq!(options.max_connections, 2);
    }
}

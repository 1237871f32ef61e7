// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named lease locks shared between processes.
//!
//! Generation for a source must run in one place at a time, even when
//! several engine processes share the database. A lock is a row in
//! `generation_lock`; acquiring is a conditional upsert that only succeeds
//! when no row exists or the existing lease has expired:
//!
//! ```sql
//! INSERT INTO generation_lock (name, owner, expires_at) VALUES (?, ?, ?)
//! ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
//! WHERE generation_lock.expires_at <= ?now
//! ```
//!
//! A crashed holder blocks others for at most the lease TTL.

use crate::changelog::BoxFuture;
use crate::error::{NrtmError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::source::Source;
use crate::store::execute_with_retry;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock name guarding generation for a source.
pub fn generation_lock_name(source: &Source) -> String {
    format!("nrtm4-generation:{}", source)
}

/// A held lock. Must be handed back to [`LockManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub owner: String,
    /// Epoch millis
    pub expires_at: i64,
}

/// Source of named, expiring locks.
pub trait LockManager: Send + Sync + 'static {
    /// Try once. `None` if someone else holds an unexpired lease.
    fn try_acquire(&self, name: &str, ttl: Duration) -> BoxFuture<'_, Option<LockLease>>;

    /// Give a lease back. Releasing a lease that was taken over is a no-op.
    fn release(&self, lease: &LockLease) -> BoxFuture<'_, ()>;
}

/// Retry [`LockManager::try_acquire`] with backoff until `wait_timeout`.
///
/// Fails with [`NrtmError::LockContended`] when the wait runs out.
pub async fn acquire_with_wait(
    locks: &dyn LockManager,
    name: &str,
    ttl: Duration,
    wait_timeout: Duration,
    retry: &RetryConfig,
) -> Result<LockLease> {
    let started = Instant::now();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        if let Some(lease) = locks.try_acquire(name, ttl).await? {
            if attempt > 1 {
                debug!(lock = name, attempts = attempt, "Lock acquired after waiting");
            }
            metrics::record_lock_wait(name, true, started.elapsed());
            return Ok(lease);
        }

        let elapsed = started.elapsed();
        if elapsed >= wait_timeout || attempt >= retry.max_attempts {
            warn!(lock = name, attempts = attempt, waited = ?elapsed, "Lock still held, giving up");
            metrics::record_lock_wait(name, false, elapsed);
            return Err(NrtmError::lock_contended(name));
        }

        let delay = retry
            .delay_for_attempt(attempt)
            .min(wait_timeout.saturating_sub(elapsed));
        tokio::time::sleep(delay).await;
    }
}

/// [`LockManager`] backed by the shared SQLite store.
#[derive(Clone)]
pub struct SqliteLockManager {
    pool: SqlitePool,
    owner_prefix: String,
}

impl SqliteLockManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner_prefix: format!("pid-{}", std::process::id()),
        }
    }

    pub fn shared(pool: SqlitePool) -> Arc<dyn LockManager> {
        Arc::new(Self::new(pool))
    }

    /// Current holder of a lock, if its lease has not expired.
    pub async fn holder(&self, name: &str) -> Result<Option<LockLease>> {
        let now = chrono::Utc::now().timestamp_millis();
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT name, owner, expires_at FROM generation_lock WHERE name = ? AND expires_at > ?",
        )
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(name, owner, expires_at)| LockLease {
            name,
            owner,
            expires_at,
        }))
    }
}

impl LockManager for SqliteLockManager {
    fn try_acquire(&self, name: &str, ttl: Duration) -> BoxFuture<'_, Option<LockLease>> {
        let name = name.to_string();
        Box::pin(async move {
            let owner = format!("{}-{}", self.owner_prefix, uuid::Uuid::new_v4());
            let now = chrono::Utc::now().timestamp_millis();
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let expires_at = now.saturating_add(ttl_ms);
            let pool = &self.pool;

            let result = execute_with_retry("lock_acquire", || async {
                sqlx::query(
                    r#"
                    INSERT INTO generation_lock (name, owner, expires_at) VALUES (?, ?, ?)
                    ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
                    WHERE generation_lock.expires_at <= ?
                    "#,
                )
                .bind(&name)
                .bind(&owner)
                .bind(expires_at)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            if result.rows_affected() == 0 {
                return Ok(None);
            }

            debug!(lock = %name, owner = %owner, expires_at, "Lock acquired");
            Ok(Some(LockLease {
                name,
                owner,
                expires_at,
            }))
        })
    }

    fn release(&self, lease: &LockLease) -> BoxFuture<'_, ()> {
        let lease = lease.clone();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("lock_release", || async {
                sqlx::query("DELETE FROM generation_lock WHERE name = ? AND owner = ?")
                    .bind(&lease.name)
                    .bind(&lease.owner)
                    .execute(pool)
                    .await
            })
            .await?;

            if result.rows_affected() == 0 {
                warn!(lock = %lease.name, owner = %lease.owner, "Lease was taken over before release");
            } else {
                debug!(lock = %lease.name, "Lock released");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn manager() -> SqliteLockManager {
        let store = SqliteStore::in_memory().await.unwrap();
        SqliteLockManager::new(store.pool().clone())
    }

    #[test]
    fn test_generation_lock_name() {
        assert_eq!(generation_lock_name(&Source::new("RIPE")), "nrtm4-generation:RIPE");
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = manager().await;
        let lease = locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(locks.holder("a").await.unwrap(), Some(lease.clone()));

        assert!(locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().is_none());

        locks.release(&lease).await.unwrap();
        assert!(locks.holder("a").await.unwrap().is_none());
        assert!(locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_locks_are_independent_by_name() {
        let locks = manager().await;
        assert!(locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().is_some());
        assert!(locks.try_acquire("b", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let locks = manager().await;
        let stale = locks.try_acquire("a", Duration::ZERO).await.unwrap().unwrap();

        let fresh = locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_ne!(stale.owner, fresh.owner);

        // The old holder's release must not free the new lease
        locks.release(&stale).await.unwrap();
        assert_eq!(locks.holder("a").await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_acquire_with_wait_times_out() {
        let locks = manager().await;
        let _held = locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().unwrap();

        let started = Instant::now();
        let err = acquire_with_wait(
            &locks,
            "a",
            Duration::from_secs(60),
            Duration::from_millis(100),
            &RetryConfig::lock_wait(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NrtmError::LockContended { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_with_wait_gets_released_lock() {
        let locks = manager().await;
        let held = locks.try_acquire("a", Duration::from_secs(60)).await.unwrap().unwrap();

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release(&held).await.unwrap();
        });

        let lease = acquire_with_wait(
            &locks,
            "a",
            Duration::from_secs(60),
            Duration::from_secs(5),
            &RetryConfig::lock_wait(),
        )
        .await
        .unwrap();
        assert_eq!(lease.name, "a");
    }
}

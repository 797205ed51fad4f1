//! Storage-backed lease lock.
//!
//! Mutual exclusion across service instances piggybacks on the `leases`
//! table: the PRIMARY KEY on `lock_id` makes insert-if-absent atomic, and
//! the expiry timestamp lets any instance reclaim a crashed holder's lease.
//! No fairness, no queuing: a loser simply does no work this cycle.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::storage::Pool;

/// A held lease. Pass it back to `release` when the protected work is done.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lock_id: String,
    pub holder_token: Uuid,
    pub acquired_at: i64,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct LeaseLock {
    pool: Pool,
}

impl LeaseLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Attempt to take the lease for `lock_id`.
    ///
    /// `None` means another holder is live; the caller must skip this cycle
    /// rather than retry. A stale row (its holder crashed or overran) is
    /// deleted and the insert retried once; if a racing instance wins that
    /// reclaim, the PRIMARY KEY conflict resolves it to a single holder.
    pub fn try_acquire(&self, lock_id: &str, duration: Duration) -> Result<Option<Lease>> {
        let conn = self.pool.get()?;
        let now = Utc::now().timestamp_millis();

        match insert_lease(&conn, lock_id, now, duration) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) if is_unique_violation(&e) => {
                let expires_at: Option<i64> = conn
                    .query_row(
                        "SELECT expires_at FROM leases WHERE lock_id = ?1",
                        params![lock_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(expires_at) = expires_at {
                    if expires_at > now {
                        // live holder
                        return Ok(None);
                    }
                }

                // Stale (or vanished between insert and read). The expiry
                // guard keeps this from deleting a freshly-created lease.
                conn.execute(
                    "DELETE FROM leases WHERE lock_id = ?1 AND expires_at <= ?2",
                    params![lock_id, now],
                )?;
                match insert_lease(&conn, lock_id, now, duration) {
                    Ok(lease) => Ok(Some(lease)),
                    // another instance won the reclaim race
                    Err(e) if is_unique_violation(&e) => Ok(None),
                    Err(e) => Err(e).context("Failed to re-insert lease after reclaim"),
                }
            }
            Err(e) => Err(e).context("Failed to insert lease"),
        }
    }

    /// Delete the lease. Scoped to the holder token so an expired holder can
    /// never delete a successor's live lease. Must run on every exit path of
    /// the protected work.
    pub fn release(&self, lease: &Lease) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM leases WHERE lock_id = ?1 AND holder_token = ?2",
            params![lease.lock_id, lease.holder_token.to_string()],
        )?;
        Ok(())
    }
}

fn insert_lease(
    conn: &Connection,
    lock_id: &str,
    now: i64,
    duration: Duration,
) -> Result<Lease, rusqlite::Error> {
    let lease = Lease {
        lock_id: lock_id.to_string(),
        holder_token: Uuid::new_v4(),
        acquired_at: now,
        expires_at: now + duration.as_millis() as i64,
    };
    conn.execute(
        "INSERT INTO leases (lock_id, holder_token, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            lease.lock_id,
            lease.holder_token.to_string(),
            lease.acquired_at,
            lease.expires_at
        ],
    )?;
    Ok(lease)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    fn test_pool() -> (Pool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        (pool, dir)
    }

    #[test]
    fn test_second_acquire_fails_while_live() {
        let (pool, _dir) = test_pool();
        let lock = LeaseLock::new(pool);

        let lease = lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap();
        assert!(lease.is_some());
        let second = lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_release_makes_lease_acquirable() {
        let (pool, _dir) = test_pool();
        let lock = LeaseLock::new(pool);

        let lease = lock
            .try_acquire("detect.tick", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        lock.release(&lease).unwrap();
        let again = lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_stale_lease_is_reclaimed_after_expiry() {
        let (pool, _dir) = test_pool();
        let lock = LeaseLock::new(pool);

        // never released, as if the holder crashed
        let lease = lock
            .try_acquire("detect.tick", Duration::from_millis(50))
            .unwrap()
            .unwrap();
        assert!(lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(80));
        let reclaimed = lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap();
        assert!(reclaimed.is_some());
        assert_ne!(reclaimed.unwrap().holder_token, lease.holder_token);
    }

    #[test]
    fn test_expired_holder_release_spares_successor() {
        let (pool, _dir) = test_pool();
        let lock = LeaseLock::new(pool);

        let crashed = lock
            .try_acquire("detect.tick", Duration::from_millis(50))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        let successor = lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap();
        assert!(successor.is_some());

        // the late release from the crashed holder must not free the lock
        lock.release(&crashed).unwrap();
        assert!(lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let (pool, _dir) = test_pool();
        let a = LeaseLock::new(pool.clone());
        let b = LeaseLock::new(pool);

        let ta = std::thread::spawn(move || a.try_acquire("detect.tick", Duration::from_secs(30)).unwrap());
        let tb = std::thread::spawn(move || b.try_acquire("detect.tick", Duration::from_secs(30)).unwrap());

        let results = [ta.join().unwrap(), tb.join().unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    }

    #[test]
    fn test_independent_lock_ids_do_not_contend() {
        let (pool, _dir) = test_pool();
        let lock = LeaseLock::new(pool);

        assert!(lock.try_acquire("detect.tick", Duration::from_secs(30)).unwrap().is_some());
        assert!(lock.try_acquire("retention.sweep", Duration::from_secs(30)).unwrap().is_some());
    }
}

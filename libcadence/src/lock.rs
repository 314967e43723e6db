//! Account lock manager
//!
//! Grants at most one unexpired lease per account. The lease lives in the
//! `account_leases` table and is taken with a single conditional upsert, so
//! two processes sharing the database are serialized the same way two tasks
//! in one process are. An expired lease can be taken over by anyone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{from_millis, to_millis, Database};
use crate::error::{DbError, Result};

/// Proof of holding an account's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub account_id: i64,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(LockHandle),
    Busy {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct LockManager {
    db: Database,
    ttl: Duration,
}

impl LockManager {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Try to take the lease for `account_id`. Never blocks.
    pub async fn acquire(&self, account_id: i64) -> Result<Acquire> {
        let holder = Uuid::new_v4().to_string();

        // A lease seen in the busy branch may vanish before we read it back;
        // one more attempt settles that race.
        for _ in 0..2 {
            let now = Utc::now();
            let expires_at = self.expiry_from(now);

            let result = sqlx::query(
                r#"
                INSERT INTO account_leases (account_id, holder, acquired_at, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (account_id) DO UPDATE
                SET holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE account_leases.expires_at <= ?
                "#,
            )
            .bind(account_id)
            .bind(&holder)
            .bind(to_millis(now))
            .bind(to_millis(expires_at))
            .bind(to_millis(now))
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() == 1 {
                tracing::debug!(account_id, holder = %holder, "account lease acquired");
                return Ok(Acquire::Acquired(LockHandle {
                    account_id,
                    holder,
                    expires_at,
                }));
            }

            if let Some((current, expires_at)) = self.current(account_id).await? {
                return Ok(Acquire::Busy {
                    holder: current,
                    expires_at,
                });
            }
        }

        Err(DbError::Corrupt(format!(
            "lease for account {} neither acquirable nor held",
            account_id
        ))
        .into())
    }

    /// Extend a held lease. Returns false if the lease was lost.
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<bool> {
        let expires_at = self.expiry_from(Utc::now());
        let result = sqlx::query(
            "UPDATE account_leases SET expires_at = ? WHERE account_id = ? AND holder = ?",
        )
        .bind(to_millis(expires_at))
        .bind(handle.account_id)
        .bind(&handle.holder)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            handle.expires_at = expires_at;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release a lease. Releasing twice, or after the lease was taken over,
    /// is a no-op.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let result = sqlx::query("DELETE FROM account_leases WHERE account_id = ? AND holder = ?")
            .bind(handle.account_id)
            .bind(&handle.holder)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            tracing::debug!(account_id = handle.account_id, "account lease released");
        }
        Ok(())
    }

    /// The current holder of an account's lease, expired or not.
    pub async fn current(&self, account_id: i64) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT holder, expires_at FROM account_leases WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        match row {
            Some(r) => {
                let holder: String = r.try_get("holder").map_err(DbError::SqlxError)?;
                let expires_at: i64 = r.try_get("expires_at").map_err(DbError::SqlxError)?;
                Ok(Some((holder, from_millis(expires_at)?)))
            }
            None => Ok(None),
        }
    }

    /// Delete leases that expired before `now`.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM account_leases WHERE expires_at <= ?")
            .bind(to_millis(now))
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }
}

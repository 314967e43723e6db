//! Database operations for Cadence
//!
//! All timestamps are stored as INTEGER unix milliseconds. Every state
//! transition on `jobs` is a conditional UPDATE guarded on the current state
//! (and, for running jobs, on the lease holder), so a stale writer can never
//! move a job out from under the current owner.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::content::Tone;
use crate::error::{CadenceError, DbError, ErrorKind, Result};
use crate::types::{
    Account, AttemptOutcome, ExecutionAttempt, Job, JobState, NewAccount, NewAttempt, NewJob,
    Platform, QueueStats,
};

const JOB_COLUMNS: &str = "id, account_id, content, media, target_at, state, attempt_count, \
     last_error_kind, last_error, needs_attention, prompt, tone, native_schedule_at, \
     lease_holder, running_since, created_at, updated_at";

const ACCOUNT_COLUMNS: &str =
    "id, platform, label, username, credential_ref, session_ref, created_at, updated_at";

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotCancellable(JobState),
}

/// Result of a reschedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    Rescheduled,
    NotReschedulable(JobState),
}

/// How a running job leaves the Running state.
#[derive(Debug, Clone)]
pub enum Completion {
    Succeeded,
    Retry {
        next_target: DateTime<Utc>,
        kind: ErrorKind,
        message: String,
        needs_attention: bool,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        needs_attention: bool,
    },
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn create_account(&self, account: &NewAccount) -> Result<Account> {
        if account.label.trim().is_empty() {
            return Err(CadenceError::InvalidInput(
                "Account label cannot be empty".to_string(),
            ));
        }

        let now = to_millis(Utc::now());
        let session_ref = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            INSERT INTO accounts (platform, label, username, credential_ref, session_ref, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?)
            "#,
        )
        .bind(account.platform.as_str())
        .bind(&account.label)
        .bind(&account.username)
        .bind(&session_ref)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return CadenceError::InvalidInput(format!(
                        "An account labelled '{}' already exists on {}",
                        account.label, account.platform
                    ));
                }
            }
            CadenceError::from(DbError::SqlxError(e))
        })?;

        let account_id = result.last_insert_rowid();

        sqlx::query("INSERT INTO sessions (ref, account_id) VALUES (?, ?)")
            .bind(&session_ref)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        self.get_account(account_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM accounts ORDER BY id ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    pub async fn set_credential_ref(&self, account_id: i64, credential_ref: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET credential_ref = ?, updated_at = ? WHERE id = ?",
        )
        .bind(credential_ref)
        .bind(to_millis(Utc::now()))
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CadenceError::NotFound(format!("account {}", account_id)));
        }
        Ok(())
    }

    /// Remove an account, cancelling its pending jobs and deleting its
    /// credential and session. Returns the number of cancelled jobs, or
    /// `None` when the account does not exist.
    pub async fn delete_account(&self, account_id: i64) -> Result<Option<u64>> {
        let Some(account) = self.get_account(account_id).await? else {
            return Ok(None);
        };
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let cancelled = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled', last_error = 'account removed', updated_at = ?
            WHERE account_id = ? AND state = 'pending'
            "#,
        )
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        if let Some(credential_ref) = &account.credential_ref {
            sqlx::query("DELETE FROM credentials WHERE ref = ?")
                .bind(credential_ref)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
        }

        sqlx::query("DELETE FROM sessions WHERE ref = ?")
            .bind(&account.session_ref)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(Some(cancelled))
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn insert_job(&self, job: &NewJob) -> Result<Job> {
        let now = to_millis(Utc::now());
        let media = encode_media(&job.media)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (account_id, content, media, target_at, state, attempt_count,
                              needs_attention, prompt, tone, native_schedule_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.account_id)
        .bind(&job.content)
        .bind(media)
        .bind(to_millis(job.target_at))
        .bind(&job.prompt)
        .bind(job.tone.map(|t| t.as_str()))
        .bind(job.native_schedule_at.map(to_millis))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let job_id = result.last_insert_rowid();
        self.get_job(job_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("job {}", job_id)))
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// List jobs ordered by (target, id), optionally filtered.
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        account_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>> {
        let mut where_clauses = vec!["1=1"];
        if state.is_some() {
            where_clauses.push("state = ?");
        }
        if account_id.is_some() {
            where_clauses.push("account_id = ?");
        }

        let query_str = format!(
            "SELECT {} FROM jobs WHERE {} ORDER BY target_at ASC, id ASC LIMIT ?",
            JOB_COLUMNS,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&query_str);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        if let Some(account_id) = account_id {
            query = query.bind(account_id);
        }
        query = query.bind(limit.unwrap_or(-1));

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Pending jobs whose target has passed, oldest target first.
    pub async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE state = 'pending' AND target_at <= ?
            ORDER BY target_at ASC, id ASC
            LIMIT ?
            "#,
            JOB_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Pending → Running. Stamps the lease holder and makes sure the attempt
    /// ordinal is at least 1. Returns false if the job was not pending.
    pub async fn mark_running(&self, job_id: i64, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let now = to_millis(now);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running', lease_holder = ?, running_since = ?,
                attempt_count = MAX(attempt_count, 1), updated_at = ?
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(holder)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist content generated during execution so a retry does not
    /// generate it again.
    pub async fn store_generated_content(&self, job_id: i64, holder: &str, content: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET content = ?, prompt = NULL, updated_at = ?
            WHERE id = ? AND state = 'running' AND lease_holder = ?
            "#,
        )
        .bind(content)
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a running job held by `holder` out of Running and append its
    /// attempt row, in one transaction. Returns false for stale reports (job
    /// no longer running under `holder`); nothing is written then.
    pub async fn finish_running(
        &self,
        holder: &str,
        completion: &Completion,
        attempt: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_millis(now);
        let query = match completion {
            Completion::Succeeded => sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'completed', lease_holder = NULL, running_since = NULL,
                    last_error_kind = NULL, last_error = NULL, needs_attention = 0, updated_at = ?
                WHERE id = ? AND state = 'running' AND lease_holder = ?
                "#,
            )
            .bind(now),
            Completion::Retry {
                next_target,
                kind,
                message,
                needs_attention,
            } => sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'pending', lease_holder = NULL, running_since = NULL,
                    attempt_count = attempt_count + 1, target_at = ?,
                    last_error_kind = ?, last_error = ?, needs_attention = ?, updated_at = ?
                WHERE id = ? AND state = 'running' AND lease_holder = ?
                "#,
            )
            .bind(to_millis(*next_target))
            .bind(kind.as_str())
            .bind(message.clone())
            .bind(*needs_attention)
            .bind(now),
            Completion::Failed {
                kind,
                message,
                needs_attention,
            } => sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'failed', lease_holder = NULL, running_since = NULL,
                    last_error_kind = ?, last_error = ?,
                    needs_attention = MAX(needs_attention, ?), updated_at = ?
                WHERE id = ? AND state = 'running' AND lease_holder = ?
                "#,
            )
            .bind(kind.as_str())
            .bind(message.clone())
            .bind(*needs_attention)
            .bind(now),
        };

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;
        let result = query
            .bind(attempt.job_id)
            .bind(holder)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }

        insert_attempt_row(&mut *tx, attempt).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Running → Pending after the process lost track of an execution
    /// (crash, shutdown, expired lease). The attempt ordinal is unchanged and
    /// an `interrupted` attempt is recorded. Returns false if the job was not
    /// running under `holder`.
    pub async fn interrupt_job(&self, job_id: i64, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = to_millis(now);
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let row = sqlx::query(
            "SELECT account_id, running_since FROM jobs WHERE id = ? AND state = 'running' AND lease_holder = ?",
        )
        .bind(job_id)
        .bind(holder)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let account_id: i64 = row.try_get("account_id").map_err(DbError::SqlxError)?;
        let running_since: Option<i64> = row.try_get("running_since").map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', lease_holder = NULL, running_since = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now_ms)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO execution_attempts (job_id, started_at, ended_at, outcome, detail)
            VALUES (?, ?, ?, 'interrupted', 'execution did not report completion')
            "#,
        )
        .bind(job_id)
        .bind(running_since.unwrap_or(now_ms))
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM account_leases WHERE account_id = ? AND holder = ?")
            .bind(account_id)
            .bind(holder)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Running jobs whose account lease (matching their holder) is gone or expired.
    pub async fn orphaned_running_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs j
            WHERE j.state = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM account_leases l
                  WHERE l.account_id = j.account_id
                    AND l.holder = j.lease_holder
                    AND l.expires_at > ?
              )
            ORDER BY j.id ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Pending → Cancelled. Any other state is reported back unchanged.
    pub async fn cancel_job(&self, job_id: i64) -> Result<CancelOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', updated_at = ?
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        match self.get_job(job_id).await? {
            Some(job) => Ok(CancelOutcome::NotCancellable(job.state)),
            None => Err(CadenceError::NotFound(format!("job {}", job_id))),
        }
    }

    /// Move a pending job to a new target, resetting its attempt budget.
    pub async fn reschedule_job(&self, job_id: i64, target: DateTime<Utc>) -> Result<RescheduleOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET target_at = ?, attempt_count = 0, needs_attention = 0, updated_at = ?
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(to_millis(target))
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            return Ok(RescheduleOutcome::Rescheduled);
        }

        match self.get_job(job_id).await? {
            Some(job) => Ok(RescheduleOutcome::NotReschedulable(job.state)),
            None => Err(CadenceError::NotFound(format!("job {}", job_id))),
        }
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(DbError::SqlxError)?;
            let n: i64 = row.try_get("n").map_err(DbError::SqlxError)?;
            match parse_state(&state)? {
                JobState::Pending => stats.pending = n,
                JobState::Running => stats.running = n,
                JobState::Completed => stats.completed = n,
                JobState::Failed => stats.failed = n,
                JobState::Cancelled => stats.cancelled = n,
            }
        }

        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM jobs WHERE needs_attention = 1 AND state = 'pending') AS attention,
                (SELECT MIN(target_at) FROM jobs WHERE state = 'pending') AS next_due
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        stats.needs_attention = row.try_get("attention").map_err(DbError::SqlxError)?;
        let next_due: Option<i64> = row.try_get("next_due").map_err(DbError::SqlxError)?;
        stats.next_due = next_due.map(from_millis).transpose()?;

        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Execution history
    // ------------------------------------------------------------------

    pub async fn insert_attempt(&self, attempt: &NewAttempt) -> Result<i64> {
        insert_attempt_row(&self.pool, attempt).await
    }

    pub async fn attempts_for_job(&self, job_id: i64) -> Result<Vec<ExecutionAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, started_at, ended_at, outcome, detail, post_url
            FROM execution_attempts WHERE job_id = ? ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(attempt_from_row).collect()
    }

    /// Most recent attempts across all jobs, newest first.
    pub async fn recent_attempts(&self, limit: i64) -> Result<Vec<ExecutionAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, started_at, ended_at, outcome, detail, post_url
            FROM execution_attempts ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(attempt_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Folder watch bookkeeping
    // ------------------------------------------------------------------

    /// Create a job for a watched file unless (file name, mtime) was seen
    /// before. Returns the new job, or `None` for a duplicate.
    pub async fn enqueue_watched_file(
        &self,
        file_name: &str,
        modified_at: DateTime<Utc>,
        job: &NewJob,
    ) -> Result<Option<Job>> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO watched_files (file_name, modified_at, seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT (file_name, modified_at) DO NOTHING
            "#,
        )
        .bind(file_name)
        .bind(to_millis(modified_at))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if inserted.rows_affected() == 0 {
            return Ok(None);
        }
        let watched_id = inserted.last_insert_rowid();

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (account_id, content, media, target_at, state, attempt_count,
                              needs_attention, prompt, tone, native_schedule_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.account_id)
        .bind(&job.content)
        .bind(encode_media(&job.media)?)
        .bind(to_millis(job.target_at))
        .bind(&job.prompt)
        .bind(job.tone.map(|t| t.as_str()))
        .bind(job.native_schedule_at.map(to_millis))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;
        let job_id = result.last_insert_rowid();

        sqlx::query("UPDATE watched_files SET job_id = ? WHERE id = ?")
            .bind(job_id)
            .bind(watched_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        self.get_job(job_id).await
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Corrupt(format!("timestamp {} out of range", ms)).into())
}

fn parse_state(s: &str) -> Result<JobState> {
    JobState::from_str(s).map_err(|e| DbError::Corrupt(e).into())
}

fn encode_media(media: &[PathBuf]) -> Result<String> {
    serde_json::to_string(media)
        .map_err(|e| CadenceError::InvalidInput(format!("Media paths must be valid UTF-8: {}", e)))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| DbError::SqlxError(e).into())
}

fn account_from_row(r: &SqliteRow) -> Result<Account> {
    let platform: String = get(r, "platform")?;
    Ok(Account {
        id: get(r, "id")?,
        platform: Platform::from_str(&platform).map_err(DbError::Corrupt)?,
        label: get(r, "label")?,
        username: get(r, "username")?,
        credential_ref: get(r, "credential_ref")?,
        session_ref: get(r, "session_ref")?,
        created_at: from_millis(get(r, "created_at")?)?,
        updated_at: from_millis(get(r, "updated_at")?)?,
    })
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let state: String = get(r, "state")?;
    let media: String = get(r, "media")?;
    let last_error_kind: Option<String> = get(r, "last_error_kind")?;
    let tone: Option<String> = get(r, "tone")?;
    let attempt_count: i64 = get(r, "attempt_count")?;
    let native_schedule_at: Option<i64> = get(r, "native_schedule_at")?;
    let running_since: Option<i64> = get(r, "running_since")?;

    Ok(Job {
        id: get(r, "id")?,
        account_id: get(r, "account_id")?,
        content: get(r, "content")?,
        media: serde_json::from_str(&media)
            .map_err(|e| DbError::Corrupt(format!("media column: {}", e)))?,
        target_at: from_millis(get(r, "target_at")?)?,
        state: parse_state(&state)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| DbError::Corrupt(format!("attempt_count {}", attempt_count)))?,
        last_error_kind: last_error_kind
            .map(|k| ErrorKind::from_str(&k).map_err(DbError::Corrupt))
            .transpose()?,
        last_error: get(r, "last_error")?,
        needs_attention: get(r, "needs_attention")?,
        prompt: get(r, "prompt")?,
        tone: tone
            .map(|t| Tone::from_str(&t).map_err(DbError::Corrupt))
            .transpose()?,
        native_schedule_at: native_schedule_at.map(from_millis).transpose()?,
        lease_holder: get(r, "lease_holder")?,
        running_since: running_since.map(from_millis).transpose()?,
        created_at: from_millis(get(r, "created_at")?)?,
        updated_at: from_millis(get(r, "updated_at")?)?,
    })
}

fn attempt_from_row(r: &SqliteRow) -> Result<ExecutionAttempt> {
    let outcome: String = get(r, "outcome")?;
    Ok(ExecutionAttempt {
        id: get(r, "id")?,
        job_id: get(r, "job_id")?,
        started_at: from_millis(get(r, "started_at")?)?,
        ended_at: from_millis(get(r, "ended_at")?)?,
        outcome: AttemptOutcome::from_str(&outcome).map_err(DbError::Corrupt)?,
        detail: get(r, "detail")?,
        post_url: get(r, "post_url")?,
    })
}

async fn insert_attempt_row<'e, E>(executor: E, attempt: &NewAttempt) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO execution_attempts (job_id, started_at, ended_at, outcome, detail, post_url)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(attempt.job_id)
    .bind(to_millis(attempt.started_at))
    .bind(to_millis(attempt.ended_at))
    .bind(attempt.outcome.as_str())
    .bind(attempt.detail.as_deref())
    .bind(attempt.post_url.as_deref())
    .execute(executor)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn success(job_id: i64) -> NewAttempt {
        NewAttempt::new(job_id, Utc::now(), Utc::now(), AttemptOutcome::Success)
    }

    fn failure(job_id: i64, kind: ErrorKind) -> NewAttempt {
        NewAttempt::new(job_id, Utc::now(), Utc::now(), AttemptOutcome::Failed(kind))
            .with_detail(kind.as_str())
    }

    async fn add_account(db: &Database, label: &str) -> Account {
        db.create_account(&NewAccount {
            platform: Platform::Twitter,
            label: label.to_string(),
            username: format!("{}@example.com", label),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_account() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;

        let fetched = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.label, "main");
        assert_eq!(fetched.platform, Platform::Twitter);
        assert!(fetched.credential_ref.is_none());
        assert!(!fetched.session_ref.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_account_label_rejected() {
        let (db, _temp_dir) = setup_test_db().await;
        add_account(&db, "main").await;

        let result = db
            .create_account(&NewAccount {
                platform: Platform::Twitter,
                label: "main".to_string(),
                username: "other".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CadenceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_insert_job_defaults() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let target = Utc::now();

        let job = db
            .insert_job(&NewJob::new(account.id, "hello", target).with_media(vec![PathBuf::from("/tmp/a.jpg")]))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.media, vec![PathBuf::from("/tmp/a.jpg")]);
        assert_eq!(to_millis(job.target_at), to_millis(target));
        assert!(!job.needs_attention);
    }

    #[tokio::test]
    async fn test_due_jobs_ordering() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let now = Utc::now();

        let later = db
            .insert_job(&NewJob::new(account.id, "later", now - ChronoDuration::seconds(10)))
            .await
            .unwrap();
        let earlier = db
            .insert_job(&NewJob::new(account.id, "earlier", now - ChronoDuration::seconds(60)))
            .await
            .unwrap();
        let tie = db
            .insert_job(&NewJob::new(account.id, "tie", now - ChronoDuration::seconds(10)))
            .await
            .unwrap();
        db.insert_job(&NewJob::new(account.id, "future", now + ChronoDuration::hours(1)))
            .await
            .unwrap();

        let due = db.due_jobs(now, 10).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id, tie.id]);
    }

    #[tokio::test]
    async fn test_mark_running_is_guarded() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();

        assert!(db.mark_running(job.id, "holder-a", Utc::now()).await.unwrap());
        assert!(!db.mark_running(job.id, "holder-b", Utc::now()).await.unwrap());

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.lease_holder.as_deref(), Some("holder-a"));
    }

    #[tokio::test]
    async fn test_finish_running_ignores_stale_holder() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "holder-a", Utc::now()).await.unwrap();

        let applied = db
            .finish_running("holder-b", &Completion::Succeeded, &success(job.id), Utc::now())
            .await
            .unwrap();
        assert!(!applied);
        assert!(db.attempts_for_job(job.id).await.unwrap().is_empty());

        let applied = db
            .finish_running("holder-a", &Completion::Succeeded, &success(job.id), Utc::now())
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(db.get_job(job.id).await.unwrap().unwrap().state, JobState::Completed);

        let attempts = db.attempts_for_job(job.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_failed_challenge_keeps_attention_flag() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "h", Utc::now()).await.unwrap();

        db.finish_running(
            "h",
            &Completion::Failed {
                kind: ErrorKind::Challenge,
                message: "checkpoint".to_string(),
                needs_attention: true,
            },
            &failure(job.id, ErrorKind::Challenge),
            Utc::now(),
        )
        .await
        .unwrap();

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error_kind, Some(ErrorKind::Challenge));
        assert!(job.needs_attention);
    }

    #[tokio::test]
    async fn test_retry_increments_attempt_and_moves_target() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "h", Utc::now()).await.unwrap();

        let next = Utc::now() + ChronoDuration::seconds(60);
        db.finish_running(
            "h",
            &Completion::Retry {
                next_target: next,
                kind: ErrorKind::Challenge,
                message: "captcha".to_string(),
                needs_attention: true,
            },
            &failure(job.id, ErrorKind::Challenge),
            Utc::now(),
        )
        .await
        .unwrap();

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(to_millis(job.target_at), to_millis(next));
        assert_eq!(job.last_error_kind, Some(ErrorKind::Challenge));
        assert!(job.needs_attention);
        assert!(job.lease_holder.is_none());
    }

    #[tokio::test]
    async fn test_cancel_job_outcomes() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();

        assert_eq!(db.cancel_job(job.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            db.cancel_job(job.id).await.unwrap(),
            CancelOutcome::NotCancellable(JobState::Cancelled)
        );
        assert!(matches!(db.cancel_job(9999).await, Err(CadenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_running_job_rejected() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "h", Utc::now()).await.unwrap();

        assert_eq!(
            db.cancel_job(job.id).await.unwrap(),
            CancelOutcome::NotCancellable(JobState::Running)
        );
    }

    #[tokio::test]
    async fn test_reschedule_resets_attempts() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "h", Utc::now()).await.unwrap();
        db.finish_running(
            "h",
            &Completion::Retry {
                next_target: Utc::now(),
                kind: ErrorKind::Network,
                message: "reset".to_string(),
                needs_attention: true,
            },
            &failure(job.id, ErrorKind::Network),
            Utc::now(),
        )
        .await
        .unwrap();

        let target = Utc::now() + ChronoDuration::days(1);
        assert_eq!(
            db.reschedule_job(job.id, target).await.unwrap(),
            RescheduleOutcome::Rescheduled
        );

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempt_count, 0);
        assert!(!job.needs_attention);
        assert_eq!(to_millis(job.target_at), to_millis(target));
    }

    #[tokio::test]
    async fn test_interrupt_job_records_attempt() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "h", Utc::now()).await.unwrap();

        assert!(db.interrupt_job(job.id, "h", Utc::now()).await.unwrap());
        assert!(!db.interrupt_job(job.id, "h", Utc::now()).await.unwrap());

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 1);

        let attempts = db.attempts_for_job(job.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_orphaned_running_jobs_without_lease() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();
        db.mark_running(job.id, "ghost", Utc::now()).await.unwrap();

        let orphans = db.orphaned_running_jobs(Utc::now()).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, job.id);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let job = db
            .insert_job(&NewJob::new(account.id, "x", Utc::now()))
            .await
            .unwrap();

        sqlx::query("UPDATE jobs SET state = 'exploded' WHERE id = ?")
            .bind(job.id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.get_job(job.id).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_delete_account_cancels_pending_jobs() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let pending = db
            .insert_job(&NewJob::new(account.id, "a", Utc::now()))
            .await
            .unwrap();
        let done = db
            .insert_job(&NewJob::new(account.id, "b", Utc::now()))
            .await
            .unwrap();
        db.mark_running(done.id, "h", Utc::now()).await.unwrap();
        db.finish_running("h", &Completion::Succeeded, &success(done.id), Utc::now())
            .await
            .unwrap();

        assert_eq!(db.delete_account(account.id).await.unwrap(), Some(1));
        assert!(db.get_account(account.id).await.unwrap().is_none());
        assert_eq!(
            db.get_job(pending.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert_eq!(
            db.get_job(done.id).await.unwrap().unwrap().state,
            JobState::Completed
        );
        assert_eq!(db.delete_account(account.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_watched_file_dedupes() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let mtime = Utc::now();
        let job = NewJob::new(account.id, "new media", Utc::now());

        let first = db.enqueue_watched_file("a.jpg", mtime, &job).await.unwrap();
        assert!(first.is_some());

        let second = db.enqueue_watched_file("a.jpg", mtime, &job).await.unwrap();
        assert!(second.is_none());

        let touched = db
            .enqueue_watched_file("a.jpg", mtime + ChronoDuration::seconds(5), &job)
            .await
            .unwrap();
        assert!(touched.is_some());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let (db, _temp_dir) = setup_test_db().await;
        let account = add_account(&db, "main").await;
        let soon = Utc::now() + ChronoDuration::minutes(5);
        db.insert_job(&NewJob::new(account.id, "a", soon)).await.unwrap();
        db.insert_job(&NewJob::new(account.id, "b", soon + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        let c = db.insert_job(&NewJob::new(account.id, "c", soon)).await.unwrap();
        db.cancel_job(c.id).await.unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.next_due.map(to_millis), Some(to_millis(soon)));
    }
}

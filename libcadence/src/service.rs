//! Service facade for Cadence
//!
//! `CadenceService` is the narrow surface the command line tools use. It owns
//! the database handle and exposes queue and account operations; job
//! execution itself belongs to the [`Scheduler`](crate::scheduler::Scheduler).
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use libcadence::{CadenceService, Config, NewJob};
//!
//! # async fn example() -> libcadence::Result<()> {
//! let service = CadenceService::new(Config::load()?).await?;
//! let job = service.enqueue(NewJob::new(1, "Hello from Cadence", Utc::now())).await?;
//! println!("queued job {}", job.id);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::{CancelOutcome, Database, RescheduleOutcome};
use crate::error::{CadenceError, DriverError, Result, VaultError};
use crate::lock::{Acquire, LockManager};
use crate::platforms::{self, AuthMethod, DriverFactory, LoginCredential};
use crate::session::SessionStore;
use crate::types::{Account, ExecutionAttempt, Job, JobState, NewAccount, NewJob, QueueStats};
use crate::vault::{self, CredentialStore, MasterKey};

#[derive(Clone)]
pub struct CadenceService {
    db: Database,
    config: Config,
}

impl CadenceService {
    /// Open the configured database (running migrations).
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        Ok(Self { db, config })
    }

    pub fn from_parts(db: Database, config: Config) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Add a pending job. Content is checked against the account's platform
    /// limits now unless it will be generated at execution time.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let account = self.require_account(job.account_id).await?;

        if job.prompt.is_none() {
            platforms::rules(account.platform)
                .validate(&job.content, &job.media)
                .map_err(|e| CadenceError::InvalidInput(e.to_string()))?;
        }
        if let Some(at) = job.native_schedule_at {
            if !platforms::rules(account.platform).supports_native_schedule {
                return Err(CadenceError::InvalidInput(format!(
                    "{} does not support native scheduling",
                    account.platform.display_name()
                )));
            }
            if at <= job.target_at {
                return Err(CadenceError::InvalidInput(
                    "native schedule time must be after the job's target time".to_string(),
                ));
            }
        }

        let job = self.db.insert_job(&job).await?;
        tracing::info!(
            job_id = job.id,
            account_id = job.account_id,
            target = %job.target_at.to_rfc3339(),
            "job enqueued"
        );
        Ok(job)
    }

    pub async fn cancel(&self, job_id: i64) -> Result<CancelOutcome> {
        let outcome = self.db.cancel_job(job_id).await?;
        if outcome == CancelOutcome::Cancelled {
            tracing::info!(job_id, "job cancelled");
        }
        Ok(outcome)
    }

    pub async fn reschedule(&self, job_id: i64, target: DateTime<Utc>) -> Result<RescheduleOutcome> {
        self.db.reschedule_job(job_id, target).await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("job {}", job_id)))
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        account_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>> {
        self.db.list_jobs(state, account_id, limit).await
    }

    /// Latest target time among pending jobs of an account, used to space
    /// out `random:` schedules.
    pub async fn last_scheduled(&self, account_id: i64) -> Result<Option<DateTime<Utc>>> {
        let pending = self
            .db
            .list_jobs(Some(JobState::Pending), Some(account_id), None)
            .await?;
        Ok(pending.iter().map(|j| j.target_at).max())
    }

    /// Attempts of one job, oldest first.
    pub async fn history(&self, job_id: i64) -> Result<Vec<ExecutionAttempt>> {
        self.get_job(job_id).await?;
        self.db.attempts_for_job(job_id).await
    }

    pub async fn recent_history(&self, limit: i64) -> Result<Vec<ExecutionAttempt>> {
        self.db.recent_attempts(limit).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.db.queue_stats().await
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn add_account(&self, account: NewAccount) -> Result<Account> {
        if account.label.trim().is_empty() {
            return Err(CadenceError::InvalidInput("account label cannot be empty".to_string()));
        }
        let account = self.db.create_account(&account).await?;
        tracing::info!(account_id = account.id, platform = %account.platform, "account added");
        Ok(account)
    }

    /// Remove an account with its credential and session. Pending jobs are
    /// cancelled; returns how many.
    pub async fn remove_account(&self, account_id: i64) -> Result<u64> {
        let cancelled = self
            .db
            .delete_account(account_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))?;
        tracing::info!(account_id, cancelled, "account removed");
        Ok(cancelled)
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.db.list_accounts().await
    }

    /// Seal and store a new password for the account.
    pub async fn set_credential(&self, account_id: i64, password: &str, key: &MasterKey) -> Result<()> {
        if password.is_empty() {
            return Err(CadenceError::InvalidInput("password cannot be empty".to_string()));
        }
        CredentialStore::new(self.db.clone())
            .replace_for_account(account_id, password, key)
            .await?;
        Ok(())
    }

    /// Forget stored cookies so the next execution logs in again.
    pub async fn clear_session(&self, account_id: i64) -> Result<()> {
        let account = self.require_account(account_id).await?;
        SessionStore::new(self.db.clone())
            .clear(&account.session_ref)
            .await?;
        Ok(())
    }

    /// Check that the account can log in. Holds the account lease for the
    /// duration so it never overlaps a scheduled execution.
    pub async fn test_account(
        &self,
        account_id: i64,
        drivers: &dyn DriverFactory,
        key: Option<Arc<MasterKey>>,
    ) -> Result<AuthMethod> {
        let account = self.require_account(account_id).await?;
        let locks = LockManager::new(self.db.clone(), self.config.scheduler.lease_ttl());

        let lease = match locks.acquire(account.id).await? {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy { expires_at, .. } => {
                return Err(CadenceError::InvalidInput(format!(
                    "account {} is busy until {}",
                    account.id,
                    expires_at.to_rfc3339()
                )))
            }
        };

        let result = self.authenticate(&account, drivers, key).await;
        locks.release(&lease).await?;
        result
    }

    async fn authenticate(
        &self,
        account: &Account,
        drivers: &dyn DriverFactory,
        key: Option<Arc<MasterKey>>,
    ) -> Result<AuthMethod> {
        let sessions = SessionStore::new(self.db.clone());
        let session = sessions.load(&account.session_ref).await?;

        let credential = match (&account.credential_ref, key) {
            (Some(credential_ref), Some(key)) => {
                let sealed = CredentialStore::new(self.db.clone())
                    .load(credential_ref)
                    .await?
                    .ok_or_else(|| CadenceError::NotFound(format!("credential {}", credential_ref)))?;
                let password = tokio::task::spawn_blocking(move || vault::decrypt(&sealed, &key))
                    .await
                    .map_err(|e| VaultError::Encryption(format!("decryption task failed: {}", e)))??;
                Some(LoginCredential {
                    username: account.username.clone(),
                    password,
                })
            }
            _ => None,
        };

        let timeout = self.config.scheduler.driver_timeout();
        let mut driver = drivers.create(account);
        let auth = match tokio::time::timeout(
            timeout,
            driver.authenticate(session.as_ref(), credential.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(format!(
                "authentication exceeded {}",
                humantime::format_duration(timeout)
            ))),
        };
        driver.teardown().await;

        match auth {
            Ok(outcome) => {
                sessions.refresh(&account.session_ref, &outcome.cookies).await?;
                Ok(outcome.method)
            }
            Err(e) => {
                if matches!(e, DriverError::Authentication(_)) {
                    sessions.invalidate(&account.session_ref).await?;
                }
                Err(e.into())
            }
        }
    }

    async fn require_account(&self, account_id: i64) -> Result<Account> {
        self.db
            .get_account(account_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::{MockBackend, MockDriverFactory};
    use crate::types::Platform;
    use tempfile::TempDir;

    async fn setup() -> (CadenceService, Account, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("service.db").to_str().unwrap())
            .await
            .unwrap();
        let service = CadenceService::from_parts(db, Config::default());
        let account = service
            .add_account(NewAccount {
                platform: Platform::Twitter,
                label: "main".to_string(),
                username: "cadence".to_string(),
            })
            .await
            .unwrap();
        (service, account, temp_dir)
    }

    #[tokio::test]
    async fn test_enqueue_and_list() {
        let (service, account, _temp_dir) = setup().await;

        let job = service
            .enqueue(NewJob::new(account.id, "hello", Utc::now()))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);

        let pending = service
            .list_jobs(Some(JobState::Pending), None, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_account() {
        let (service, _account, _temp_dir) = setup().await;
        let err = service
            .enqueue(NewJob::new(999, "hello", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_over_limit_content() {
        let (service, account, _temp_dir) = setup().await;
        let err = service
            .enqueue(NewJob::new(account.id, "x".repeat(281), Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_with_prompt_skips_validation() {
        let (service, account, _temp_dir) = setup().await;
        let job = service
            .enqueue(
                NewJob::new(account.id, "", Utc::now())
                    .with_prompt("summer launch", crate::content::Tone::Engaging),
            )
            .await
            .unwrap();
        assert_eq!(job.prompt.as_deref(), Some("summer launch"));
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let (service, account, _temp_dir) = setup().await;
        let job = service
            .enqueue(NewJob::new(account.id, "hello", Utc::now()))
            .await
            .unwrap();

        assert_eq!(service.cancel(job.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            service.cancel(job.id).await.unwrap(),
            CancelOutcome::NotCancellable(JobState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_last_scheduled_is_latest_pending_target() {
        let (service, account, _temp_dir) = setup().await;
        let later = Utc::now() + chrono::Duration::hours(3);
        service
            .enqueue(NewJob::new(account.id, "a", Utc::now()))
            .await
            .unwrap();
        service
            .enqueue(NewJob::new(account.id, "b", later))
            .await
            .unwrap();

        let last = service.last_scheduled(account.id).await.unwrap().unwrap();
        assert_eq!(last.timestamp_millis(), later.timestamp_millis());
    }

    #[tokio::test]
    async fn test_remove_account_cancels_pending_jobs() {
        let (service, account, _temp_dir) = setup().await;
        let job = service
            .enqueue(NewJob::new(account.id, "hello", Utc::now()))
            .await
            .unwrap();

        assert_eq!(service.remove_account(account.id).await.unwrap(), 1);
        assert_eq!(service.get_job(job.id).await.unwrap().state, JobState::Cancelled);
        assert!(matches!(
            service.remove_account(account.id).await,
            Err(CadenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_account_connectivity_refreshes_session() {
        let (service, account, _temp_dir) = setup().await;
        let sessions = SessionStore::new(service.db().clone());
        sessions
            .refresh(&account.session_ref, &[crate::session::Cookie::new("auth_token", "t")])
            .await
            .unwrap();
        let backend = MockBackend::success();
        let drivers = MockDriverFactory::new(backend.clone());

        let method = service.test_account(account.id, &drivers, None).await.unwrap();

        assert_eq!(method, AuthMethod::Session);
        assert_eq!(backend.close_count(), 1);
        let session = sessions.load(&account.session_ref).await.unwrap().unwrap();
        assert_eq!(session.version, 2);

        let locks = LockManager::new(service.db().clone(), std::time::Duration::from_secs(60));
        assert!(locks.current(account.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_account_connectivity_failure_invalidates_session() {
        let (service, account, _temp_dir) = setup().await;
        let drivers = MockDriverFactory::new(MockBackend::expired_session());

        let err = service.test_account(account.id, &drivers, None).await.unwrap_err();

        assert!(matches!(err, CadenceError::Driver(DriverError::Authentication(_))));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_account_connectivity_logs_in_with_stored_credential() {
        let (service, account, _temp_dir) = setup().await;
        let key = Arc::new(MasterKey::new("correct horse battery").unwrap());
        service
            .set_credential(account.id, "hunter2-password", &key)
            .await
            .unwrap();
        let backend = MockBackend::expired_session();
        let drivers = MockDriverFactory::new(backend.clone());

        let method = service
            .test_account(account.id, &drivers, Some(key))
            .await
            .unwrap();

        assert_eq!(method, AuthMethod::Credential);
        assert_eq!(backend.call_count("login"), 1);
    }

    #[tokio::test]
    async fn test_account_connectivity_wrong_key_is_vault_error() {
        let (service, account, _temp_dir) = setup().await;
        let key = MasterKey::new("correct horse battery").unwrap();
        service
            .set_credential(account.id, "hunter2-password", &key)
            .await
            .unwrap();
        let drivers = MockDriverFactory::new(MockBackend::expired_session());
        let wrong = Arc::new(MasterKey::new("not the right key").unwrap());

        let err = service
            .test_account(account.id, &drivers, Some(wrong))
            .await
            .unwrap_err();

        assert!(matches!(err, CadenceError::Vault(VaultError::DecryptionFailed)));
    }
}

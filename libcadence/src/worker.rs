//! Execution worker pool
//!
//! Runs one job at a time per task, with at most `pool_size` tasks in flight.
//! A worker never writes job state: it performs the execution and sends an
//! [`ExecutionReport`] back to the scheduler, which is the single writer of
//! job, attempt and session rows.
//!
//! Each driver call is bounded by the driver timeout and the whole execution
//! by the execution ceiling. The driver is torn down on every path, and a
//! panicking execution is reported as an `unknown` failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::content::ContentProvider;
use crate::error::DriverError;
use crate::lock::LockHandle;
use crate::platforms::{DriverFactory, DriverResult, LoginCredential, PlatformDriver, PublishOutcome};
use crate::session::{Cookie, SessionStore};
use crate::types::{Account, Job, Platform};
use crate::vault::{self, CredentialStore, MasterKey};

/// Session write requested by an execution.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Authentication succeeded; persist this cookie set
    Refresh(Vec<Cookie>),
    /// The platform rejected the session or credential
    Invalidate,
}

/// Outcome of one execution, sent from a worker to the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: i64,
    pub account_id: i64,
    pub platform: Platform,
    pub session_ref: String,
    /// Attempt ordinal this execution ran as
    pub attempt: u32,
    pub lease: LockHandle,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub result: DriverResult<PublishOutcome>,
    /// Content produced from the job's prompt, if any
    pub generated_content: Option<String>,
    pub session_update: Option<SessionUpdate>,
}

/// Collaborators an execution needs besides the job itself.
#[derive(Clone)]
pub struct WorkerDeps {
    pub drivers: Arc<dyn DriverFactory>,
    pub content: Option<Arc<dyn ContentProvider>>,
    pub master_key: Option<Arc<MasterKey>>,
}

impl WorkerDeps {
    pub fn new(drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            drivers,
            content: None,
            master_key: None,
        }
    }

    pub fn with_content_provider(mut self, content: Arc<dyn ContentProvider>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_master_key(mut self, key: MasterKey) -> Self {
        self.master_key = Some(Arc::new(key));
        self
    }
}

struct WorkerContext {
    deps: WorkerDeps,
    sessions: SessionStore,
    credentials: CredentialStore,
    driver_timeout: Duration,
    execution_timeout: Duration,
}

#[derive(Default)]
struct Execution {
    result: Option<DriverResult<PublishOutcome>>,
    generated_content: Option<String>,
    session_update: Option<SessionUpdate>,
}

/// Bounded pool of execution tasks.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    permits: Arc<Semaphore>,
    size: usize,
    reports: mpsc::UnboundedSender<ExecutionReport>,
}

impl WorkerPool {
    pub fn new(
        deps: WorkerDeps,
        sessions: SessionStore,
        credentials: CredentialStore,
        size: usize,
        driver_timeout: Duration,
        execution_timeout: Duration,
        reports: mpsc::UnboundedSender<ExecutionReport>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                deps,
                sessions,
                credentials,
                driver_timeout,
                execution_timeout,
            }),
            permits: Arc::new(Semaphore::new(size)),
            size,
            reports,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Reserve a slot. `None` when the pool is full.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Run `job` on a reserved slot. The slot is released after the report
    /// has been sent.
    pub fn dispatch(
        &self,
        permit: OwnedSemaphorePermit,
        job: Job,
        account: Account,
        lease: LockHandle,
    ) -> AbortHandle {
        let ctx = self.ctx.clone();
        let reports = self.reports.clone();

        let task = tokio::spawn(async move {
            let _permit = permit;
            let started_at = Utc::now();
            let attempt = job.attempt_count.max(1);

            tracing::info!(
                job_id = job.id,
                account_id = account.id,
                platform = %account.platform,
                attempt,
                "execution started"
            );

            let execution = execute(&ctx, &job, &account).await;

            let result = execution.result.unwrap_or_else(|| {
                Err(DriverError::Unknown("execution produced no result".to_string()))
            });
            match &result {
                Ok(_) => tracing::info!(job_id = job.id, "execution succeeded"),
                Err(e) => tracing::warn!(job_id = job.id, kind = %e.kind(), "execution failed: {}", e),
            }

            let report = ExecutionReport {
                job_id: job.id,
                account_id: account.id,
                platform: account.platform,
                session_ref: account.session_ref.clone(),
                attempt,
                lease,
                started_at,
                ended_at: Utc::now(),
                result,
                generated_content: execution.generated_content,
                session_update: execution.session_update,
            };
            if reports.send(report).is_err() {
                tracing::warn!(job_id = job.id, "scheduler gone, execution report dropped");
            }
        });

        task.abort_handle()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn bounded<T>(
    limit: Duration,
    step: &str,
    fut: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(format!(
            "{} exceeded {}",
            step,
            humantime::format_duration(limit)
        ))),
    }
}

async fn execute(ctx: &WorkerContext, job: &Job, account: &Account) -> Execution {
    let mut driver = ctx.deps.drivers.create(account);
    let mut execution = Execution::default();

    let outcome = AssertUnwindSafe(timeout(
        ctx.execution_timeout,
        run_steps(ctx, driver.as_mut(), job, account, &mut execution),
    ))
    .catch_unwind()
    .await;
    execution.result = Some(match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(DriverError::Timeout(format!(
            "execution exceeded {}",
            humantime::format_duration(ctx.execution_timeout)
        ))),
        Err(panic) => Err(DriverError::Unknown(format!(
            "execution panicked: {}",
            panic_message(panic.as_ref())
        ))),
    });

    if timeout(ctx.driver_timeout, driver.teardown()).await.is_err() {
        tracing::warn!(job_id = job.id, "driver teardown timed out");
    }
    execution
}

async fn run_steps(
    ctx: &WorkerContext,
    driver: &mut dyn PlatformDriver,
    job: &Job,
    account: &Account,
    execution: &mut Execution,
) -> DriverResult<PublishOutcome> {
    let text = match &job.prompt {
        Some(prompt) => {
            let text = generate_content(ctx, job, account.platform, prompt).await?;
            execution.generated_content = Some(text.clone());
            text
        }
        None => job.content.clone(),
    };

    driver.validate(&text, &job.media)?;

    let session = ctx
        .sessions
        .load(&account.session_ref)
        .await
        .map_err(|e| DriverError::Unknown(format!("session store: {}", e)))?;
    let credential = load_credential(ctx, account).await?;

    let auth = bounded(
        ctx.driver_timeout,
        "authentication",
        driver.authenticate(session.as_ref(), credential.as_ref()),
    )
    .await;
    match auth {
        Ok(outcome) => {
            tracing::debug!(job_id = job.id, method = ?outcome.method, "authenticated");
            execution.session_update = Some(SessionUpdate::Refresh(outcome.cookies));
        }
        Err(e) => {
            if matches!(e, DriverError::Authentication(_)) {
                execution.session_update = Some(SessionUpdate::Invalidate);
            }
            return Err(e);
        }
    }

    match job.native_schedule_at {
        Some(at) => {
            bounded(
                ctx.driver_timeout,
                "native schedule",
                driver.schedule_post_native(&text, &job.media, at),
            )
            .await
        }
        None if job.media.is_empty() => {
            bounded(ctx.driver_timeout, "publish", driver.publish_text(&text)).await
        }
        None => {
            bounded(
                ctx.driver_timeout,
                "publish",
                driver.publish_media(&text, &job.media),
            )
            .await
        }
    }
}

async fn generate_content(
    ctx: &WorkerContext,
    job: &Job,
    platform: Platform,
    prompt: &str,
) -> DriverResult<String> {
    let provider = ctx
        .deps
        .content
        .as_ref()
        .ok_or_else(|| DriverError::Provider("no content provider configured".to_string()))?;
    let tone = job.tone.unwrap_or_default();

    let text = bounded(ctx.driver_timeout, "content generation", async {
        provider
            .generate(prompt, platform, tone)
            .await
            .map_err(|e| DriverError::Provider(e.to_string()))
    })
    .await?;

    if text.trim().is_empty() {
        return Err(DriverError::Provider("provider returned empty content".to_string()));
    }
    tracing::debug!(job_id = job.id, "content generated from prompt");
    Ok(text)
}

async fn load_credential(
    ctx: &WorkerContext,
    account: &Account,
) -> DriverResult<Option<LoginCredential>> {
    let Some(credential_ref) = &account.credential_ref else {
        return Ok(None);
    };
    let Some(key) = ctx.deps.master_key.clone() else {
        tracing::warn!(
            account_id = account.id,
            "account has a stored credential but no master key is set"
        );
        return Ok(None);
    };

    let sealed = ctx
        .credentials
        .load(credential_ref)
        .await
        .map_err(|e| DriverError::Unknown(format!("credential store: {}", e)))?
        .ok_or_else(|| {
            DriverError::Authentication(format!("credential {} is missing", credential_ref))
        })?;

    let password = tokio::task::spawn_blocking(move || vault::decrypt(&sealed, &key))
        .await
        .map_err(|e| DriverError::Unknown(format!("decryption task failed: {}", e)))?
        .map_err(|e| DriverError::Authentication(format!("stored credential unusable: {}", e)))?;

    Ok(Some(LoginCredential {
        username: account.username.clone(),
        password,
    }))
}

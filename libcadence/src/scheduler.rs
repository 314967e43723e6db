//! Scheduler core
//!
//! The scheduler is the only writer of job state. Each tick it:
//!
//! 1. applies execution reports that arrived since the last tick,
//! 2. returns orphaned running jobs (lease gone or expired) to pending,
//! 3. dispatches due jobs, earliest first, while the pool has room and the
//!    job's account lease can be taken.
//!
//! A job whose account is busy is simply left pending; it is picked up on a
//! later tick once the lease is released. Workers report back over a channel
//! and the scheduler turns each report into an attempt row, a job transition
//! (via the retry policy) and a lease release.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::Config;
use crate::db::{Completion, Database};
use crate::error::{ErrorKind, Result};
use crate::lock::{Acquire, LockHandle, LockManager};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::SessionStore;
use crate::types::{AttemptOutcome, JobState, NewAttempt};
use crate::vault::CredentialStore;
use crate::worker::{ExecutionReport, SessionUpdate, WorkerDeps, WorkerPool};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reports_applied: usize,
    pub reclaimed: usize,
    pub dispatched: usize,
    /// Due jobs left pending because their account was busy
    pub deferred: usize,
}

struct InFlight {
    lease: LockHandle,
    task: AbortHandle,
}

pub struct Scheduler {
    db: Database,
    locks: LockManager,
    sessions: SessionStore,
    policy: RetryPolicy,
    pool: WorkerPool,
    reports: mpsc::UnboundedReceiver<ExecutionReport>,
    in_flight: HashMap<i64, InFlight>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new(db: Database, config: &Config, deps: WorkerDeps) -> Self {
        let scheduler = &config.scheduler;
        let sessions = SessionStore::new(db.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            deps,
            sessions.clone(),
            CredentialStore::new(db.clone()),
            scheduler.pool_size,
            scheduler.driver_timeout(),
            scheduler.execution_timeout(),
            tx,
        );

        Self {
            locks: LockManager::new(db.clone(), scheduler.lease_ttl()),
            db,
            sessions,
            policy: RetryPolicy::new(config.retry.clone()),
            pool,
            reports: rx,
            in_flight: HashMap::new(),
            poll_interval: scheduler.poll_interval(),
            shutdown_grace: scheduler.shutdown_grace(),
        }
    }

    /// Override the polling interval (sub-second intervals are only reachable
    /// this way).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Startup reconciliation: reclaim running jobs left behind by a process
    /// that died, and drop expired leases.
    pub async fn start(&mut self) -> Result<usize> {
        let now = Utc::now();
        let reclaimed = self.reclaim_orphans(now).await?;
        let reaped = self.locks.reap_expired(now).await?;
        tracing::info!(reclaimed, reaped, "scheduler started");
        Ok(reclaimed)
    }

    /// One scheduling pass.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report).await?;
            summary.reports_applied += 1;
        }

        let now = Utc::now();
        self.renew_leases().await?;
        summary.reclaimed = self.reclaim_orphans(now).await?;

        let available = self.pool.available();
        if available == 0 {
            return Ok(summary);
        }

        // Fetch more than we can run so busy accounts do not starve others.
        let limit = (self.pool.size() * 4).max(available) as i64;
        for job in self.db.due_jobs(now, limit).await? {
            if self.in_flight.contains_key(&job.id) {
                continue;
            }
            let Some(permit) = self.pool.try_reserve() else {
                break;
            };

            let Some(account) = self.db.get_account(job.account_id).await? else {
                tracing::warn!(job_id = job.id, account_id = job.account_id, "account missing, cancelling job");
                self.db.cancel_job(job.id).await?;
                continue;
            };

            let lease = match self.locks.acquire(account.id).await? {
                Acquire::Acquired(lease) => lease,
                Acquire::Busy { holder, .. } => {
                    tracing::debug!(job_id = job.id, account_id = account.id, holder = %holder, "account busy");
                    summary.deferred += 1;
                    continue;
                }
            };

            if !self.db.mark_running(job.id, &lease.holder, now).await? {
                // Cancelled between the due query and now.
                self.locks.release(&lease).await?;
                continue;
            }

            let mut job = job;
            job.state = JobState::Running;
            job.attempt_count = job.attempt_count.max(1);
            job.lease_holder = Some(lease.holder.clone());

            let job_id = job.id;
            let task = self.pool.dispatch(permit, job, account, lease.clone());
            self.in_flight.insert(job_id, InFlight { lease, task });
            summary.dispatched += 1;
        }

        if summary != TickSummary::default() {
            tracing::debug!(?summary, "tick");
        }
        Ok(summary)
    }

    /// Apply one execution report: job transition and attempt row, session
    /// write, lease release. The lease is released even when applying the
    /// report fails.
    pub async fn handle_report(&mut self, report: ExecutionReport) -> Result<()> {
        self.in_flight.remove(&report.job_id);
        let applied = self.apply_report(&report).await;
        let released = self.locks.release(&report.lease).await;
        applied?;
        released
    }

    async fn apply_report(&self, report: &ExecutionReport) -> Result<()> {
        let now = Utc::now();
        let holder = report.lease.holder.as_str();

        if let Some(content) = &report.generated_content {
            let stored = self
                .db
                .store_generated_content(report.job_id, holder, content)
                .await
                .map(|_| ());
            tolerate(stored, report.job_id, "storing generated content")?;
        }

        let attempt = NewAttempt::new(
            report.job_id,
            report.started_at,
            report.ended_at,
            AttemptOutcome::Success,
        );
        let (attempt, completion, force_relogin) = match &report.result {
            Ok(published) => (
                attempt.with_post_url(published.post_url.clone()),
                Completion::Succeeded,
                false,
            ),
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                let (completion, force_relogin) =
                    match self.policy.decide(report.attempt, e, report.platform) {
                        RetryDecision::RetryAfter {
                            delay,
                            force_relogin,
                            needs_attention,
                        } => (
                            Completion::Retry {
                                next_target: retry_target(now, delay),
                                kind,
                                message: message.clone(),
                                needs_attention,
                            },
                            force_relogin,
                        ),
                        RetryDecision::GiveUp => (
                            Completion::Failed {
                                kind,
                                message: message.clone(),
                                needs_attention: kind == ErrorKind::Challenge,
                            },
                            false,
                        ),
                    };
                let attempt = NewAttempt {
                    outcome: AttemptOutcome::Failed(kind),
                    ..attempt
                };
                (attempt.with_detail(message), completion, force_relogin)
            }
        };

        if !self
            .db
            .finish_running(holder, &completion, &attempt, now)
            .await?
        {
            tracing::warn!(job_id = report.job_id, "stale execution report, job no longer held");
            return Ok(());
        }

        match &completion {
            Completion::Succeeded => {
                tracing::info!(job_id = report.job_id, post_url = ?attempt.post_url, "job completed")
            }
            Completion::Retry { next_target, .. } => tracing::info!(
                job_id = report.job_id,
                next_target = %next_target.to_rfc3339(),
                "job rescheduled"
            ),
            Completion::Failed { kind, .. } => {
                tracing::warn!(job_id = report.job_id, kind = %kind, "job failed")
            }
        }

        let session = self.apply_session_update(report, force_relogin).await;
        tolerate(session, report.job_id, "session update")
    }

    async fn apply_session_update(&self, report: &ExecutionReport, force_relogin: bool) -> Result<()> {
        match &report.session_update {
            Some(SessionUpdate::Refresh(cookies)) if !force_relogin => {
                let version = self.sessions.refresh(&report.session_ref, cookies).await?;
                tracing::debug!(account_id = report.account_id, version, "session refreshed");
            }
            Some(SessionUpdate::Invalidate) | Some(SessionUpdate::Refresh(_)) => {
                let version = self.sessions.invalidate(&report.session_ref).await?;
                tracing::info!(account_id = report.account_id, version, "session invalidated");
            }
            None if force_relogin => {
                self.sessions.invalidate(&report.session_ref).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Keep leases of in-flight executions from expiring under them.
    async fn renew_leases(&mut self) -> Result<()> {
        let threshold = Utc::now()
            + chrono::Duration::from_std(self.locks.ttl() / 2)
                .unwrap_or_else(|_| chrono::Duration::zero());
        for (job_id, in_flight) in self.in_flight.iter_mut() {
            if in_flight.lease.expires_at > threshold {
                continue;
            }
            if !self.locks.renew(&mut in_flight.lease).await? {
                tracing::warn!(job_id, "lease lost while execution in flight");
            }
        }
        Ok(())
    }

    async fn reclaim_orphans(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut reclaimed = 0;
        for job in self.db.orphaned_running_jobs(now).await? {
            if self.in_flight.contains_key(&job.id) {
                continue;
            }
            let Some(holder) = job.lease_holder.as_deref() else {
                tracing::warn!(job_id = job.id, "running job without lease holder");
                continue;
            };
            if self.db.interrupt_job(job.id, holder, now).await? {
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempt_count,
                    "reclaimed interrupted execution"
                );
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Run until `shutdown` resolves, then drain.
    ///
    /// Only database corruption stops the loop early; any other error is
    /// logged and the next tick tries again.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::error!("scheduler tick failed: {}", e);
                    }
                }
                Some(report) = self.reports.recv() => {
                    if let Err(e) = self.handle_report(report).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::error!("failed to apply execution report: {}", e);
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Wait up to the grace period for in-flight executions, then abort the
    /// rest and return their jobs to pending.
    pub async fn shutdown(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;

        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.reports.recv()).await {
                Ok(Some(report)) => self.handle_report(report).await?,
                Ok(None) | Err(_) => break,
            }
        }

        let now = Utc::now();
        for (job_id, in_flight) in self.in_flight.drain() {
            in_flight.task.abort();
            if self.db.interrupt_job(job_id, &in_flight.lease.holder, now).await? {
                tracing::warn!(job_id, "execution abandoned at shutdown");
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

/// Secondary writes (generated content, sessions) never block recording the
/// job outcome. Only corrupt state is passed on.
fn tolerate(result: Result<()>, job_id: i64, what: &str) -> Result<()> {
    match result {
        Err(e) if !e.is_fatal() => {
            tracing::warn!(job_id, "{} failed: {}", what, e);
            Ok(())
        }
        other => other,
    }
}

fn retry_target(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

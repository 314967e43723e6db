//! End-to-end scheduling scenarios
//!
//! These drive a real `Scheduler` against an on-disk database with mock
//! automation backends: due pickup, retry, terminal failure, per-account
//! serialization and crash recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libcadence::config::Config;
use libcadence::lock::{Acquire, LockManager};
use libcadence::platforms::backend::BackendFault;
use libcadence::platforms::mock::{MockBackend, MockDriverFactory};
use libcadence::session::{Cookie, SessionStore};
use libcadence::worker::WorkerDeps;
use libcadence::{
    AttemptOutcome, Database, ErrorKind, Job, JobState, NewAccount, NewJob, Platform, Scheduler,
};
use tempfile::TempDir;

struct TestEnv {
    _temp_dir: TempDir,
    db: Database,
    account_id: i64,
}

impl TestEnv {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("cadence.db").to_str().unwrap())
            .await
            .unwrap();
        let account = db
            .create_account(&NewAccount {
                platform: Platform::Twitter,
                label: "main".to_string(),
                username: "cadence".to_string(),
            })
            .await
            .unwrap();
        SessionStore::new(db.clone())
            .refresh(&account.session_ref, &[Cookie::new("auth_token", "stored")])
            .await
            .unwrap();

        Self {
            _temp_dir: temp_dir,
            db,
            account_id: account.id,
        }
    }

    fn scheduler(&self, backend: MockBackend) -> Scheduler {
        let deps = WorkerDeps::new(Arc::new(MockDriverFactory::new(backend)));
        Scheduler::new(self.db.clone(), &Config::default(), deps)
    }

    async fn due_job(&self, content: &str) -> Job {
        self.db
            .insert_job(&NewJob::new(
                self.account_id,
                content,
                Utc::now() - chrono::Duration::seconds(1),
            ))
            .await
            .unwrap()
    }

    async fn job(&self, job_id: i64) -> Job {
        self.db.get_job(job_id).await.unwrap().unwrap()
    }
}

/// Tick until every listed job has left the Running state (and none is
/// still due), or fail after a few seconds.
async fn drive_until_idle(scheduler: &mut Scheduler, env: &TestEnv, job_ids: &[i64]) {
    for _ in 0..500 {
        scheduler.tick().await.unwrap();
        let mut idle = scheduler.in_flight() == 0;
        for id in job_ids {
            let job = env.job(*id).await;
            if job.state == JobState::Running
                || (job.state == JobState::Pending && job.target_at <= Utc::now())
            {
                idle = false;
            }
        }
        if idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs {:?} did not settle", job_ids);
}

#[tokio::test]
async fn test_past_due_job_runs_within_one_poll() {
    let env = TestEnv::new().await;
    let job_id = env.due_job("overdue post").await.id;
    let poll = Duration::from_millis(100);
    let mut scheduler = env.scheduler(MockBackend::with_delay(Duration::from_millis(300)))
        .with_poll_interval(poll);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let db = env.db.clone();
    let observer = async move {
        let started = tokio::time::Instant::now();
        let mut running_after = None;
        while started.elapsed() < Duration::from_secs(5) {
            let job = db.get_job(job_id).await.unwrap().unwrap();
            if job.state == JobState::Running && running_after.is_none() {
                running_after = Some(started.elapsed());
            }
            if job.state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = stop_tx.send(());
        running_after
    };

    let (run_result, running_after) = tokio::join!(
        scheduler.run(async {
            let _ = stop_rx.await;
        }),
        observer
    );
    run_result.unwrap();

    let running_after = running_after.expect("job never observed running");
    assert!(running_after <= poll + Duration::from_millis(150));
    let job = env.job(job_id).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test]
async fn test_network_error_reschedules_with_backoff() {
    let env = TestEnv::new().await;
    let job = env.due_job("flaky network").await;
    let backend = MockBackend::compose_faults(vec![BackendFault::Network(
        "connection reset".to_string(),
    )]);
    let mut scheduler = env.scheduler(backend);

    let before = Utc::now();
    drive_until_idle(&mut scheduler, &env, &[job.id]).await;

    let job = env.job(job.id).await;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.last_error_kind, Some(ErrorKind::Network));

    let base_delay = chrono::Duration::seconds(Config::default().retry.base_delay_secs as i64);
    assert!(job.target_at >= before + base_delay);
    assert!(job.target_at <= Utc::now() + base_delay);

    let attempts = env.db.attempts_for_job(job.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed(ErrorKind::Network));
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let env = TestEnv::new().await;
    let job = env.due_job("never gets through").await;
    let backend = MockBackend::compose_faults(
        (0..5)
            .map(|_| BackendFault::Network("connection reset".to_string()))
            .collect(),
    );
    let mut config = Config::default();
    config.retry.base_delay_secs = 0;
    let max_attempts = config.retry.max_attempts;
    let deps = WorkerDeps::new(Arc::new(MockDriverFactory::new(backend.clone())));
    let mut scheduler = Scheduler::new(env.db.clone(), &config, deps);

    drive_until_idle(&mut scheduler, &env, &[job.id]).await;

    let failed = env.job(job.id).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempt_count, max_attempts);
    assert_eq!(failed.last_error_kind, Some(ErrorKind::Network));
    let attempts = env.db.attempts_for_job(job.id).await.unwrap();
    assert_eq!(attempts.len() as u32, max_attempts);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::Failed(ErrorKind::Network)));

    for _ in 0..3 {
        scheduler.tick().await.unwrap();
    }
    let after = env.job(job.id).await;
    assert_eq!(after.state, JobState::Failed);
    assert_eq!(after.attempt_count, max_attempts);
    assert_eq!(after.updated_at, failed.updated_at);
    assert_eq!(backend.call_count("compose") as u32, max_attempts);
}

#[tokio::test]
async fn test_content_too_long_fails_immediately() {
    let env = TestEnv::new().await;
    // Inserted directly: the queue front end would have rejected it.
    let job = env.due_job(&"x".repeat(300)).await;
    let backend = MockBackend::success();
    let mut scheduler = env.scheduler(backend.clone());

    drive_until_idle(&mut scheduler, &env, &[job.id]).await;

    let job = env.job(job.id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error_kind, Some(ErrorKind::ContentTooLong));
    assert_eq!(backend.call_count("compose"), 0);
    assert_eq!(backend.call_count("launch"), 0);

    // Terminal: further ticks leave it alone.
    scheduler.tick().await.unwrap();
    assert_eq!(env.db.attempts_for_job(job.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_account_jobs_never_overlap() {
    let env = TestEnv::new().await;
    let first = env.due_job("first").await;
    let second = env.due_job("second").await;
    let third = env.due_job("third").await;
    let mut scheduler = env.scheduler(MockBackend::with_delay(Duration::from_millis(150)));

    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.deferred, 2);
    assert_eq!(env.job(second.id).await.state, JobState::Pending);

    drive_until_idle(&mut scheduler, &env, &[first.id, second.id, third.id]).await;

    let mut intervals = Vec::new();
    for id in [first.id, second.id, third.id] {
        assert_eq!(env.job(id).await.state, JobState::Completed);
        let attempts = env.db.attempts_for_job(id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        intervals.push((attempts[0].started_at, attempts[0].ended_at));
    }
    intervals.sort();
    for pair in intervals.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "attempts overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_different_accounts_run_concurrently() {
    let env = TestEnv::new().await;
    let other = env
        .db
        .create_account(&NewAccount {
            platform: Platform::Twitter,
            label: "second".to_string(),
            username: "other".to_string(),
        })
        .await
        .unwrap();
    SessionStore::new(env.db.clone())
        .refresh(&other.session_ref, &[Cookie::new("auth_token", "other")])
        .await
        .unwrap();

    let first = env.due_job("mine").await;
    let second = env
        .db
        .insert_job(&NewJob::new(other.id, "theirs", Utc::now()))
        .await
        .unwrap();
    let mut scheduler = env.scheduler(MockBackend::with_delay(Duration::from_millis(100)));

    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.dispatched, 2);

    drive_until_idle(&mut scheduler, &env, &[first.id, second.id]).await;
    assert_eq!(env.job(first.id).await.state, JobState::Completed);
    assert_eq!(env.job(second.id).await.state, JobState::Completed);
}

#[tokio::test]
async fn test_restart_recovers_job_with_expired_lease() {
    let env = TestEnv::new().await;
    let job = env.due_job("interrupted").await;

    // A previous process took the lease and marked the job running, then died.
    let dead_locks = LockManager::new(env.db.clone(), Duration::from_millis(50));
    let Acquire::Acquired(lease) = dead_locks.acquire(env.account_id).await.unwrap() else {
        panic!("lease should be free");
    };
    assert!(env
        .db
        .mark_running(job.id, &lease.holder, Utc::now())
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let backend = MockBackend::success();
    let mut scheduler = env.scheduler(backend.clone());
    assert_eq!(scheduler.start().await.unwrap(), 1);

    let recovered = env.job(job.id).await;
    assert_eq!(recovered.state, JobState::Pending);
    assert_eq!(recovered.attempt_count, 1);
    assert!(recovered.lease_holder.is_none());

    drive_until_idle(&mut scheduler, &env, &[job.id]).await;
    let finished = env.job(job.id).await;
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.attempt_count, 1);

    let outcomes: Vec<_> = env
        .db
        .attempts_for_job(job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Interrupted, AttemptOutcome::Success]
    );
    assert_eq!(backend.composed(), vec!["interrupted".to_string()]);
}

#[tokio::test]
async fn test_live_lease_is_not_reclaimed() {
    let env = TestEnv::new().await;
    let job = env.due_job("still running elsewhere").await;

    let other_locks = LockManager::new(env.db.clone(), Duration::from_secs(600));
    let Acquire::Acquired(lease) = other_locks.acquire(env.account_id).await.unwrap() else {
        panic!("lease should be free");
    };
    env.db
        .mark_running(job.id, &lease.holder, Utc::now())
        .await
        .unwrap();

    let mut scheduler = env.scheduler(MockBackend::success());
    assert_eq!(scheduler.start().await.unwrap(), 0);
    assert_eq!(env.job(job.id).await.state, JobState::Running);
}

#[tokio::test]
async fn test_challenge_flags_job_for_attention() {
    let env = TestEnv::new().await;
    let job = env.due_job("blocked").await;
    let backend = MockBackend::success();
    backend.set_markers(vec!["https://x.com/account/access".to_string()]);
    let mut scheduler = env.scheduler(backend);

    let before = Utc::now();
    drive_until_idle(&mut scheduler, &env, &[job.id]).await;

    let job = env.job(job.id).await;
    assert_eq!(job.state, JobState::Pending);
    assert!(job.needs_attention);
    assert_eq!(job.last_error_kind, Some(ErrorKind::Challenge));
    let cooldown =
        chrono::Duration::seconds(Config::default().retry.challenge_cooldown_secs as i64);
    assert!(job.target_at >= before + cooldown);
}

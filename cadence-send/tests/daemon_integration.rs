//! Integration tests for the cadence-send daemon

use assert_cmd::Command;
use chrono::Utc;
use libcadence::session::{Cookie, SessionStore};
use libcadence::{Database, ErrorKind, JobState, NewAccount, NewJob, Platform};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Stand-in browser helper speaking the JSON-lines protocol.
const HELPER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"op":"compose"'*) echo '{"ok":true,"result":{"post_url":"https://x.com/cadence/status/42"}}' ;;
    *'"op":"restore_session"'*) echo '{"ok":true,"result":{"logged_in":true}}' ;;
    *'"op":"export_cookies"'*) echo '{"ok":true,"result":{"cookies":[{"name":"auth_token","value":"fresh"}]}}' ;;
    *'"op":"page_markers"'*) echo '{"ok":true,"result":{"markers":["https://x.com/home"]}}' ;;
    *) echo '{"ok":true,"result":null}' ;;
  esac
done
"#;

fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Write a config (optionally wired to the helper script) and open the database.
async fn setup_test_env(with_helper: bool) -> (TempDir, String, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("cadence.db");

    let mut config_content = format!(
        r#"
[database]
path = "{}"

[scheduler]
poll_interval_secs = 1
shutdown_grace_secs = 20
"#,
        escape_path_for_toml(&db_path.to_string_lossy())
    );
    if with_helper {
        config_content.push_str(&format!(
            "\n[automation]\ncommand = \"sh\"\nargs = [\"-c\", '''{}''', \"helper\"]\nheadless = true\n",
            HELPER_SCRIPT
        ));
    }
    fs::write(&config_path, config_content).unwrap();

    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    (temp_dir, config_path.to_string_lossy().to_string(), db)
}

/// Account with a valid stored session and one due job.
async fn seed_due_job(db: &Database) -> i64 {
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

    db.insert_job(&NewJob::new(
        account.id,
        "Scheduled hello",
        Utc::now() - chrono::Duration::seconds(10),
    ))
    .await
    .unwrap()
    .id
}

#[cfg(unix)]
#[tokio::test]
async fn test_once_publishes_due_job() {
    let (_temp_dir, config_path, db) = setup_test_env(true).await;
    let job_id = seed_due_job(&db).await;

    Command::cargo_bin("cadence-send")
        .unwrap()
        .env("CADENCE_CONFIG", &config_path)
        .env_remove("CADENCE_MASTER_KEY")
        .arg("--once")
        .assert()
        .success();

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);

    let attempts = db.attempts_for_job(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        attempts[0].post_url.as_deref(),
        Some("https://x.com/cadence/status/42")
    );
}

#[tokio::test]
async fn test_once_without_automation_reschedules() {
    let (_temp_dir, config_path, db) = setup_test_env(false).await;
    let job_id = seed_due_job(&db).await;

    Command::cargo_bin("cadence-send")
        .unwrap()
        .env("CADENCE_CONFIG", &config_path)
        .arg("--once")
        .assert()
        .success();

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.last_error_kind, Some(ErrorKind::Unknown));
    assert!(job.target_at > Utc::now());
}

#[tokio::test]
async fn test_future_jobs_are_left_alone() {
    let (_temp_dir, config_path, db) = setup_test_env(false).await;
    let account = db
        .create_account(&NewAccount {
            platform: Platform::LinkedIn,
            label: "work".to_string(),
            username: "me@example.com".to_string(),
        })
        .await
        .unwrap();
    let job = db
        .insert_job(&NewJob::new(
            account.id,
            "Later",
            Utc::now() + chrono::Duration::hours(2),
        ))
        .await
        .unwrap();

    Command::cargo_bin("cadence-send")
        .unwrap()
        .env("CADENCE_CONFIG", &config_path)
        .arg("--once")
        .assert()
        .success();

    let job = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt_count, 0);
}

#[test]
fn test_invalid_config_exits_with_code_2() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        format!(
            "[database]\npath = \"{}\"\n\n[scheduler]\npool_size = 0\n",
            escape_path_for_toml(&temp_dir.path().join("x.db").to_string_lossy())
        ),
    )
    .unwrap();

    Command::cargo_bin("cadence-send")
        .unwrap()
        .env("CADENCE_CONFIG", config_path.to_str().unwrap())
        .arg("--once")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("pool_size"));
}

#[test]
fn test_missing_explicit_config_fails() {
    Command::cargo_bin("cadence-send")
        .unwrap()
        .env("CADENCE_CONFIG", "/nonexistent/cadence/config.toml")
        .arg("--once")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_help_mentions_signals() {
    Command::cargo_bin("cadence-send")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SIGTERM"));
}

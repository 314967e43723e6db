//! Folder watcher
//!
//! Polls a directory and turns each new media file into a pending job for the
//! configured account. A file is identified by (name, modification time), so
//! replacing a file with new content schedules it again while restarts do not.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::WatchConfig;
use crate::db::Database;
use crate::error::{CadenceError, Result};
use crate::platforms::is_supported_media;
use crate::types::{Job, NewJob};

/// Files modified more recently than this are assumed to still be copying.
const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(2);

pub struct FolderWatcher {
    db: Database,
    config: WatchConfig,
    settle: Duration,
}

impl FolderWatcher {
    pub fn new(db: Database, config: WatchConfig) -> Self {
        Self {
            db,
            config,
            settle: DEFAULT_SETTLE_TIME,
        }
    }

    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Check that the watched directory and target account exist.
    pub async fn verify(&self) -> Result<()> {
        let path = self.config.expanded_path();
        if !path.is_dir() {
            return Err(CadenceError::InvalidInput(format!(
                "watch path is not a directory: {}",
                path.display()
            )));
        }
        if self.db.get_account(self.config.account_id).await?.is_none() {
            return Err(CadenceError::NotFound(format!(
                "watch account {}",
                self.config.account_id
            )));
        }
        Ok(())
    }

    /// One pass over the directory. Returns the jobs created.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let dir = self.config.expanded_path();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            CadenceError::InvalidInput(format!("cannot read {}: {}", dir.display(), e))
        })?;

        let settle = chrono::Duration::from_std(self.settle).unwrap_or_else(|_| chrono::Duration::zero());
        let delay = chrono::Duration::from_std(self.config.default_delay())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut created = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("error reading {}: {}", dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            if !is_supported_media(&path) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| {
                if m.is_file() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => DateTime::<Utc>::from(modified),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            if modified > now - settle {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!("skipping non UTF-8 file name: {}", path.display());
                continue;
            };

            let job = self.job_for(&path, now + delay);
            if let Some(job) = self.db.enqueue_watched_file(file_name, modified, &job).await? {
                tracing::info!(
                    job_id = job.id,
                    account_id = job.account_id,
                    file = file_name,
                    target = %job.target_at.to_rfc3339(),
                    "scheduled watched file"
                );
                created.push(job);
            }
        }
        Ok(created)
    }

    fn job_for(&self, path: &Path, target: DateTime<Utc>) -> NewJob {
        let title = placeholder_title(path);
        let job = NewJob::new(self.config.account_id, title.clone(), target)
            .with_media(vec![path.to_path_buf()]);

        if self.config.auto_generate {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            job.with_prompt(
                format!(
                    "Write a social media post to accompany the media file '{}' titled '{}'.",
                    name, title
                ),
                self.config.tone,
            )
        } else {
            job
        }
    }

    /// Scan every poll interval until `shutdown` resolves. Scan failures are
    /// logged; only database corruption ends the loop.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(path = %self.config.expanded_path().display(), "watching folder");
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.scan(Utc::now()).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::error!("folder scan failed: {}", e);
                    }
                }
            }
        }
    }
}

/// "summer_trip-01.jpg" → "summer trip 01"
fn placeholder_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .replace(['_', '-'], " ")
}

//! Core types for Cadence

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::Tone;
use crate::error::ErrorKind;

/// The closed set of platforms the engine can publish to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Twitter,
    LinkedIn,
    YouTube,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Facebook,
        Platform::Twitter,
        Platform::LinkedIn,
        Platform::YouTube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
            Platform::LinkedIn => "linkedin",
            Platform::YouTube => "youtube",
        }
    }

    /// Human-facing name used in logs and CLI output
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Facebook => "Facebook",
            Platform::Twitter => "Twitter/X",
            Platform::LinkedIn => "LinkedIn",
            Platform::YouTube => "YouTube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "facebook" | "fb" => Ok(Platform::Facebook),
            "twitter" | "x" => Ok(Platform::Twitter),
            "linkedin" => Ok(Platform::LinkedIn),
            "youtube" | "yt" => Ok(Platform::YouTube),
            _ => Err(format!(
                "Unknown platform '{}'. Valid options: facebook, twitter, linkedin, youtube",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub platform: Platform,
    pub label: String,
    /// Login identity (email, handle, phone)
    pub username: String,
    /// Key into the credential table; `None` until a password is stored
    pub credential_ref: Option<String>,
    /// Key into the session table
    pub session_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub platform: Platform,
    pub label: String,
    pub username: String,
}

/// Lifecycle of a publishing job.
///
/// ```text
/// Pending ──▶ Running ──▶ Completed
///    │  ◀────────┘ │
///    ▼             ▼
/// Cancelled      Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Pending)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub account_id: i64,
    pub content: String,
    pub media: Vec<PathBuf>,
    pub target_at: DateTime<Utc>,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub needs_attention: bool,
    /// When set, the content is generated from this prompt at execution time
    pub prompt: Option<String>,
    pub tone: Option<Tone>,
    /// Ask the platform to publish natively at this instant
    pub native_schedule_at: Option<DateTime<Utc>>,
    pub lease_holder: Option<String>,
    pub running_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job request before it is persisted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub account_id: i64,
    pub content: String,
    pub media: Vec<PathBuf>,
    pub target_at: DateTime<Utc>,
    pub prompt: Option<String>,
    pub tone: Option<Tone>,
    pub native_schedule_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(account_id: i64, content: impl Into<String>, target_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            content: content.into(),
            media: Vec::new(),
            target_at,
            prompt: None,
            tone: None,
            native_schedule_at: None,
        }
    }

    pub fn with_media(mut self, media: Vec<PathBuf>) -> Self {
        self.media = media;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>, tone: Tone) -> Self {
        self.prompt = Some(prompt.into());
        self.tone = Some(tone);
        self
    }

    pub fn with_native_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.native_schedule_at = Some(at);
        self
    }
}

/// How an execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// The process stopped (crash or shutdown) while the job was running
    Interrupted,
    Failed(ErrorKind),
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Interrupted => "interrupted",
            AttemptOutcome::Failed(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "interrupted" => Ok(AttemptOutcome::Interrupted),
            other => other.parse::<ErrorKind>().map(AttemptOutcome::Failed),
        }
    }
}

/// Append-only record of one execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: i64,
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub post_url: Option<String>,
}

/// An attempt row before it is persisted.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub post_url: Option<String>,
}

impl NewAttempt {
    pub fn new(
        job_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            job_id,
            started_at,
            ended_at,
            outcome,
            detail: None,
            post_url: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_post_url(mut self, post_url: Option<String>) -> Self {
        self.post_url = post_url;
        self
    }
}

/// Counts of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub needs_attention: i64,
    pub next_due: Option<DateTime<Utc>>,
}

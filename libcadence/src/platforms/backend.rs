//! Automation backends
//!
//! A backend is the thing that actually drives a browser: it can open the
//! platform, restore cookies, fill the login form, compose a post and report
//! what the current page looks like. Backends know nothing about retry
//! semantics; they report raw [`BackendFault`]s and the driver classifies them.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::AutomationConfig;
use crate::session::Cookie;
use crate::types::Platform;

/// What to publish.
#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    pub text: &'a str,
    pub media: &'a [PathBuf],
    /// Use the platform's own scheduler instead of publishing now
    pub schedule_at: Option<DateTime<Utc>>,
}

/// Unclassified failure reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendFault {
    /// Connection refused, DNS failure, page load failure
    Network(String),
    /// The backend gave up waiting for the page
    Timeout(String),
    /// The login form rejected the credentials
    LoginRejected(String),
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// The platform refused the post itself (duplicate, policy, media)
    Rejected(String),
    /// An expected element never appeared
    ElementMissing(String),
    /// The browser or helper process died
    Crashed(String),
    Other(String),
}

impl std::fmt::Display for BackendFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendFault::Network(m) => write!(f, "network: {}", m),
            BackendFault::Timeout(m) => write!(f, "timeout: {}", m),
            BackendFault::LoginRejected(m) => write!(f, "login rejected: {}", m),
            BackendFault::RateLimited { message, .. } => write!(f, "rate limited: {}", message),
            BackendFault::Rejected(m) => write!(f, "rejected: {}", m),
            BackendFault::ElementMissing(m) => write!(f, "element missing: {}", m),
            BackendFault::Crashed(m) => write!(f, "crashed: {}", m),
            BackendFault::Other(m) => write!(f, "{}", m),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendFault>;

#[async_trait]
pub trait AutomationBackend: Send {
    /// Start a browser context for `platform`.
    async fn launch(&mut self, platform: Platform) -> BackendResult<()>;

    /// Load cookies and report whether the platform now shows a logged-in page.
    async fn restore_session(&mut self, cookies: &[Cookie]) -> BackendResult<bool>;

    /// Fill and submit the login form.
    async fn login(&mut self, username: &str, password: &str) -> BackendResult<()>;

    /// Cookies of the current browser context.
    async fn export_cookies(&mut self) -> BackendResult<Vec<Cookie>>;

    /// Compose and submit a post. Returns the post URL when the platform shows one.
    async fn compose(&mut self, request: &ComposeRequest<'_>) -> BackendResult<Option<String>>;

    /// Structural facts about the current page: URL, title, notable element
    /// ids. Used for challenge detection.
    async fn page_markers(&mut self) -> Vec<String>;

    /// Release the browser. Must be safe to call more than once.
    async fn close(&mut self);
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    fault: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

impl HelperResponse {
    fn into_result(self) -> BackendResult<Value> {
        if self.ok {
            return Ok(self.result);
        }
        let message = self.message.unwrap_or_else(|| "helper reported failure".to_string());
        Err(match self.fault.as_deref() {
            Some("network") => BackendFault::Network(message),
            Some("timeout") => BackendFault::Timeout(message),
            Some("login_rejected") => BackendFault::LoginRejected(message),
            Some("rate_limited") => BackendFault::RateLimited {
                retry_after: self.retry_after_secs.map(Duration::from_secs),
                message,
            },
            Some("rejected") => BackendFault::Rejected(message),
            Some("element_missing") => BackendFault::ElementMissing(message),
            Some("crashed") => BackendFault::Crashed(message),
            _ => BackendFault::Other(message),
        })
    }
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Drives an external automation helper over JSON lines.
///
/// Each request is one JSON object on the helper's stdin
/// (`{"op": "compose", ...}`); each reply is one line on its stdout
/// (`{"ok": true, "result": ...}` or `{"ok": false, "fault": "network",
/// "message": "..."}`). The helper is spawned by `launch` and killed by
/// `close`.
pub struct CommandBackend {
    config: AutomationConfig,
    process: Option<HelperProcess>,
}

impl CommandBackend {
    pub fn new(config: AutomationConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    async fn call(&mut self, request: Value) -> BackendResult<Value> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| BackendFault::Crashed("automation helper not running".to_string()))?;

        let mut line = request.to_string();
        line.push('\n');
        process
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackendFault::Crashed(format!("write to helper: {}", e)))?;
        process
            .stdin
            .flush()
            .await
            .map_err(|e| BackendFault::Crashed(format!("flush helper stdin: {}", e)))?;

        let reply = process
            .stdout
            .next_line()
            .await
            .map_err(|e| BackendFault::Crashed(format!("read from helper: {}", e)))?
            .ok_or_else(|| BackendFault::Crashed("automation helper exited".to_string()))?;

        let response: HelperResponse = serde_json::from_str(&reply)
            .map_err(|e| BackendFault::Other(format!("malformed helper reply: {}", e)))?;
        response.into_result()
    }
}

#[async_trait]
impl AutomationBackend for CommandBackend {
    async fn launch(&mut self, platform: Platform) -> BackendResult<()> {
        if self.process.is_none() {
            let program = self.config.command.as_deref().ok_or_else(|| {
                BackendFault::Crashed("no automation command configured".to_string())
            })?;

            let mut command = Command::new(program);
            command
                .args(&self.config.args)
                .arg("--platform")
                .arg(platform.as_str())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            if self.config.headless {
                command.arg("--headless");
            }

            let mut child = command
                .spawn()
                .map_err(|e| BackendFault::Crashed(format!("spawn {}: {}", program, e)))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| BackendFault::Crashed("helper stdin unavailable".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BackendFault::Crashed("helper stdout unavailable".to_string()))?;

            self.process = Some(HelperProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            });
        }

        self.call(json!({ "op": "launch", "platform": platform.as_str() }))
            .await
            .map(|_| ())
    }

    async fn restore_session(&mut self, cookies: &[Cookie]) -> BackendResult<bool> {
        let result = self
            .call(json!({ "op": "restore_session", "cookies": cookies }))
            .await?;
        Ok(result["logged_in"].as_bool().unwrap_or(false))
    }

    async fn login(&mut self, username: &str, password: &str) -> BackendResult<()> {
        self.call(json!({ "op": "login", "username": username, "password": password }))
            .await
            .map(|_| ())
    }

    async fn export_cookies(&mut self) -> BackendResult<Vec<Cookie>> {
        let result = self.call(json!({ "op": "export_cookies" })).await?;
        serde_json::from_value(result["cookies"].clone())
            .map_err(|e| BackendFault::Other(format!("malformed cookies: {}", e)))
    }

    async fn compose(&mut self, request: &ComposeRequest<'_>) -> BackendResult<Option<String>> {
        let result = self
            .call(json!({
                "op": "compose",
                "text": request.text,
                "media": request.media,
                "schedule_at": request.schedule_at.map(|at| at.to_rfc3339()),
            }))
            .await?;
        Ok(result["post_url"].as_str().map(str::to_string))
    }

    async fn page_markers(&mut self) -> Vec<String> {
        match self.call(json!({ "op": "page_markers" })).await {
            Ok(result) => result["markers"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!("page markers unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn close(&mut self) {
        if self.process.is_none() {
            return;
        }
        if let Err(e) = self.call(json!({ "op": "close" })).await {
            tracing::debug!("helper close request failed: {}", e);
        }
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.kill().await {
                tracing::debug!("helper already exited: {}", e);
            }
        }
    }
}

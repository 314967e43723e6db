//! Platform drivers
//!
//! A driver turns "publish this on that account" into automation steps and
//! classifies everything that goes wrong into a [`DriverError`]. There is a
//! single driver type, [`BrowserDriver`], tagged by the closed [`Platform`]
//! enum; per-platform behavior is data ([`PlatformRules`]) kept in one module
//! per platform. Adding a platform means one enum variant and one rules module.
//!
//! A driver instance serves exactly one execution:
//!
//! ```text
//! Idle ──authenticate──▶ Authenticated ──publish──▶ Published
//!   │                        │
//!   └──── failure ───────────┴──▶ Failed / Challenged
//!
//! any state ──teardown──▶ TornDown
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use libcadence::platforms::{BrowserDriver, PlatformDriver, mock::MockBackend};
//! use libcadence::types::Platform;
//!
//! # async fn example() {
//! let backend = MockBackend::success();
//! let mut driver = BrowserDriver::new(Platform::Twitter, Box::new(backend.clone()));
//! driver.authenticate(None, None).await.ok();
//! driver.teardown().await;
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::config::AutomationConfig;
use crate::error::DriverError;
use crate::session::{Cookie, Session};
use crate::types::{Account, Platform};

pub mod backend;
pub mod facebook;
pub mod linkedin;
pub mod twitter;
pub mod youtube;

// Mock backend is available for all builds (not just tests) to support integration tests
pub mod mock;

use backend::{AutomationBackend, BackendFault, CommandBackend, ComposeRequest};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

/// Static per-platform behavior.
#[derive(Debug)]
pub struct PlatformRules {
    pub platform: Platform,
    pub home_url: &'static str,
    pub char_limit: usize,
    pub max_media: usize,
    pub max_hashtags: usize,
    pub requires_media: bool,
    pub supports_native_schedule: bool,
    /// Cookie whose presence proves a logged-in session
    pub session_cookie: &'static str,
    /// Substrings of page markers (URL, title, element ids) that indicate a
    /// CAPTCHA or verification checkpoint
    pub challenge_markers: &'static [&'static str],
}

pub fn rules(platform: Platform) -> &'static PlatformRules {
    match platform {
        Platform::Facebook => &facebook::RULES,
        Platform::Twitter => &twitter::RULES,
        Platform::LinkedIn => &linkedin::RULES,
        Platform::YouTube => &youtube::RULES,
    }
}

pub fn is_supported_media(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str()) || VIDEO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

impl PlatformRules {
    /// Check content against platform limits without touching the network.
    pub fn validate(&self, text: &str, media: &[PathBuf]) -> DriverResult<()> {
        if text.trim().is_empty() && media.is_empty() {
            return Err(DriverError::InvalidContent(
                "post has neither text nor media".to_string(),
            ));
        }

        let length = text.chars().count();
        if length > self.char_limit {
            return Err(DriverError::ContentTooLong {
                limit: self.char_limit,
                actual: length,
            });
        }

        let hashtags = text
            .split_whitespace()
            .filter(|w| w.starts_with('#') && w.len() > 1)
            .count();
        if hashtags > self.max_hashtags {
            return Err(DriverError::InvalidContent(format!(
                "{} hashtags exceeds {}'s limit of {}",
                hashtags,
                self.platform.display_name(),
                self.max_hashtags
            )));
        }

        if self.requires_media && media.is_empty() {
            return Err(DriverError::InvalidContent(format!(
                "{} posts require media",
                self.platform.display_name()
            )));
        }

        if media.len() > self.max_media {
            return Err(DriverError::InvalidContent(format!(
                "{} media items exceeds {}'s limit of {}",
                media.len(),
                self.platform.display_name(),
                self.max_media
            )));
        }

        for path in media {
            if !is_supported_media(path) {
                return Err(DriverError::InvalidContent(format!(
                    "unsupported media type: {}",
                    path.display()
                )));
            }
            if !path.is_file() {
                return Err(DriverError::InvalidContent(format!(
                    "media file not found: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

/// Password login material handed to a driver for one execution.
pub struct LoginCredential {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for LoginCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Stored cookies were accepted
    Session,
    /// The login form was used
    Credential,
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub method: AuthMethod,
    /// Cookie set to persist as the refreshed session
    pub cookies: Vec<Cookie>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub post_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Authenticated,
    Published,
    Challenged,
    Failed,
    TornDown,
}

/// Capability contract every platform driver fulfils.
///
/// Errors returned from these methods are already classified; callers never
/// see raw automation faults.
#[async_trait]
pub trait PlatformDriver: Send {
    fn platform(&self) -> Platform;

    fn state(&self) -> DriverState;

    /// Platform content checks, performed before any automation step.
    fn validate(&self, text: &str, media: &[PathBuf]) -> DriverResult<()> {
        rules(self.platform()).validate(text, media)
    }

    /// Log in, preferring the stored session and falling back to the
    /// credential. Returns the cookie set to persist.
    async fn authenticate(
        &mut self,
        session: Option<&Session>,
        credential: Option<&LoginCredential>,
    ) -> DriverResult<AuthOutcome>;

    async fn publish_text(&mut self, text: &str) -> DriverResult<PublishOutcome>;

    async fn publish_media(&mut self, text: &str, media: &[PathBuf]) -> DriverResult<PublishOutcome>;

    /// Hand the post to the platform's own scheduler.
    async fn schedule_post_native(
        &mut self,
        text: &str,
        media: &[PathBuf],
        at: DateTime<Utc>,
    ) -> DriverResult<PublishOutcome>;

    /// Release automation resources. Idempotent and infallible.
    async fn teardown(&mut self);
}

/// Driver backed by an [`AutomationBackend`].
pub struct BrowserDriver {
    rules: &'static PlatformRules,
    backend: Box<dyn AutomationBackend>,
    state: DriverState,
    launched: bool,
}

impl BrowserDriver {
    pub fn new(platform: Platform, backend: Box<dyn AutomationBackend>) -> Self {
        Self {
            rules: rules(platform),
            backend,
            state: DriverState::Idle,
            launched: false,
        }
    }

    fn ensure_not_torn_down(&self) -> DriverResult<()> {
        if self.state == DriverState::TornDown {
            return Err(DriverError::Unknown("driver already torn down".to_string()));
        }
        Ok(())
    }

    fn ensure_authenticated(&self) -> DriverResult<()> {
        self.ensure_not_torn_down()?;
        if self.state != DriverState::Authenticated {
            return Err(DriverError::Unknown(format!(
                "cannot publish from state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// The first configured challenge marker present on the current page.
    async fn detect_challenge(&mut self) -> Option<String> {
        let markers = self.backend.page_markers().await;
        self.rules
            .challenge_markers
            .iter()
            .find(|needle| {
                let needle = needle.to_lowercase();
                markers.iter().any(|m| m.to_lowercase().contains(&needle))
            })
            .map(|m| m.to_string())
    }

    /// Record a terminal failure state for `error` and hand it back.
    fn fail(&mut self, error: DriverError) -> DriverError {
        self.state = match error {
            DriverError::ChallengeDetected { .. } => DriverState::Challenged,
            _ => DriverState::Failed,
        };
        error
    }

    /// Translate a backend fault. Anything but a plain network or timeout
    /// fault is first checked against the challenge markers.
    async fn classify(&mut self, fault: BackendFault) -> DriverError {
        let transport = matches!(fault, BackendFault::Network(_) | BackendFault::Timeout(_));
        if !transport {
            if let Some(marker) = self.detect_challenge().await {
                return self.fail(DriverError::ChallengeDetected { marker });
            }
        }

        let error = match fault {
            BackendFault::Network(m) => DriverError::Network(m),
            BackendFault::Timeout(m) => DriverError::Timeout(m),
            BackendFault::LoginRejected(m) => DriverError::Authentication(m),
            BackendFault::RateLimited {
                retry_after,
                message,
            } => DriverError::RateLimited {
                retry_after,
                message,
            },
            BackendFault::Rejected(m) => DriverError::InvalidContent(m),
            BackendFault::ElementMissing(m) => {
                DriverError::Unknown(format!("element missing: {}", m))
            }
            BackendFault::Crashed(m) => DriverError::Unknown(format!("automation crashed: {}", m)),
            BackendFault::Other(m) => DriverError::Unknown(m),
        };
        self.fail(error)
    }

    async fn launch(&mut self) -> DriverResult<()> {
        if self.launched {
            return Ok(());
        }
        match self.backend.launch(self.rules.platform).await {
            Ok(()) => {
                self.launched = true;
                Ok(())
            }
            Err(fault) => Err(self.classify(fault).await),
        }
    }

    /// After a step that looked successful, make sure we did not land on a
    /// checkpoint page.
    async fn check_landing(&mut self) -> DriverResult<()> {
        if let Some(marker) = self.detect_challenge().await {
            return Err(self.fail(DriverError::ChallengeDetected { marker }));
        }
        Ok(())
    }

    async fn logged_in_cookies(&mut self) -> DriverResult<Vec<Cookie>> {
        let cookies = match self.backend.export_cookies().await {
            Ok(cookies) => cookies,
            Err(fault) => return Err(self.classify(fault).await),
        };
        if !cookies.iter().any(|c| c.name == self.rules.session_cookie) {
            return Err(self.fail(DriverError::Authentication(format!(
                "no {} session cookie after login",
                self.rules.session_cookie
            ))));
        }
        Ok(cookies)
    }

    async fn compose(&mut self, request: ComposeRequest<'_>) -> DriverResult<PublishOutcome> {
        match self.backend.compose(&request).await {
            Ok(post_url) => {
                self.check_landing().await?;
                self.state = DriverState::Published;
                Ok(PublishOutcome { post_url })
            }
            Err(fault) => Err(self.classify(fault).await),
        }
    }
}

#[async_trait]
impl PlatformDriver for BrowserDriver {
    fn platform(&self) -> Platform {
        self.rules.platform
    }

    fn state(&self) -> DriverState {
        self.state
    }

    async fn authenticate(
        &mut self,
        session: Option<&Session>,
        credential: Option<&LoginCredential>,
    ) -> DriverResult<AuthOutcome> {
        self.ensure_not_torn_down()?;
        self.launch().await?;

        if let Some(session) = session.filter(|s| s.is_usable(Utc::now())) {
            match self.backend.restore_session(&session.cookies).await {
                Ok(true) => {
                    self.check_landing().await?;
                    let cookies = self.logged_in_cookies().await?;
                    self.state = DriverState::Authenticated;
                    return Ok(AuthOutcome {
                        method: AuthMethod::Session,
                        cookies,
                    });
                }
                Ok(false) => {
                    tracing::debug!(platform = %self.rules.platform, "stored session rejected");
                }
                Err(fault @ (BackendFault::Network(_) | BackendFault::Timeout(_))) => {
                    return Err(self.classify(fault).await);
                }
                Err(fault) => {
                    tracing::debug!(platform = %self.rules.platform, "session restore failed: {}", fault);
                }
            }
        }

        let Some(credential) = credential else {
            return Err(self.fail(DriverError::Authentication(
                "no valid session and no stored credential".to_string(),
            )));
        };

        if let Err(fault) = self
            .backend
            .login(&credential.username, credential.password.as_str())
            .await
        {
            return Err(self.classify(fault).await);
        }

        self.check_landing().await?;
        let cookies = self.logged_in_cookies().await?;
        self.state = DriverState::Authenticated;
        Ok(AuthOutcome {
            method: AuthMethod::Credential,
            cookies,
        })
    }

    async fn publish_text(&mut self, text: &str) -> DriverResult<PublishOutcome> {
        self.ensure_authenticated()?;
        self.validate(text, &[])?;
        self.compose(ComposeRequest {
            text,
            media: &[],
            schedule_at: None,
        })
        .await
    }

    async fn publish_media(&mut self, text: &str, media: &[PathBuf]) -> DriverResult<PublishOutcome> {
        self.ensure_authenticated()?;
        if media.is_empty() {
            return Err(DriverError::InvalidContent(
                "publish_media requires at least one media file".to_string(),
            ));
        }
        self.validate(text, media)?;
        self.compose(ComposeRequest {
            text,
            media,
            schedule_at: None,
        })
        .await
    }

    async fn schedule_post_native(
        &mut self,
        text: &str,
        media: &[PathBuf],
        at: DateTime<Utc>,
    ) -> DriverResult<PublishOutcome> {
        self.ensure_authenticated()?;
        if !self.rules.supports_native_schedule {
            return Err(DriverError::InvalidContent(format!(
                "{} does not support native scheduling",
                self.rules.platform.display_name()
            )));
        }
        if at <= Utc::now() {
            return Err(DriverError::InvalidContent(format!(
                "native schedule time {} is in the past",
                at.to_rfc3339()
            )));
        }
        self.validate(text, media)?;
        self.compose(ComposeRequest {
            text,
            media,
            schedule_at: Some(at),
        })
        .await
    }

    async fn teardown(&mut self) {
        if self.state == DriverState::TornDown {
            return;
        }
        if self.launched {
            self.backend.close().await;
        }
        self.state = DriverState::TornDown;
    }
}

/// Produces a fresh driver for each execution.
pub trait DriverFactory: Send + Sync {
    fn create(&self, account: &Account) -> Box<dyn PlatformDriver>;
}

/// Drivers that run the configured external automation helper.
#[derive(Debug, Clone)]
pub struct CommandDriverFactory {
    automation: AutomationConfig,
}

impl CommandDriverFactory {
    pub fn new(automation: AutomationConfig) -> Self {
        Self { automation }
    }
}

impl DriverFactory for CommandDriverFactory {
    fn create(&self, account: &Account) -> Box<dyn PlatformDriver> {
        Box::new(BrowserDriver::new(
            account.platform,
            Box::new(CommandBackend::new(self.automation.clone())),
        ))
    }
}

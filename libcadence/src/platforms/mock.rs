//! Mock automation backend for testing
//!
//! [`MockBackend`] simulates a browser helper: scripted faults, page markers
//! and latency, plus a log of every call so tests can assert on what the
//! driver did. Clones share state, so a test can keep one handle while the
//! driver owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::backend::{AutomationBackend, BackendFault, BackendResult, ComposeRequest};
use super::{rules, BrowserDriver, DriverFactory, PlatformDriver};
use crate::session::Cookie;
use crate::types::{Account, Platform};

#[derive(Debug, Default)]
struct MockState {
    platform: Option<Platform>,
    session_valid: bool,
    login_fault: Option<BackendFault>,
    /// Consumed one per compose call; compose succeeds once empty
    compose_faults: VecDeque<BackendFault>,
    markers: Vec<String>,
    compose_delay: Duration,
    panic_on_compose: bool,
    calls: Vec<String>,
    composed: Vec<String>,
    scheduled: Vec<String>,
    close_count: usize,
    next_post_id: u64,
}

/// Scriptable stand-in for a browser.
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    fn with_state(state: MockState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Everything works and stored sessions are accepted.
    pub fn success() -> Self {
        Self::with_state(MockState {
            session_valid: true,
            ..MockState::default()
        })
    }

    /// Stored sessions are rejected; the login form still works.
    pub fn expired_session() -> Self {
        Self::with_state(MockState::default())
    }

    pub fn login_rejected() -> Self {
        Self::with_state(MockState {
            login_fault: Some(BackendFault::LoginRejected("incorrect password".to_string())),
            ..MockState::default()
        })
    }

    /// Every page shows `marker`.
    pub fn challenge(marker: &str) -> Self {
        Self::with_state(MockState {
            markers: vec![marker.to_string()],
            ..MockState::default()
        })
    }

    /// Compose fails with each fault in turn, then succeeds.
    pub fn compose_faults(faults: Vec<BackendFault>) -> Self {
        Self::with_state(MockState {
            session_valid: true,
            compose_faults: faults.into(),
            ..MockState::default()
        })
    }

    /// Compose takes `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self::with_state(MockState {
            session_valid: true,
            compose_delay: delay,
            ..MockState::default()
        })
    }

    /// Compose panics, simulating a crashed driver task.
    pub fn panicking() -> Self {
        Self::with_state(MockState {
            session_valid: true,
            panic_on_compose: true,
            ..MockState::default()
        })
    }

    pub fn set_markers(&self, markers: Vec<String>) {
        lock(&self.state).markers = markers;
    }

    pub fn push_compose_fault(&self, fault: BackendFault) {
        lock(&self.state).compose_faults.push_back(fault);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == op).count()
    }

    /// Text of every successfully composed post, in order.
    pub fn composed(&self) -> Vec<String> {
        lock(&self.state).composed.clone()
    }

    /// RFC 3339 times of every natively scheduled post.
    pub fn scheduled(&self) -> Vec<String> {
        lock(&self.state).scheduled.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    fn record(&self, op: &str) {
        lock(&self.state).calls.push(op.to_string());
    }
}

#[async_trait]
impl AutomationBackend for MockBackend {
    async fn launch(&mut self, platform: Platform) -> BackendResult<()> {
        self.record("launch");
        lock(&self.state).platform = Some(platform);
        Ok(())
    }

    async fn restore_session(&mut self, _cookies: &[Cookie]) -> BackendResult<bool> {
        self.record("restore_session");
        Ok(lock(&self.state).session_valid)
    }

    async fn login(&mut self, _username: &str, _password: &str) -> BackendResult<()> {
        self.record("login");
        match lock(&self.state).login_fault.clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    async fn export_cookies(&mut self) -> BackendResult<Vec<Cookie>> {
        self.record("export_cookies");
        let platform = lock(&self.state).platform.unwrap_or(Platform::Twitter);
        Ok(vec![
            Cookie::new(rules(platform).session_cookie, "mock-session"),
            Cookie::new("lang", "en"),
        ])
    }

    async fn compose(&mut self, request: &ComposeRequest<'_>) -> BackendResult<Option<String>> {
        self.record("compose");
        let (delay, panics) = {
            let state = lock(&self.state);
            (state.compose_delay, state.panic_on_compose)
        };
        if panics {
            panic!("mock automation crashed");
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(fault) = state.compose_faults.pop_front() {
            return Err(fault);
        }

        state.next_post_id += 1;
        state.composed.push(request.text.to_string());
        if let Some(at) = request.schedule_at {
            state.scheduled.push(at.to_rfc3339());
        }
        let platform = state.platform.unwrap_or(Platform::Twitter);
        Ok(Some(format!(
            "https://mock.invalid/{}/posts/{}",
            platform.as_str(),
            state.next_post_id
        )))
    }

    async fn page_markers(&mut self) -> Vec<String> {
        lock(&self.state).markers.clone()
    }

    async fn close(&mut self) {
        self.record("close");
        lock(&self.state).close_count += 1;
    }
}

/// Builds [`BrowserDriver`]s over mock backends, optionally one per account.
#[derive(Debug, Clone)]
pub struct MockDriverFactory {
    default: MockBackend,
    per_account: HashMap<i64, MockBackend>,
}

impl MockDriverFactory {
    pub fn new(default: MockBackend) -> Self {
        Self {
            default,
            per_account: HashMap::new(),
        }
    }

    pub fn with_account(mut self, account_id: i64, backend: MockBackend) -> Self {
        self.per_account.insert(account_id, backend);
        self
    }
}

impl DriverFactory for MockDriverFactory {
    fn create(&self, account: &Account) -> Box<dyn PlatformDriver> {
        let backend = self
            .per_account
            .get(&account.id)
            .unwrap_or(&self.default)
            .clone();
        Box::new(BrowserDriver::new(account.platform, Box::new(backend)))
    }
}

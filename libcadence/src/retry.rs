//! Retry policy
//!
//! A pure mapping from (attempt ordinal, classified error, platform) to the
//! next action. No clock, no I/O: the scheduler adds the returned delay to
//! "now" itself.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::DriverError;
use crate::types::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter {
        delay: Duration,
        /// Discard the stored session and log in with the credential
        force_relogin: bool,
        /// Surface the job to the user (challenge pages need a human)
        needs_attention: bool,
    },
    GiveUp,
}

impl RetryDecision {
    fn after(delay: Duration) -> Self {
        RetryDecision::RetryAfter {
            delay,
            force_relogin: false,
            needs_attention: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `base * multiplier^(attempt - 1)`, capped at `max_delay_secs`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.config.base_delay_secs as f64 * self.config.multiplier.powi(exponent);
        let capped = secs.min(self.config.max_delay_secs as f64).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Decide what happens after attempt number `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: &DriverError, platform: Platform) -> RetryDecision {
        if attempt >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }

        let backoff = self.backoff(attempt);
        match error {
            DriverError::ContentTooLong { .. } | DriverError::InvalidContent(_) => {
                RetryDecision::GiveUp
            }
            DriverError::Network(_) | DriverError::Timeout(_) | DriverError::Provider(_) => {
                RetryDecision::after(backoff)
            }
            DriverError::Authentication(_) => RetryDecision::RetryAfter {
                delay: backoff,
                force_relogin: true,
                needs_attention: false,
            },
            DriverError::ChallengeDetected { .. } => RetryDecision::RetryAfter {
                delay: backoff.max(Duration::from_secs(self.config.challenge_cooldown_secs)),
                force_relogin: false,
                needs_attention: true,
            },
            DriverError::RateLimited { retry_after, .. } => {
                let delay = retry_after
                    .or_else(|| self.config.rate_limit_cooldown(platform))
                    .unwrap_or(backoff);
                RetryDecision::after(delay)
            }
            DriverError::Unknown(_) => {
                if attempt >= self.config.unknown_max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::after(backoff)
                }
            }
        }
    }
}

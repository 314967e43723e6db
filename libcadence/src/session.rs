//! Session store
//!
//! A session is the cookie set that lets a driver skip the login form. It is
//! versioned: every refresh, invalidation or clear bumps `version`, so a
//! reader can tell whether the session changed underneath it. The scheduler
//! writes a session only while it still holds the account's lease.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::{from_millis, to_millis, Database};
use crate::error::{CadenceError, DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Valid,
    Invalidated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Valid => "valid",
            SessionState::Invalidated => "invalidated",
        }
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "valid" => Ok(SessionState::Valid),
            "invalidated" => Ok(SessionState::Invalidated),
            other => Err(format!("unknown session state '{}'", other)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            secure: true,
            http_only: true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|exp| exp <= now.timestamp())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("expires", &self.expires)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_ref: String,
    pub account_id: i64,
    pub version: i64,
    pub state: SessionState,
    pub cookies: Vec<Cookie>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Valid and holding at least one unexpired cookie.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Valid && self.cookies.iter().any(|c| !c.is_expired(now))
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }
}

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn load(&self, session_ref: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT ref, account_id, version, state, cookies, refreshed_at FROM sessions WHERE ref = ?",
        )
        .bind(session_ref)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let state: String = r.try_get("state").map_err(DbError::SqlxError)?;
        let cookies: String = r.try_get("cookies").map_err(DbError::SqlxError)?;
        let refreshed_at: Option<i64> = r.try_get("refreshed_at").map_err(DbError::SqlxError)?;

        Ok(Some(Session {
            session_ref: r.try_get("ref").map_err(DbError::SqlxError)?,
            account_id: r.try_get("account_id").map_err(DbError::SqlxError)?,
            version: r.try_get("version").map_err(DbError::SqlxError)?,
            state: SessionState::from_str(&state).map_err(DbError::Corrupt)?,
            cookies: serde_json::from_str(&cookies)
                .map_err(|e| DbError::Corrupt(format!("session cookies: {}", e)))?,
            refreshed_at: refreshed_at.map(from_millis).transpose()?,
        }))
    }

    /// Overwrite the cookie set after a successful login and mark the
    /// session valid. Returns the new version.
    pub async fn refresh(&self, session_ref: &str, cookies: &[Cookie]) -> Result<i64> {
        let cookies = serde_json::to_string(cookies)
            .map_err(|e| CadenceError::InvalidInput(format!("cookies: {}", e)))?;

        self.update(
            session_ref,
            "UPDATE sessions SET cookies = ?, state = 'valid', version = version + 1, refreshed_at = ? \
             WHERE ref = ? RETURNING version",
            Some(cookies),
        )
        .await
    }

    /// Mark the session unusable (authentication failed with it).
    /// Cookies are kept for diagnosis but will not be offered again.
    pub async fn invalidate(&self, session_ref: &str) -> Result<i64> {
        self.update(
            session_ref,
            "UPDATE sessions SET state = 'invalidated', version = version + 1, refreshed_at = ? \
             WHERE ref = ? RETURNING version",
            None,
        )
        .await
    }

    /// Drop all cookies (explicit logout).
    pub async fn clear(&self, session_ref: &str) -> Result<i64> {
        self.update(
            session_ref,
            "UPDATE sessions SET cookies = '[]', state = 'invalidated', version = version + 1, refreshed_at = ? \
             WHERE ref = ? RETURNING version",
            None,
        )
        .await
    }

    async fn update(&self, session_ref: &str, sql: &str, cookies: Option<String>) -> Result<i64> {
        let mut query = sqlx::query(sql);
        if let Some(cookies) = cookies {
            query = query.bind(cookies);
        }

        let row = query
            .bind(to_millis(Utc::now()))
            .bind(session_ref)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        match row {
            Some(r) => Ok(r.try_get("version").map_err(DbError::SqlxError)?),
            None => Err(CadenceError::NotFound(format!("session {}", session_ref))),
        }
    }
}

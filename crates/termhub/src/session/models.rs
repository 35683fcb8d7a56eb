//! Session data models.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::isolation::IsolationHandle;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, not used yet.
    Created,
    /// Touched at least once.
    Active,
    /// Idle past the timeout. Expired sessions leave the registry.
    Expired,
    /// Replacement for an expired session, not used yet.
    Renewing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Active => write!(f, "active"),
            SessionState::Expired => write!(f, "expired"),
            SessionState::Renewing => write!(f, "renewing"),
        }
    }
}

/// A user's session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub handle: IsolationHandle,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: SessionState,
    /// Session this one replaced, when created by renewal.
    pub renewed_from: Option<String>,
}

impl Session {
    pub(crate) fn new(user_id: String, handle: IsolationHandle) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            handle,
            created_at: now,
            last_active_at: now,
            state: SessionState::Created,
            renewed_from: None,
        }
    }

    /// Time since the session was last touched.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at).to_std().unwrap_or_default()
    }

    pub fn is_idle_past(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.idle_for(now) > timeout
    }

    /// Time left before the session expires if untouched.
    pub fn expires_in(&self, timeout: Duration, now: DateTime<Utc>) -> Duration {
        timeout.saturating_sub(self.idle_for(now))
    }
}

/// Notification that a session expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub session_id: String,
    pub user_id: String,
}

//! PSI session coordination: a three-state machine with role-gated
//! transitions, per-access expiry and multi-joiner support.
//!
//! Sessions live in process-local memory only; a restart may discard them.
//! Every failed precondition leaves the session untouched — the single
//! exception is expiry, which removes the entry on detection.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use num_bigint::BigUint;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::group;
use crate::error::ApiError;

pub const SESSION_TIMEOUT_MINUTES: i64 = 30;

/// Lifecycle is monotone: Initiated → Joined → Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initiated,
    Joined,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initiated => "INITIATED",
            SessionStatus::Joined => "JOINED",
            SessionStatus::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

struct Session {
    initiator_user_id: String,
    initiator_values: Vec<BigUint>,
    responses: HashMap<String, Vec<BigUint>>,
    intersections: HashMap<String, u64>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("{0}")]
    InvalidStatus(SessionStatus),
    #[error("initiator cannot join their own session")]
    InitiatorCannotJoin,
    #[error("user has already joined this session")]
    AlreadyJoined,
    #[error("access allowed only for initiator")]
    InitiatorOnly,
    #[error("user '{0}' has not joined this session")]
    UnknownJoiner(String),
    #[error("{0}")]
    InvalidValues(String),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => ApiError::NotFound("Session not found".into()),
            SessionError::Expired => ApiError::Gone,
            SessionError::InvalidStatus(s) => ApiError::State(s.to_string()),
            SessionError::InitiatorCannotJoin => {
                ApiError::Forbidden("initiator cannot join their own session".into())
            }
            SessionError::InitiatorOnly => {
                ApiError::Forbidden("access allowed only for initiator".into())
            }
            other => ApiError::Validation(other.to_string()),
        }
    }
}

/// What a read returns, depending on lifecycle position.
pub enum SessionValues {
    /// Initiated: the initiator's blinded values, readable by any
    /// authenticated user (the joiner needs them for step 2).
    Initiator(Vec<BigUint>),
    /// Joined/Completed: per-joiner responses, initiator only.
    Responses(HashMap<String, Vec<BigUint>>),
}

pub struct SessionManager {
    sessions: DashMap<Uuid, Session>,
    timeout: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_timeout(Duration::minutes(SESSION_TIMEOUT_MINUTES))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { sessions: DashMap::new(), timeout }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_expired(&self, session: &Session) -> bool {
        Utc::now() - session.created_at > self.timeout
    }

    fn validate_values(values: &[BigUint]) -> Result<(), SessionError> {
        if values.is_empty() {
            return Err(SessionError::InvalidValues("empty value list".into()));
        }
        if values.iter().any(|v| !group::is_group_element(v)) {
            return Err(SessionError::InvalidValues(
                "group element out of range [1, p-1]".into(),
            ));
        }
        Ok(())
    }

    /// Create a session holding the initiator's blinded values.
    pub fn initiate(&self, user_id: &str, values: Vec<BigUint>) -> Result<Uuid, SessionError> {
        Self::validate_values(&values)?;
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, Session {
            initiator_user_id: user_id.to_string(),
            initiator_values: values,
            responses: HashMap::new(),
            intersections: HashMap::new(),
            status: SessionStatus::Initiated,
            created_at: Utc::now(),
        });
        Ok(session_id)
    }

    /// Store a joiner's response. Allowed while Initiated or Joined; each
    /// joiner at most once; never the initiator; response must carry the
    /// joiner's items plus all re-blinded initiator items (so strictly more
    /// elements than the initiator submitted).
    pub fn join(
        &self,
        session_id: Uuid,
        user_id: &str,
        values: Vec<BigUint>,
    ) -> Result<SessionStatus, SessionError> {
        let mut entry = match self.sessions.entry(session_id) {
            Entry::Occupied(e) => e,
            Entry::Vacant(_) => return Err(SessionError::NotFound),
        };
        if self.is_expired(entry.get()) {
            entry.remove();
            return Err(SessionError::Expired);
        }

        let session = entry.get_mut();
        if session.status == SessionStatus::Completed {
            return Err(SessionError::InvalidStatus(SessionStatus::Completed));
        }
        if session.initiator_user_id == user_id {
            return Err(SessionError::InitiatorCannotJoin);
        }
        if session.responses.contains_key(user_id) {
            return Err(SessionError::AlreadyJoined);
        }
        Self::validate_values(&values)?;
        if values.len() <= session.initiator_values.len() {
            return Err(SessionError::InvalidValues(format!(
                "response must carry more than {} elements",
                session.initiator_values.len()
            )));
        }

        session.responses.insert(user_id.to_string(), values);
        session.status = SessionStatus::Joined;
        Ok(session.status)
    }

    /// Read the values relevant to the session's current state, enforcing the
    /// per-state access rules.
    pub fn values(
        &self,
        session_id: Uuid,
        user_id: &str,
    ) -> Result<(SessionStatus, SessionValues), SessionError> {
        let entry = match self.sessions.entry(session_id) {
            Entry::Occupied(e) => e,
            Entry::Vacant(_) => return Err(SessionError::NotFound),
        };
        if self.is_expired(entry.get()) {
            entry.remove();
            return Err(SessionError::Expired);
        }

        let session = entry.get();
        match session.status {
            SessionStatus::Initiated => Ok((
                session.status,
                SessionValues::Initiator(session.initiator_values.clone()),
            )),
            SessionStatus::Joined | SessionStatus::Completed => {
                if session.initiator_user_id != user_id {
                    return Err(SessionError::InitiatorOnly);
                }
                Ok((session.status, SessionValues::Responses(session.responses.clone())))
            }
        }
    }

    /// Record |A ∩ B_other| as reported by the initiator; completes the
    /// session.
    pub fn record_intersection(
        &self,
        session_id: Uuid,
        user_id: &str,
        other_user_id: &str,
        len_intersection: u64,
    ) -> Result<(), SessionError> {
        let mut entry = match self.sessions.entry(session_id) {
            Entry::Occupied(e) => e,
            Entry::Vacant(_) => return Err(SessionError::NotFound),
        };
        if self.is_expired(entry.get()) {
            entry.remove();
            return Err(SessionError::Expired);
        }

        let session = entry.get_mut();
        if session.initiator_user_id != user_id {
            return Err(SessionError::InitiatorOnly);
        }
        if session.status != SessionStatus::Joined {
            return Err(SessionError::InvalidStatus(session.status));
        }
        if !session.responses.contains_key(other_user_id) {
            return Err(SessionError::UnknownJoiner(other_user_id.to_string()));
        }

        session.intersections.insert(other_user_id.to_string(), len_intersection);
        session.status = SessionStatus::Completed;
        Ok(())
    }

    /// The intersection size recorded for `user_id`, or -1 when absent.
    pub fn intersection_for(&self, session_id: Uuid, user_id: &str) -> Result<i64, SessionError> {
        let entry = match self.sessions.entry(session_id) {
            Entry::Occupied(e) => e,
            Entry::Vacant(_) => return Err(SessionError::NotFound),
        };
        if self.is_expired(entry.get()) {
            entry.remove();
            return Err(SessionError::Expired);
        }
        Ok(entry
            .get()
            .intersections
            .get(user_id)
            .map(|&n| n as i64)
            .unwrap_or(-1))
    }

    /// Opportunistic sweep; correctness never depends on it because every
    /// access re-checks expiry. Returns the number of sessions removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.sessions.len();
        let now = Utc::now();
        self.sessions.retain(|_, s| now - s.created_at <= self.timeout);
        before - self.sessions.len()
    }

    /// Test hook: age a session by `minutes` without waiting.
    #[cfg(test)]
    pub fn backdate(&self, session_id: Uuid, minutes: i64) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.created_at = session.created_at - Duration::minutes(minutes);
        }
    }
}

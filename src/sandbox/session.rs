//! Reflection sessions layered on top of the single sandbox environment.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::persist;
use crate::reflection::ChangeOperation;

/// Status of a reflection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Promoted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Promoted => "promoted",
        };
        f.write_str(s)
    }
}

/// Preview of one modification made during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationPreview {
    pub path: String,
    pub operation: ChangeOperation,
    pub reason: String,
    /// Iteration that applied the change (0 for seed changes).
    pub iteration: u32,
}

/// One exploratory goal inside the running sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionSession {
    pub id: String,
    pub purpose: String,
    pub modifications: Vec<ModificationPreview>,
    pub iterations: u32,
    pub status: SessionStatus,
    pub final_commit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCompletion {
    pub status: SessionStatus,
    pub iterations: u32,
    pub final_commit: Option<String>,
}

/// Bounded in-memory session map with an optional JSONL trail.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<VecDeque<ReflectionSession>>,
    capacity: usize,
    trail: Option<PathBuf>,
}

impl SessionRegistry {
    /// Creates a registry keeping at most `capacity` sessions.
    pub fn new(capacity: usize, trail: Option<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            trail,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ReflectionSession>> {
        // Poisoning only happens if a holder panicked; the data is still usable.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a new active session.
    pub fn start(&self, purpose: &str) -> ReflectionSession {
        let session = ReflectionSession {
            id: uuid::Uuid::new_v4().to_string(),
            purpose: purpose.to_string(),
            modifications: Vec::new(),
            iterations: 0,
            status: SessionStatus::Active,
            final_commit: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        let mut sessions = self.lock();
        if let Some(active) = sessions.iter().find(|s| s.status == SessionStatus::Active) {
            tracing::warn!(
                active = %active.id,
                "starting a session while another is still active"
            );
        }
        while sessions.len() >= self.capacity {
            let evict = sessions
                .iter()
                .position(|s| s.status != SessionStatus::Active)
                .unwrap_or(0);
            sessions.remove(evict);
        }
        sessions.push_back(session.clone());
        session
    }

    /// Appends a modification preview to an active session.
    pub fn record_modification(&self, session_id: &str, preview: ModificationPreview) -> Result<()> {
        let mut sessions = self.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.iterations = session.iterations.max(preview.iteration);
        session.modifications.push(preview);
        Ok(())
    }

    /// Closes a session and appends it to the trail.
    pub fn complete(&self, session_id: &str, completion: SessionCompletion) -> Result<ReflectionSession> {
        let session = {
            let mut sessions = self.lock();
            let session = sessions
                .iter_mut()
                .find(|s| s.id == session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            session.status = completion.status;
            session.iterations = completion.iterations;
            session.final_commit = completion.final_commit;
            session.completed_at = Some(Utc::now());
            session.clone()
        };

        if let Some(trail) = &self.trail {
            if let Err(e) = persist::append_jsonl(trail, &session) {
                tracing::warn!(error = %e, session_id = %session.id, "failed to append session trail");
            }
        }
        Ok(session)
    }

    /// Looks up a session.
    pub fn get(&self, session_id: &str) -> Option<ReflectionSession> {
        self.lock().iter().find(|s| s.id == session_id).cloned()
    }

    /// Returns the most recent active session.
    pub fn active(&self) -> Option<ReflectionSession> {
        self.lock()
            .iter()
            .rev()
            .find(|s| s.status == SessionStatus::Active)
            .cloned()
    }

    /// Returns all retained sessions, oldest first.
    pub fn list(&self) -> Vec<ReflectionSession> {
        self.lock().iter().cloned().collect()
    }

    /// Forgets every session.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

//! Persistent sandbox state for reattaching after a restart.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist;

/// Lifecycle status of the sandbox environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status of the optional dev server inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevServerStatus {
    pub running: bool,
    pub port: u16,
    pub command: String,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// The singleton sandbox record.
///
/// Saved to `<state_dir>/sandbox-state.json` after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxState {
    /// Identity of this sandbox incarnation.
    pub id: String,
    /// Container id, once created.
    pub container_id: Option<String>,
    /// Persistent workspace volume.
    pub volume_name: Option<String>,
    pub status: SandboxStatus,
    /// Branch checked out inside the sandbox.
    pub branch: Option<String>,
    /// Commit the branch was created from.
    pub base_commit: Option<String>,
    /// Most recent commit made in the sandbox.
    pub last_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
    /// Commands executed inside the environment.
    pub execution_count: u64,
    #[serde(default)]
    pub dev_server: Option<DevServerStatus>,
    pub last_error: Option<String>,
}

impl Default for SandboxState {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxState {
    /// Creates the initial state of a never-started sandbox.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: None,
            volume_name: None,
            status: SandboxStatus::Stopped,
            branch: None,
            base_commit: None,
            last_commit: None,
            created_at: now,
            started_at: None,
            last_used_at: now,
            execution_count: 0,
            dev_server: None,
            last_error: None,
        }
    }

    /// Returns true if the environment is up.
    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running && self.container_id.is_some()
    }

    /// Updates the last-used timestamp.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

/// Reads and writes the sandbox state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state. A corrupted document is an error.
    pub fn load(&self) -> Result<Option<SandboxState>> {
        persist::read_json(&self.path)
    }

    /// Persists the state.
    pub fn save(&self, state: &SandboxState) -> Result<()> {
        persist::write_json_atomic(&self.path, state)
    }
}

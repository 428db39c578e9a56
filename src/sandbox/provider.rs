//! The sandbox surface consumed by the reflection loop and the handoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parser::{TestResult, TypeCheckResult};

use super::session::{ModificationPreview, ReflectionSession, SessionCompletion};

/// How a file changed in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Maps a `git diff --name-status` letter.
    pub fn from_git_status(status: &str) -> Option<Self> {
        match status.chars().next()? {
            'A' | 'C' => Some(ChangeKind::Added),
            'M' | 'T' => Some(ChangeKind::Modified),
            'D' => Some(ChangeKind::Deleted),
            _ => None,
        }
    }
}

/// A file changed by a commit, relative to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub kind: ChangeKind,
    pub additions: u32,
    pub deletions: u32,
    /// Git reported no line counts for the file.
    #[serde(default)]
    pub binary: bool,
}

/// An isolated environment holding a clone of the workspace.
///
/// Paths are relative to the workspace root inside the sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identity of the sandbox.
    async fn sandbox_id(&self) -> String;

    /// Starts the environment if it is not already running.
    async fn ensure_running(&self) -> Result<()>;

    /// Opens a session for an exploratory goal.
    async fn start_session(&self, purpose: &str) -> Result<ReflectionSession>;

    /// Records a modification against a session.
    async fn record_modification(&self, session_id: &str, preview: ModificationPreview)
        -> Result<()>;

    /// Closes a session.
    async fn complete_session(
        &self,
        session_id: &str,
        completion: SessionCompletion,
    ) -> Result<ReflectionSession>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Runs the configured static check.
    async fn type_check(&self) -> Result<TypeCheckResult>;

    /// Runs the configured tests, optionally filtered.
    async fn run_tests(&self, pattern: Option<&str>) -> Result<TestResult>;

    /// Stages everything and commits (empty commits allowed). Returns the hash.
    async fn commit(&self, message: &str) -> Result<String>;

    /// Unified diff of the working tree against the branch's base commit.
    async fn get_diff(&self, path: Option<&str>) -> Result<String>;

    /// Files changed by `commit` relative to its parent.
    async fn changed_files(&self, commit: &str) -> Result<Vec<ChangedPath>>;

    /// Unified diff of `commit` against its parent, restricted to `paths`.
    async fn commit_diff(&self, commit: &str, paths: &[String]) -> Result<String>;

    /// Content of `path` as of `commit`.
    async fn show_file(&self, commit: &str, path: &str) -> Result<String>;
}

//! Handoff artifacts and the records attached to them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::TestResult;
use crate::sandbox::ChangeKind;

use super::mutator::BackupRef;

/// Lifecycle of an artifact.
///
/// `pending -> approved | expired`, `approved -> executing -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Pending,
    Approved,
    Expired,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Approved => "approved",
            ArtifactStatus::Expired => "expired",
            ArtifactStatus::Executing => "executing",
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One file to promote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the workspace root.
    pub path: String,
    pub change_type: ChangeKind,
    /// Content at the sandbox commit. `None` for deletions.
    pub content: Option<String>,
    pub additions: u32,
    pub deletions: u32,
}

/// A reviewer's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    pub reviewer: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comments: Option<String>,
    /// Promote only these paths.
    #[serde(default)]
    pub approved_files: Option<Vec<String>>,
}

impl ReviewResult {
    /// An approval of every file.
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reviewer: reviewer.into(),
            timestamp: Utc::now(),
            comments: None,
            approved_files: None,
        }
    }

    /// A rejection.
    pub fn reject(reviewer: impl Into<String>) -> Self {
        Self {
            approved: false,
            ..Self::approve(reviewer)
        }
    }

    /// Sets the comments.
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Narrows the approval to a subset of files.
    pub fn with_approved_files(mut self, files: Vec<String>) -> Self {
        self.approved_files = Some(files);
        self
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub artifact_id: String,
    pub success: bool,
    /// Backups that should have been restored.
    pub expected: usize,
    /// Backups actually restored.
    pub restored: usize,
    pub errors: Vec<String>,
    /// Production commit recording the revert, if the execution had committed.
    pub revert_commit: Option<String>,
    /// True when triggered by failing production tests.
    pub automatic: bool,
    pub rolled_back_at: DateTime<Utc>,
}

/// Records accumulated over an artifact's life.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default)]
    pub review: Option<ReviewResult>,
    #[serde(default)]
    pub production_commit: Option<String>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    /// Backups taken during execution, in application order.
    #[serde(default)]
    pub backups: Vec<BackupRef>,
    #[serde(default)]
    pub rollback: Option<RollbackResult>,
    /// Free-form entries.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A validated sandbox change packaged for promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffArtifact {
    pub id: String,
    pub sandbox_id: String,
    pub session_id: Option<String>,
    /// Sandbox commit the files were read from.
    pub commit_hash: String,
    pub objective: String,
    /// Never contains a protected path.
    pub files: Vec<FileChange>,
    /// Unified diff restricted to `files`.
    pub diff: String,
    pub test_result: Option<TestResult>,
    pub type_check_passed: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

impl HandoffArtifact {
    /// True once the TTL has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Paths of the files in this artifact.
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Outcome of executing an artifact against production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffResult {
    pub artifact_id: String,
    pub success: bool,
    /// Files that remain applied.
    pub files_applied: Vec<String>,
    pub files_failed: Vec<String>,
    pub production_commit: Option<String>,
    pub backups: Vec<BackupRef>,
    pub errors: Vec<String>,
    pub duration: Duration,
    pub can_rollback: bool,
}

/// Keeps only the `diff --git` sections touching `paths`.
pub(crate) fn filter_diff(diff: &str, paths: &[String]) -> String {
    let mut kept = String::new();
    let mut keep = false;
    for line in diff.split_inclusive('\n') {
        if let Some(header) = line.strip_prefix("diff --git ") {
            keep = paths.iter().any(|p| {
                let header = header.trim_end();
                header == format!("a/{0} b/{0}", p)
            });
        }
        if keep {
            kept.push_str(line);
        }
    }
    kept
}

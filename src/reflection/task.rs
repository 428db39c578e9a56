//! Task, iteration and result model for the reflection loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ReflectionConfig;
use crate::parser::{TestResult, TypeCheckResult};

/// What a code change does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Edit,
    Delete,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Edit => "edit",
            ChangeOperation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A single file change proposed for the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    /// Path relative to the workspace root.
    pub path: String,
    pub operation: ChangeOperation,
    /// Full new content. Empty for deletes.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reason: String,
}

impl CodeChange {
    /// Creates a change that writes `content` to `path`.
    pub fn edit(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Edit,
            content: content.into(),
            reason: String::new(),
        }
    }

    /// Creates a change that adds a new file.
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            operation: ChangeOperation::Create,
            ..Self::edit(path, content)
        }
    }

    /// Creates a change that removes `path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            ..Self::edit(path, String::new())
        }
    }

    /// Sets the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// A request to iterate on the codebase until validation passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionTask {
    /// Unique task identifier.
    pub id: String,
    /// What the change should achieve.
    pub objective: String,
    /// Files the change is expected to touch.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Free-form context. Fenced code blocks here seed the first iteration.
    #[serde(default)]
    pub context: Option<String>,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Falls back to the configured default.
    #[serde(default)]
    pub required_pass_rate: Option<f64>,
    /// Request promotion as soon as the task succeeds.
    #[serde(default)]
    pub auto_promote: bool,
}

impl ReflectionTask {
    /// Creates a task with a fresh id.
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            objective: objective.into(),
            target_files: Vec::new(),
            context: None,
            max_iterations: None,
            required_pass_rate: None,
            auto_promote: false,
        }
    }

    /// Sets the target files.
    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    /// Sets the context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Sets the iteration budget.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Sets the required pass rate.
    pub fn with_required_pass_rate(mut self, rate: f64) -> Self {
        self.required_pass_rate = Some(rate);
        self
    }

    /// Sets auto-promotion.
    pub fn with_auto_promote(mut self, auto_promote: bool) -> Self {
        self.auto_promote = auto_promote;
        self
    }

    /// Applies configured defaults and clamps the limits.
    pub fn resolved(&self, config: &ReflectionConfig) -> ResolvedTask {
        let rate = self
            .required_pass_rate
            .unwrap_or(config.default_required_pass_rate);
        let rate = if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) };
        ResolvedTask {
            max_iterations: self
                .max_iterations
                .unwrap_or(config.default_max_iterations)
                .max(1),
            required_pass_rate: rate,
        }
    }
}

/// Effective limits for one run of a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTask {
    pub max_iterations: u32,
    pub required_pass_rate: f64,
}

/// One apply-validate cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionIteration {
    /// 1-based iteration number.
    pub number: u32,
    /// Changes applied in this iteration.
    pub changes: Vec<CodeChange>,
    pub type_check: Option<TypeCheckResult>,
    pub test_result: Option<TestResult>,
    /// Errors recorded while applying, validating or refining.
    pub errors: Vec<String>,
    /// Reasoning of the refinement that produced these changes.
    pub reasoning: Option<String>,
    pub duration: Duration,
}

impl ReflectionIteration {
    /// Fraction of tests that did not fail, if tests ran.
    pub fn pass_rate(&self) -> Option<f64> {
        self.test_result.as_ref().map(TestResult::pass_rate)
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionStatus {
    Success,
    Partial,
    Failed,
    Aborted,
}

impl std::fmt::Display for ReflectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReflectionStatus::Success => "success",
            ReflectionStatus::Partial => "partial",
            ReflectionStatus::Failed => "failed",
            ReflectionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Outcome of a task. The only input to handoff preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub task_id: String,
    pub objective: String,
    pub status: ReflectionStatus,
    /// Full iteration history.
    pub iterations: Vec<ReflectionIteration>,
    pub final_test_result: Option<TestResult>,
    pub type_check_passed: bool,
    /// Sandbox commit holding the result, if any.
    pub commit_hash: Option<String>,
    /// True only for a successful task with a commit.
    pub ready_for_promotion: bool,
    /// Human-readable summary.
    pub summary: String,
    pub sandbox_id: String,
    pub session_id: Option<String>,
    pub duration: Duration,
}

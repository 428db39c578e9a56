//! The injected refinement strategy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parser::TestFailure;

use super::task::CodeChange;

/// Everything a refiner gets to see about the current attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub objective: String,
    /// Iteration just validated (0 before the first one).
    pub iteration: u32,
    /// Changes applied in that iteration.
    pub previous_changes: Vec<CodeChange>,
    pub test_failures: Vec<TestFailure>,
    /// Type-check diagnostics, one per line.
    pub type_errors: Vec<String>,
    pub context: Option<String>,
    pub target_files: Vec<String>,
}

/// A refiner's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    pub changes: Vec<CodeChange>,
    #[serde(default)]
    pub reasoning: String,
    /// Self-reported confidence in 0..=1.
    pub confidence: f64,
    #[serde(default)]
    pub abort: bool,
    #[serde(default)]
    pub abort_reason: Option<String>,
}

impl Refinement {
    /// A refinement proposing `changes` with the given confidence.
    pub fn new(changes: Vec<CodeChange>, confidence: f64) -> Self {
        Self {
            changes,
            reasoning: String::new(),
            confidence,
            abort: false,
            abort_reason: None,
        }
    }

    /// A refinement that stops the task.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            changes: Vec::new(),
            reasoning: String::new(),
            confidence: 0.0,
            abort: true,
            abort_reason: Some(reason.into()),
        }
    }

    /// Sets the reasoning.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// Produces code changes from the failures of the previous attempt.
///
/// The loop treats implementations as opaque strategies.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, request: RefinementRequest) -> Result<Refinement>;
}

//! The generate, apply, validate, refine cycle.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ReflectionConfig;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventSink};
use crate::parser::{TestFailure, TestResult};
use crate::persist;
use crate::sandbox::{ModificationPreview, Sandbox, SessionCompletion, SessionStatus};

use super::extract::extract_code_changes;
use super::refine::{Refiner, RefinementRequest};
use super::task::{
    ChangeOperation, ReflectionIteration, ReflectionResult, ReflectionStatus, ReflectionTask,
    ResolvedTask,
};

/// A task currently being worked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: String,
    pub objective: String,
    /// Iteration in progress (0 while seeding).
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
}

/// How a task ended, before it is turned into a [`ReflectionResult`].
struct Outcome {
    status: ReflectionStatus,
    commit: Option<String>,
    summary: String,
}

impl Outcome {
    fn aborted(reason: Option<String>) -> Self {
        let reason = reason.unwrap_or_else(|| "no reason given".to_string());
        Self {
            status: ReflectionStatus::Aborted,
            commit: None,
            summary: format!("aborted by refiner: {}", reason),
        }
    }
}

/// Runs reflection tasks against a sandbox.
///
/// Tasks are serialized: a second `run` waits for the first to finish.
pub struct ReflectionLoop {
    sandbox: Arc<dyn Sandbox>,
    refiner: Option<Arc<dyn Refiner>>,
    events: Arc<dyn EventSink>,
    config: ReflectionConfig,
    run_lock: Mutex<()>,
    active: StdMutex<HashMap<String, ActiveTask>>,
    results: StdMutex<VecDeque<ReflectionResult>>,
    trail: Option<PathBuf>,
}

impl ReflectionLoop {
    /// Creates a loop without a refiner.
    pub fn new(sandbox: Arc<dyn Sandbox>, events: Arc<dyn EventSink>, config: ReflectionConfig) -> Self {
        Self {
            sandbox,
            refiner: None,
            events,
            config,
            run_lock: Mutex::new(()),
            active: StdMutex::new(HashMap::new()),
            results: StdMutex::new(VecDeque::new()),
            trail: None,
        }
    }

    /// Sets the refinement strategy.
    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    /// Appends every finished result to a JSONL trail.
    pub fn with_trail(mut self, path: impl Into<PathBuf>) -> Self {
        self.trail = Some(path.into());
        self
    }

    /// Tasks currently running or waiting for the run lock.
    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        lock(&self.active).values().cloned().collect()
    }

    /// A retained result, if the task finished recently enough.
    pub fn result(&self, task_id: &str) -> Option<ReflectionResult> {
        lock(&self.results)
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// Runs a task to a terminal status.
    ///
    /// Failures are reported in the result; this never returns an error.
    pub async fn run(&self, task: ReflectionTask) -> ReflectionResult {
        let limits = task.resolved(&self.config);
        lock(&self.active).insert(
            task.id.clone(),
            ActiveTask {
                task_id: task.id.clone(),
                objective: task.objective.clone(),
                iteration: 0,
                max_iterations: limits.max_iterations,
                started_at: Utc::now(),
            },
        );

        let _guard = self.run_lock.lock().await;
        let started = Instant::now();

        tracing::info!(
            task_id = %task.id,
            objective = %task.objective,
            max_iterations = limits.max_iterations,
            required_pass_rate = limits.required_pass_rate,
            "starting reflection task"
        );
        self.events.publish(CoreEvent::ExecutionStarted {
            task_id: task.id.clone(),
            objective: task.objective.clone(),
        });

        let mut iterations = Vec::new();
        let mut session_id = None;
        let outcome = match self
            .drive(&task, limits, &mut iterations, &mut session_id)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "reflection task failed");
                Outcome {
                    status: ReflectionStatus::Failed,
                    commit: None,
                    summary: format!("reflection failed: {}", e),
                }
            }
        };

        if let Some(id) = &session_id {
            let completion = SessionCompletion {
                status: if outcome.status == ReflectionStatus::Success {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                },
                iterations: iterations.len() as u32,
                final_commit: outcome.commit.clone(),
            };
            if let Err(e) = self.sandbox.complete_session(id, completion).await {
                tracing::warn!(session_id = %id, error = %e, "failed to complete session");
            }
        }

        let result = self
            .build_result(&task, outcome, iterations, session_id, started)
            .await;
        self.finish(&task, &result);
        result
    }

    async fn drive(
        &self,
        task: &ReflectionTask,
        limits: ResolvedTask,
        iterations: &mut Vec<ReflectionIteration>,
        session_id: &mut Option<String>,
    ) -> Result<Outcome> {
        self.sandbox.ensure_running().await?;
        let session = self.sandbox.start_session(&task.objective).await?;
        *session_id = Some(session.id.clone());

        let mut changes = task
            .context
            .as_deref()
            .map(|context| extract_code_changes(context, &task.target_files))
            .unwrap_or_default();
        let mut reasoning = None;

        if changes.is_empty() {
            if let Some(refiner) = &self.refiner {
                let refinement = refiner
                    .refine(RefinementRequest {
                        objective: task.objective.clone(),
                        iteration: 0,
                        previous_changes: Vec::new(),
                        test_failures: Vec::new(),
                        type_errors: Vec::new(),
                        context: task.context.clone(),
                        target_files: task.target_files.clone(),
                    })
                    .await?;
                if refinement.abort {
                    return Ok(Outcome::aborted(refinement.abort_reason));
                }
                changes = refinement.changes;
                reasoning = non_empty(refinement.reasoning);
            }
        } else {
            tracing::info!(
                task_id = %task.id,
                changes = changes.len(),
                "seeded changes from task context"
            );
        }

        for number in 1..=limits.max_iterations {
            if let Some(active) = lock(&self.active).get_mut(&task.id) {
                active.iteration = number;
            }

            let iteration_started = Instant::now();
            let mut iteration = ReflectionIteration {
                number,
                changes: changes.clone(),
                type_check: None,
                test_result: None,
                errors: Vec::new(),
                reasoning: reasoning.take(),
                duration: Default::default(),
            };

            let timeout = self.config.iteration_timeout();
            let validated = tokio::time::timeout(
                timeout,
                self.apply_and_validate(&session.id, &mut iteration),
            )
            .await;
            if validated.is_err() {
                tracing::warn!(task_id = %task.id, iteration = number, "iteration timed out");
                iteration
                    .errors
                    .push(format!("iteration timed out after {}s", timeout.as_secs()));
            }
            iteration.duration = iteration_started.elapsed();

            let type_check_passed = iteration.type_check.as_ref().is_some_and(|t| t.passed);
            let tests_passed = iteration
                .test_result
                .as_ref()
                .is_some_and(|t| meets_pass_rate(t, limits.required_pass_rate));
            let pass_rate = iteration.pass_rate().unwrap_or(0.0);

            tracing::info!(
                task_id = %task.id,
                iteration = number,
                pass_rate,
                type_check_passed,
                errors = iteration.errors.len(),
                "iteration completed"
            );
            self.events.publish(CoreEvent::IterationCompleted {
                task_id: task.id.clone(),
                iteration: number,
                pass_rate,
                type_check_passed,
            });

            // Success is checked before any refinement.
            if type_check_passed && tests_passed {
                let message = format!("reflection: {} (iteration {})", task.objective, number);
                match self.sandbox.commit(&message).await {
                    Ok(hash) => {
                        let summary = success_summary(number, iteration.test_result.as_ref());
                        iterations.push(iteration);
                        return Ok(Outcome {
                            status: ReflectionStatus::Success,
                            commit: Some(hash),
                            summary,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "failed to commit passing iteration");
                        iteration.errors.push(format!("commit failed: {}", e));
                    }
                }
            }

            // A run that produced no result still hands its error text to the refiner.
            let failures = match &iteration.test_result {
                Some(tests) => tests.failures.clone(),
                None => errors_from(&iteration.errors, TESTS)
                    .map(|message| TestFailure {
                        name: "test command".to_string(),
                        message,
                    })
                    .collect(),
            };
            let type_errors = match &iteration.type_check {
                Some(check) => check.error_lines(),
                None => errors_from(&iteration.errors, TYPE_CHECK).collect(),
            };
            iterations.push(iteration);

            if number == limits.max_iterations {
                break;
            }
            let Some(refiner) = &self.refiner else {
                tracing::info!(task_id = %task.id, "no refiner configured, stopping");
                break;
            };

            let request = RefinementRequest {
                objective: task.objective.clone(),
                iteration: number,
                previous_changes: changes.clone(),
                test_failures: failures,
                type_errors,
                context: task.context.clone(),
                target_files: task.target_files.clone(),
            };
            match refiner.refine(request).await {
                Ok(refinement) if refinement.abort => {
                    tracing::info!(
                        task_id = %task.id,
                        reason = ?refinement.abort_reason,
                        "refiner aborted task"
                    );
                    return Ok(Outcome::aborted(refinement.abort_reason));
                }
                Ok(refinement) if refinement.confidence < self.config.min_confidence => {
                    tracing::info!(
                        task_id = %task.id,
                        confidence = refinement.confidence,
                        min_confidence = self.config.min_confidence,
                        "refinement confidence too low, stopping early"
                    );
                    break;
                }
                Ok(refinement) => {
                    changes = refinement.changes;
                    reasoning = non_empty(refinement.reasoning);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, iteration = number, error = %e, "refinement failed");
                    if let Some(last) = iterations.last_mut() {
                        last.errors.push(format!("refinement failed: {}", e));
                    }
                }
            }
        }

        Ok(self.best_attempt(task, limits, iterations).await)
    }

    async fn apply_and_validate(&self, session_id: &str, iteration: &mut ReflectionIteration) {
        for change in &iteration.changes {
            let applied = match change.operation {
                ChangeOperation::Delete => self.sandbox.delete_file(&change.path).await,
                ChangeOperation::Create | ChangeOperation::Edit => {
                    self.sandbox.write_file(&change.path, &change.content).await
                }
            };
            match applied {
                Ok(()) => {
                    let preview = ModificationPreview {
                        path: change.path.clone(),
                        operation: change.operation,
                        reason: change.reason.clone(),
                        iteration: iteration.number,
                    };
                    if let Err(e) = self.sandbox.record_modification(session_id, preview).await {
                        tracing::warn!(session_id = %session_id, error = %e, "failed to record modification");
                    }
                }
                Err(e) => {
                    iteration.errors.push(format!(
                        "failed to {} {}: {}",
                        change.operation, change.path, e
                    ));
                }
            }
        }

        match self.sandbox.type_check().await {
            Ok(result) => iteration.type_check = Some(result),
            Err(e) => iteration.errors.push(validation_error(TYPE_CHECK, e)),
        }
        match self.sandbox.run_tests(None).await {
            Ok(result) => iteration.test_result = Some(result),
            Err(e) => iteration.errors.push(validation_error(TESTS, e)),
        }
    }

    /// Ends a task that ran out of iterations or confidence.
    async fn best_attempt(
        &self,
        task: &ReflectionTask,
        limits: ResolvedTask,
        iterations: &mut [ReflectionIteration],
    ) -> Outcome {
        let count = iterations.len();
        let last_tests = iterations.last().and_then(|i| i.test_result.clone());
        let mut summary = format!(
            "pass rate {:.0}% not reached after {} iteration(s)",
            limits.required_pass_rate * 100.0,
            count
        );
        if let Some(tests) = &last_tests {
            summary.push_str(&format!("; last run {}/{} passing", tests.passed, tests.total));
        }

        let mut commit = None;
        if last_tests.as_ref().is_some_and(|t| t.passed > 0) {
            let message = format!("reflection: {} (best attempt)", task.objective);
            match self.sandbox.commit(&message).await {
                Ok(hash) => {
                    summary.push_str(&format!("; best attempt committed as {}", hash));
                    commit = Some(hash);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to commit best attempt");
                    if let Some(last) = iterations.last_mut() {
                        last.errors.push(format!("commit failed: {}", e));
                    }
                    summary.push_str("; best attempt could not be committed");
                }
            }
        }

        Outcome {
            status: ReflectionStatus::Partial,
            commit,
            summary,
        }
    }

    async fn build_result(
        &self,
        task: &ReflectionTask,
        outcome: Outcome,
        iterations: Vec<ReflectionIteration>,
        session_id: Option<String>,
        started: Instant,
    ) -> ReflectionResult {
        let final_test_result = iterations
            .iter()
            .rev()
            .find_map(|i| i.test_result.clone());
        let type_check_passed = iterations
            .last()
            .and_then(|i| i.type_check.as_ref())
            .is_some_and(|t| t.passed);
        let ready_for_promotion =
            outcome.status == ReflectionStatus::Success && outcome.commit.is_some();

        ReflectionResult {
            task_id: task.id.clone(),
            objective: task.objective.clone(),
            status: outcome.status,
            iterations,
            final_test_result,
            type_check_passed,
            commit_hash: outcome.commit,
            ready_for_promotion,
            summary: outcome.summary,
            sandbox_id: self.sandbox.sandbox_id().await,
            session_id,
            duration: started.elapsed(),
        }
    }

    fn finish(&self, task: &ReflectionTask, result: &ReflectionResult) {
        lock(&self.active).remove(&task.id);

        {
            let mut results = lock(&self.results);
            while results.len() >= self.config.max_retained_results.max(1) {
                results.pop_front();
            }
            results.push_back(result.clone());
        }

        if let Some(trail) = &self.trail {
            if let Err(e) = persist::append_jsonl(trail, result) {
                tracing::warn!(error = %e, task_id = %task.id, "failed to append reflection trail");
            }
        }

        tracing::info!(
            task_id = %task.id,
            status = %result.status,
            iterations = result.iterations.len(),
            commit = ?result.commit_hash,
            "reflection task finished"
        );
        self.events.publish(CoreEvent::ExecutionEnded {
            task_id: task.id.clone(),
            status: result.status.to_string(),
            commit: result.commit_hash.clone(),
        });

        if task.auto_promote && result.ready_for_promotion {
            if let Some(commit) = &result.commit_hash {
                self.events.publish(CoreEvent::PromotionRequested {
                    task_id: task.id.clone(),
                    commit: commit.clone(),
                });
            }
        }
    }
}

/// No tests reported counts as a full pass.
fn meets_pass_rate(tests: &TestResult, required: f64) -> bool {
    tests.pass_rate() >= required
}

const TESTS: &str = "tests";
const TYPE_CHECK: &str = "type check";

/// Lines kept from the output of a timed-out validation command.
const PARTIAL_OUTPUT_LINES: usize = 20;

/// Describes a validation command that produced no result, keeping the
/// partial output of a timeout.
fn validation_error(what: &str, error: Error) -> String {
    match error {
        Error::CommandTimeout {
            timeout,
            partial_output,
            ..
        } => {
            let lines: Vec<&str> = partial_output
                .lines()
                .filter(|l| !l.trim().is_empty())
                .collect();
            let tail = lines[lines.len().saturating_sub(PARTIAL_OUTPUT_LINES)..].join("\n");
            if tail.is_empty() {
                format!("{} timed out after {}s with no output", what, timeout.as_secs())
            } else {
                format!(
                    "{} timed out after {}s; partial output:\n{}",
                    what,
                    timeout.as_secs(),
                    tail
                )
            }
        }
        other => format!("{} failed to run: {}", what, other),
    }
}

/// Errors recorded by [`validation_error`] for `what`.
fn errors_from<'a>(errors: &'a [String], what: &'a str) -> impl Iterator<Item = String> + 'a {
    errors
        .iter()
        .filter(move |e| e.starts_with(what) && e[what.len()..].starts_with(' '))
        .cloned()
}

fn success_summary(iterations: u32, tests: Option<&TestResult>) -> String {
    match tests {
        Some(t) if t.total > 0 => format!(
            "objective met after {} iteration(s): {}/{} tests passing",
            iterations, t.passed, t.total
        ),
        _ => format!("objective met after {} iteration(s): no tests reported", iterations),
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.trim().is_empty()).then_some(text)
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//! Reflection loop scenarios against an in-memory sandbox.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crucible::config::ReflectionConfig;
use crucible::events::RecordingSink;
use crucible::parser::TestResult;
use crucible::reflection::{
    ChangeOperation, CodeChange, Refinement, ReflectionLoop, ReflectionStatus, ReflectionTask,
};
use crucible::sandbox::SessionStatus;

use common::{tests, type_error, type_ok, FakeSandbox, ScriptedRefiner};

fn reflection_loop(
    sandbox: Arc<FakeSandbox>,
    refiner: Option<Arc<ScriptedRefiner>>,
    config: ReflectionConfig,
) -> (ReflectionLoop, Arc<RecordingSink>) {
    let events = Arc::new(RecordingSink::new());
    let mut reflection = ReflectionLoop::new(sandbox, events.clone(), config);
    if let Some(refiner) = refiner {
        reflection = reflection.with_refiner(refiner);
    }
    (reflection, events)
}

fn fix(content: &str, confidence: f64) -> Result<Refinement, String> {
    Ok(Refinement::new(vec![CodeChange::edit("src/login.ts", content)], confidence)
        .with_reasoning("adjust the login check"))
}

#[tokio::test]
async fn refined_fix_succeeds_on_second_iteration() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(tests(2, 3));
    sandbox.push_tests(tests(5, 0));
    let refiner = Arc::new(ScriptedRefiner::new(vec![
        fix("first attempt", 0.8),
        fix("second attempt", 0.9),
    ]));
    let (reflection, events) =
        reflection_loop(sandbox.clone(), Some(refiner.clone()), ReflectionConfig::default());

    let task = ReflectionTask::new("fix login")
        .with_target_files(vec!["src/login.ts".into()])
        .with_max_iterations(3)
        .with_auto_promote(true);
    let result = reflection.run(task).await;

    assert_eq!(result.status, ReflectionStatus::Success);
    assert_eq!(result.iterations.len(), 2);
    assert!(result.commit_hash.is_some());
    assert!(result.ready_for_promotion);
    assert!(result.type_check_passed);
    assert_eq!(result.final_test_result.as_ref().unwrap().passed, 5);
    assert_eq!(sandbox.file("src/login.ts").as_deref(), Some("second attempt"));

    // Initial refinement plus one after the failing iteration, none after success
    let requests = refiner.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].iteration, 0);
    assert!(requests[0].test_failures.is_empty());
    assert_eq!(requests[1].iteration, 1);
    assert_eq!(requests[1].test_failures.len(), 3);
    assert_eq!(requests[1].previous_changes[0].content, "first attempt");

    assert_eq!(
        result.iterations[1].reasoning.as_deref(),
        Some("adjust the login check")
    );
    assert_eq!(
        events.names(),
        vec![
            "execution_started",
            "iteration_completed",
            "iteration_completed",
            "execution_ended",
            "promotion_requested",
        ]
    );
}

#[tokio::test]
async fn refiner_abort_stops_without_commit() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(tests(1, 4));
    sandbox.push_tests(tests(2, 3));
    let refiner = Arc::new(ScriptedRefiner::new(vec![
        fix("one", 0.9),
        fix("two", 0.9),
        Ok(Refinement::abort("unsafe change")),
    ]));
    let (reflection, _) = reflection_loop(sandbox.clone(), Some(refiner), ReflectionConfig::default());

    let result = reflection
        .run(ReflectionTask::new("fix login").with_max_iterations(3))
        .await;

    assert_eq!(result.status, ReflectionStatus::Aborted);
    assert!(result.summary.contains("unsafe change"));
    assert!(result.commit_hash.is_none());
    assert!(!result.ready_for_promotion);
    assert_eq!(result.iterations.len(), 2);
    assert!(sandbox.commits().is_empty());
}

#[tokio::test]
async fn no_tests_counts_as_success_after_one_iteration() {
    let sandbox = Arc::new(FakeSandbox::new());
    let (reflection, _) = reflection_loop(sandbox.clone(), None, ReflectionConfig::default());

    let task = ReflectionTask::new("add helper")
        .with_target_files(vec!["src/helper.ts".into()])
        .with_context("Use this:\n```ts\nexport const helper = () => 1;\n```\n")
        .with_required_pass_rate(1.0);
    let result = reflection.run(task).await;

    assert_eq!(result.status, ReflectionStatus::Success);
    assert_eq!(result.iterations.len(), 1);
    assert_eq!(result.final_test_result.as_ref().unwrap().total, 0);
    assert_eq!(
        sandbox.file("src/helper.ts").as_deref(),
        Some("export const helper = () => 1;\n")
    );
    assert_eq!(result.iterations[0].changes[0].operation, ChangeOperation::Edit);
}

#[tokio::test]
async fn unparseable_output_without_counts_still_passes() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(TestResult {
        success: false,
        ambiguous: true,
        output: "Segmentation fault".to_string(),
        ..Default::default()
    });
    let (reflection, _) = reflection_loop(sandbox.clone(), None, ReflectionConfig::default());

    let task = ReflectionTask::new("add helper")
        .with_context("```ts src/helper.ts
export const helper = () => 1;
```")
        .with_max_iterations(1)
        .with_required_pass_rate(1.0);
    let result = reflection.run(task).await;

    assert_eq!(result.status, ReflectionStatus::Success);
    assert_eq!(result.final_test_result.as_ref().unwrap().total, 0);
    assert!(result.commit_hash.is_some());
}

#[tokio::test]
async fn low_confidence_stops_early_and_commits_best_attempt() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(tests(2, 3));
    let refiner = Arc::new(ScriptedRefiner::new(vec![fix("guess", 0.1)]));
    let (reflection, _) =
        reflection_loop(sandbox.clone(), Some(refiner.clone()), ReflectionConfig::default());

    let task = ReflectionTask::new("fix login")
        .with_context("```ts src/login.ts\nexport const ok = false;\n```")
        .with_max_iterations(5);
    let result = reflection.run(task).await;

    assert_eq!(result.status, ReflectionStatus::Partial);
    assert_eq!(result.iterations.len(), 1);
    assert_eq!(refiner.requests().len(), 1);
    assert_eq!(sandbox.commits().len(), 1);
    assert_eq!(result.commit_hash, sandbox.commits().first().cloned());
    assert!(!result.ready_for_promotion);
}

#[tokio::test]
async fn exhausted_without_passing_tests_is_partial_without_commit() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(tests(0, 3));
    sandbox.push_tests(tests(0, 3));
    let refiner = Arc::new(ScriptedRefiner::new(vec![fix("a", 0.9), fix("b", 0.9)]));
    let (reflection, _) = reflection_loop(sandbox.clone(), Some(refiner), ReflectionConfig::default());

    let result = reflection
        .run(ReflectionTask::new("fix login").with_max_iterations(2))
        .await;

    assert_eq!(result.status, ReflectionStatus::Partial);
    assert_eq!(result.iterations.len(), 2);
    assert!(result.commit_hash.is_none());
    assert!(sandbox.commits().is_empty());
}

#[tokio::test]
async fn failing_type_check_blocks_success_and_feeds_refiner() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_type_check(type_error("src/login.ts", "Type 'string' is not assignable to type 'number'."));
    sandbox.push_type_check(type_ok());
    sandbox.push_tests(tests(4, 0));
    sandbox.push_tests(tests(4, 0));
    let refiner = Arc::new(ScriptedRefiner::new(vec![fix("typed", 0.7)]));
    let (reflection, _) =
        reflection_loop(sandbox.clone(), Some(refiner.clone()), ReflectionConfig::default());

    let task = ReflectionTask::new("fix types")
        .with_context("```ts src/login.ts\nconst n: number = 'x';\n```")
        .with_max_iterations(3);
    let result = reflection.run(task).await;

    assert_eq!(result.status, ReflectionStatus::Success);
    assert_eq!(result.iterations.len(), 2);
    let request = &refiner.requests()[0];
    assert_eq!(request.type_errors.len(), 1);
    assert!(request.type_errors[0].contains("TS2322"));
}

#[tokio::test]
async fn initial_abort_ends_task_before_any_iteration() {
    let sandbox = Arc::new(FakeSandbox::new());
    let refiner = Arc::new(ScriptedRefiner::new(vec![Ok(Refinement::abort("out of scope"))]));
    let (reflection, _) = reflection_loop(sandbox.clone(), Some(refiner), ReflectionConfig::default());

    let result = reflection.run(ReflectionTask::new("rewrite everything")).await;

    assert_eq!(result.status, ReflectionStatus::Aborted);
    assert!(result.iterations.is_empty());
    assert!(result.summary.contains("out of scope"));
    assert!(sandbox.writes().is_empty());
}

#[tokio::test]
async fn refinement_error_is_recorded_and_loop_continues() {
    let sandbox = Arc::new(FakeSandbox::new());
    sandbox.push_tests(tests(1, 1));
    sandbox.push_tests(tests(2, 0));
    let refiner = Arc::new(ScriptedRefiner::new(vec![Err("model overloaded".to_string())]));
    let (reflection, _) = reflection_loop(sandbox.clone(), Some(refiner), ReflectionConfig::default());

    let task = ReflectionTask::new("fix login")
        .with_context("```ts src/login.ts\nexport {};\n```")
        .with_max_iterations(2);
    let result = reflection.run(task).await;

    assert!(result.iterations[0]
        .errors
        .iter()
        .any(|e| e.contains("model overloaded")));
    // Same changes retried; the second run passes
    assert_eq!(result.status, ReflectionStatus::Success);
    assert_eq!(result.iterations[1].changes, result.iterations[0].changes);
}

#[tokio::test]
async fn unavailable_sandbox_fails_the_task() {
    let sandbox = Arc::new(FakeSandbox::unavailable());
    let (reflection, events) = reflection_loop(sandbox, None, ReflectionConfig::default());

    let result = reflection.run(ReflectionTask::new("anything")).await;

    assert_eq!(result.status, ReflectionStatus::Failed);
    assert!(result.summary.contains("environment unavailable"));
    assert!(result.session_id.is_none());
    assert_eq!(events.names(), vec!["execution_started", "execution_ended"]);
}

#[tokio::test]
async fn slow_validation_times_out_the_iteration() {
    let sandbox = Arc::new(FakeSandbox::new().with_test_delay(Duration::from_secs(5)));
    let config = ReflectionConfig {
        iteration_timeout_secs: 1,
        ..Default::default()
    };
    let (reflection, _) = reflection_loop(sandbox, None, config);

    let result = reflection
        .run(ReflectionTask::new("slow").with_max_iterations(1))
        .await;

    assert_eq!(result.status, ReflectionStatus::Partial);
    assert!(result.iterations[0].errors.iter().any(|e| e.contains("timed out")));
    assert!(result.iterations[0].test_result.is_none());
}

#[tokio::test]
async fn timed_out_tests_pass_partial_output_to_refiner() {
    let sandbox = Arc::new(
        FakeSandbox::new().with_test_timeout("RUNS src/login.test.ts\nwaiting for database on :5432\n"),
    );
    let refiner = Arc::new(ScriptedRefiner::new(vec![fix("first", 0.9), fix("second", 0.9)]));
    let (reflection, _) =
        reflection_loop(sandbox.clone(), Some(refiner.clone()), ReflectionConfig::default());

    let result = reflection
        .run(ReflectionTask::new("fix login").with_max_iterations(2))
        .await;

    assert_eq!(result.status, ReflectionStatus::Partial);
    let errors = &result.iterations[0].errors;
    assert!(errors
        .iter()
        .any(|e| e.contains("timed out after 300s") && e.contains("waiting for database on :5432")));

    let requests = refiner.requests();
    assert_eq!(requests.len(), 2);
    let failures = &requests[1].test_failures;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("waiting for database on :5432"));
}

#[tokio::test]
async fn session_records_modifications_and_completion() {
    let sandbox = Arc::new(FakeSandbox::new());
    let (reflection, _) = reflection_loop(sandbox.clone(), None, ReflectionConfig::default());

    let task = ReflectionTask::new("two files")
        .with_context("```ts src/a.ts\na\n```\n```ts src/b.ts\nb\n```");
    let result = reflection.run(task).await;

    let sessions = sandbox.sessions();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(Some(session.id.clone()), result.session_id);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.modifications.len(), 2);
    assert_eq!(session.final_commit, result.commit_hash);
}

#[tokio::test]
async fn concurrent_runs_are_serialized_and_retained() {
    let sandbox = Arc::new(FakeSandbox::new().with_test_delay(Duration::from_millis(50)));
    let (reflection, _) = reflection_loop(sandbox.clone(), None, ReflectionConfig::default());

    let first = ReflectionTask::new("first");
    let second = ReflectionTask::new("second");
    let (first_id, second_id) = (first.id.clone(), second.id.clone());

    let (a, b) = tokio::join!(reflection.run(first), reflection.run(second));

    assert_eq!(a.status, ReflectionStatus::Success);
    assert_eq!(b.status, ReflectionStatus::Success);
    assert_eq!(sandbox.max_concurrent_validations(), 1);
    assert_eq!(reflection.result(&first_id).unwrap().task_id, first_id);
    assert_eq!(reflection.result(&second_id).unwrap().task_id, second_id);
    assert!(reflection.active_tasks().is_empty());
}

//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crucible::handoff::{BackupRef, FileMutator};
use crucible::parser::{TestFailure, TestResult, TypeCheckError, TypeCheckResult};
use crucible::reflection::{Refinement, RefinementRequest, Refiner};
use crucible::sandbox::{
    ChangeKind, ChangedPath, ModificationPreview, ReflectionSession, Sandbox, SessionCompletion,
    SessionRegistry,
};
use crucible::{Error, Result};

/// A passing or failing test run with the given counts.
pub fn tests(passed: u32, failed: u32) -> TestResult {
    TestResult {
        success: failed == 0,
        total: passed + failed,
        passed,
        failed,
        failures: (0..failed)
            .map(|i| TestFailure {
                name: format!("suite > case {}", i + 1),
                message: "expected true, got false".to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

pub fn type_ok() -> TypeCheckResult {
    TypeCheckResult {
        passed: true,
        ..Default::default()
    }
}

pub fn type_error(file: &str, message: &str) -> TypeCheckResult {
    TypeCheckResult {
        passed: false,
        errors: vec![TypeCheckError {
            file: Some(file.to_string()),
            line: Some(1),
            column: Some(1),
            code: Some("TS2322".to_string()),
            message: message.to_string(),
        }],
        ..Default::default()
    }
}

#[derive(Default)]
struct SandboxInner {
    running: bool,
    files: BTreeMap<String, String>,
    dirty: BTreeMap<String, ChangeKind>,
    commits: Vec<String>,
    snapshots: HashMap<String, BTreeMap<String, String>>,
    changes: HashMap<String, Vec<ChangedPath>>,
    test_script: VecDeque<TestResult>,
    type_script: VecDeque<TypeCheckResult>,
    writes: Vec<String>,
}

/// In-memory [`Sandbox`] with scripted validation results.
///
/// With an empty script, tests report no tests (passing) and the type check passes.
pub struct FakeSandbox {
    inner: Mutex<SandboxInner>,
    sessions: SessionRegistry,
    fail_start: bool,
    test_delay: Option<Duration>,
    test_timeout: Option<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SandboxInner::default()),
            sessions: SessionRegistry::new(100, None),
            fail_start: false,
            test_delay: None,
            test_timeout: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// `ensure_running` fails as if the engine were down.
    pub fn unavailable() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    pub fn with_test_delay(mut self, delay: Duration) -> Self {
        self.test_delay = Some(delay);
        self
    }

    /// `run_tests` times out after printing `partial_output`.
    pub fn with_test_timeout(mut self, partial_output: &str) -> Self {
        self.test_timeout = Some(partial_output.to_string());
        self
    }

    pub fn push_tests(&self, result: TestResult) {
        self.inner.lock().unwrap().test_script.push_back(result);
    }

    pub fn push_type_check(&self, result: TypeCheckResult) {
        self.inner.lock().unwrap().type_script.push_back(result);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn commits(&self) -> Vec<String> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn sessions(&self) -> Vec<ReflectionSession> {
        self.sessions.list()
    }

    pub fn max_concurrent_validations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn sandbox_id(&self) -> String {
        "fake-sandbox".to_string()
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.fail_start {
            return Err(Error::EnvironmentUnavailable(
                "container engine unreachable".to_string(),
            ));
        }
        self.inner.lock().unwrap().running = true;
        Ok(())
    }

    async fn start_session(&self, purpose: &str) -> Result<ReflectionSession> {
        if !self.inner.lock().unwrap().running {
            return Err(Error::SandboxNotRunning);
        }
        Ok(self.sessions.start(purpose))
    }

    async fn record_modification(&self, session_id: &str, preview: ModificationPreview) -> Result<()> {
        self.sessions.record_modification(session_id, preview)
    }

    async fn complete_session(
        &self,
        session_id: &str,
        completion: SessionCompletion,
    ) -> Result<ReflectionSession> {
        self.sessions.complete(session_id, completion)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.files.contains_key(path);
        inner.files.insert(path.to_string(), content.to_string());
        let kind = match inner.dirty.get(path) {
            Some(ChangeKind::Added) => ChangeKind::Added,
            _ if existed => ChangeKind::Modified,
            _ => ChangeKind::Added,
        };
        inner.dirty.insert(path.to_string(), kind);
        inner.writes.push(path.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.file(path)
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string())))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path);
        inner.dirty.insert(path.to_string(), ChangeKind::Deleted);
        Ok(())
    }

    async fn type_check(&self) -> Result<TypeCheckResult> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .type_script
            .pop_front()
            .unwrap_or_else(type_ok))
    }

    async fn run_tests(&self, _pattern: Option<&str>) -> Result<TestResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.test_delay.unwrap_or(Duration::from_millis(5))).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(partial_output) = &self.test_timeout {
            return Err(Error::CommandTimeout {
                command: "npm test".to_string(),
                timeout: Duration::from_secs(300),
                partial_output: partial_output.clone(),
            });
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .test_script
            .pop_front()
            .unwrap_or_else(|| TestResult {
                success: true,
                ..Default::default()
            }))
    }

    async fn commit(&self, _message: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let hash = format!("c{:03}", inner.commits.len() + 1);
        let changed: Vec<ChangedPath> = std::mem::take(&mut inner.dirty)
            .into_iter()
            .map(|(path, kind)| {
                let content = inner.files.get(&path);
                let binary = content.map_or(false, |c| c.contains('\0'));
                let lines = content.map(|c| c.lines().count()).unwrap_or(0) as u32;
                ChangedPath {
                    path,
                    kind,
                    additions: if binary { 0 } else { lines },
                    deletions: u32::from(kind != ChangeKind::Added && !binary),
                    binary,
                }
            })
            .collect();
        let snapshot = inner.files.clone();
        inner.snapshots.insert(hash.clone(), snapshot);
        inner.changes.insert(hash.clone(), changed);
        inner.commits.push(hash.clone());
        Ok(hash)
    }

    async fn get_diff(&self, path: Option<&str>) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .dirty
            .keys()
            .filter(|p| path.map_or(true, |only| only == p.as_str()))
            .map(|p| format!("diff --git a/{0} b/{0}\n", p))
            .collect())
    }

    async fn changed_files(&self, commit: &str) -> Result<Vec<ChangedPath>> {
        self.inner
            .lock()
            .unwrap()
            .changes
            .get(commit)
            .cloned()
            .ok_or_else(|| Error::Git(format!("unknown commit {}", commit)))
    }

    async fn commit_diff(&self, commit: &str, paths: &[String]) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let snapshot = inner
            .snapshots
            .get(commit)
            .ok_or_else(|| Error::Git(format!("unknown commit {}", commit)))?;
        let mut diff = String::new();
        for path in paths {
            diff.push_str(&format!("diff --git a/{0} b/{0}\n--- a/{0}\n+++ b/{0}\n@@ -0,0 +1 @@\n", path));
            for line in snapshot.get(path).map(String::as_str).unwrap_or("").lines() {
                diff.push_str(&format!("+{}\n", line));
            }
        }
        Ok(diff)
    }

    async fn show_file(&self, commit: &str, path: &str) -> Result<String> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(commit)
            .and_then(|files| files.get(path).cloned())
            .ok_or_else(|| Error::Git(format!("{}:{} does not exist", commit, path)))
    }
}

/// Refiner replaying a fixed list of answers and recording the requests.
pub struct ScriptedRefiner {
    script: Mutex<VecDeque<std::result::Result<Refinement, String>>>,
    requests: Mutex<Vec<RefinementRequest>>,
}

impl ScriptedRefiner {
    pub fn new(script: Vec<std::result::Result<Refinement, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RefinementRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Refiner for ScriptedRefiner {
    async fn refine(&self, request: RefinementRequest) -> Result<Refinement> {
        self.requests.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(refinement)) => Ok(refinement),
            Some(Err(message)) => Err(Error::Refinement(message)),
            None => Err(Error::Refinement("script exhausted".to_string())),
        }
    }
}

/// [`FileMutator`] that records calls and touches nothing.
#[derive(Default)]
pub struct RecordingMutator {
    calls: Mutex<Vec<String>>,
}

impl RecordingMutator {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl FileMutator for RecordingMutator {
    async fn create_file(&self, path: &str, _content: &str) -> Result<BackupRef> {
        self.record(format!("create {}", path));
        Ok(BackupRef {
            path: path.to_string(),
            backup_path: None,
        })
    }

    async fn edit_file(&self, path: &str, _content: &str) -> Result<BackupRef> {
        self.record(format!("edit {}", path));
        Ok(BackupRef {
            path: path.to_string(),
            backup_path: None,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<BackupRef> {
        self.record(format!("delete {}", path));
        Ok(BackupRef {
            path: path.to_string(),
            backup_path: None,
        })
    }

    async fn restore_backup(&self, backup: &BackupRef) -> Result<()> {
        self.record(format!("restore {}", backup.path));
        Ok(())
    }

    async fn run_tests(&self) -> Result<TestResult> {
        self.record("run_tests".to_string());
        Ok(TestResult {
            success: true,
            ..Default::default()
        })
    }

    async fn commit(&self, _message: &str, paths: &[String]) -> Result<String> {
        self.record(format!("commit {}", paths.join(",")));
        Ok("prod001".to_string())
    }
}

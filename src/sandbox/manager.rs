//! Container-backed sandbox manager.
//!
//! Owns one persistent environment: a container with a workspace volume
//! holding a clone of the host workspace on its own branch. All engine and
//! git invocations go through a [`CommandRunner`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::command::{display_command, CommandOutput, CommandRunner, RunOptions};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventSink};
use crate::parser::{
    ResultParser, TestOutputParser, TestResult, TypeCheckOutputParser, TypeCheckResult,
};

use super::provider::{ChangeKind, ChangedPath, Sandbox};
use super::session::{ModificationPreview, ReflectionSession, SessionCompletion, SessionRegistry};
use super::state::{DevServerStatus, SandboxState, SandboxStatus, StateStore};

/// Sessions retained in memory.
const SESSION_CAPACITY: usize = 100;

/// Timeout for quick engine calls (inspect, start, stop, rm).
const ENGINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for [`SandboxManager::exec_in_container`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Falls back to the configured operation timeout.
    pub timeout: Option<Duration>,
    /// Working directory inside the container. Falls back to the mount point.
    pub cwd: Option<String>,
}

/// Manages the lifecycle of the single sandbox environment.
pub struct SandboxManager {
    config: SandboxConfig,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    test_parser: Box<dyn ResultParser<Output = TestResult>>,
    check_parser: Box<dyn ResultParser<Output = TypeCheckResult>>,
    store: StateStore,
    state: Mutex<SandboxState>,
    sessions: SessionRegistry,
}

impl SandboxManager {
    /// Creates a manager, reattaching to any persisted state in `state_dir`.
    ///
    /// A corrupted state file is fatal.
    pub fn new(
        config: SandboxConfig,
        state_dir: &Path,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let store = StateStore::new(state_dir.join("sandbox-state.json"));
        let state = match store.load()? {
            Some(state) => {
                tracing::info!(
                    sandbox_id = %state.id,
                    status = %state.status,
                    container = ?state.container_id,
                    "loaded persisted sandbox state"
                );
                state
            }
            None => SandboxState::new(),
        };

        Ok(Self {
            config,
            runner,
            events,
            test_parser: Box::new(TestOutputParser),
            check_parser: Box::new(TypeCheckOutputParser),
            store,
            state: Mutex::new(state),
            sessions: SessionRegistry::new(
                SESSION_CAPACITY,
                Some(state_dir.join("sessions.jsonl")),
            ),
        })
    }

    /// Replaces the test output parser.
    pub fn with_test_parser(mut self, parser: impl ResultParser<Output = TestResult> + 'static) -> Self {
        self.test_parser = Box::new(parser);
        self
    }

    /// Replaces the type-check output parser.
    pub fn with_type_check_parser(
        mut self,
        parser: impl ResultParser<Output = TypeCheckResult> + 'static,
    ) -> Self {
        self.check_parser = Box::new(parser);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Returns a snapshot of the sandbox state.
    pub async fn status(&self) -> SandboxState {
        self.state.lock().await.clone()
    }

    /// Returns the session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Starts the environment.
    ///
    /// Creates it if none exists, restarts a stopped one in place, and is a
    /// no-op (apart from `last_used_at`) when it is already running.
    pub async fn start(&self) -> Result<SandboxState> {
        let mut state = self.state.lock().await;

        if let Some(container_id) = state.container_id.clone() {
            match self.inspect_running(&container_id).await {
                Ok(Some(true)) if state.branch.is_some() => {
                    if state.status != SandboxStatus::Running {
                        state.status = SandboxStatus::Running;
                        state.last_error = None;
                        tracing::info!(container = %container_id, "reattached to running sandbox");
                    }
                    state.touch();
                    self.store.save(&state)?;
                    return Ok(state.clone());
                }
                Ok(Some(false)) if state.branch.is_some() => {
                    return self.resume(&mut state, &container_id).await;
                }
                Ok(Some(_)) => {
                    tracing::warn!(
                        container = %container_id,
                        "sandbox was never fully provisioned, recreating"
                    );
                    self.remove_container(&container_id).await;
                }
                Ok(None) => {
                    tracing::warn!(container = %container_id, "sandbox container is gone, recreating");
                }
                Err(e) => return Err(self.fail(&mut state, e)),
            }
        }

        self.create(&mut state).await
    }

    /// Stops the container but keeps its volume.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(container_id) = state.container_id.clone() else {
            state.status = SandboxStatus::Stopped;
            return self.store.save(&state);
        };

        self.engine_checked(vec!["stop".into(), container_id.clone()], ENGINE_TIMEOUT)
            .await?;

        state.status = SandboxStatus::Stopped;
        if let Some(server) = state.dev_server.as_mut() {
            server.running = false;
        }
        state.touch();
        self.store.save(&state)?;

        tracing::info!(container = %container_id, "stopped sandbox");
        self.events.publish(CoreEvent::SandboxStopped {
            sandbox_id: state.id.clone(),
        });
        Ok(())
    }

    /// Removes container and volume and resets the state.
    pub async fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let old_id = state.id.clone();

        if let Some(container_id) = state.container_id.clone() {
            let output = self
                .engine(vec!["rm".into(), "-f".into(), container_id.clone()], ENGINE_TIMEOUT)
                .await?;
            if !output.success() && !output.stderr.contains("No such") {
                return Err(Error::CommandFailed {
                    command: format!("{} rm -f {}", self.config.engine, container_id),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }

        let volume = state
            .volume_name
            .clone()
            .unwrap_or_else(|| self.config.volume_name());
        let output = self
            .engine(vec!["volume".into(), "rm".into(), "-f".into(), volume.clone()], ENGINE_TIMEOUT)
            .await?;
        if !output.success() {
            tracing::warn!(volume = %volume, stderr = %output.stderr.trim(), "failed to remove sandbox volume");
        }

        *state = SandboxState::new();
        self.store.save(&state)?;
        self.sessions.clear();

        tracing::info!(sandbox_id = %old_id, "destroyed sandbox");
        self.events
            .publish(CoreEvent::SandboxDestroyed { sandbox_id: old_id });
        Ok(())
    }

    /// Runs a shell command inside the environment.
    ///
    /// Never fails for a non-zero exit; inspect [`CommandOutput::exit_code`]
    /// and [`CommandOutput::timed_out`].
    pub async fn exec_in_container(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        self.exec_tracked(argv, options).await
    }

    /// Starts the dev server if it is not running.
    pub async fn start_dev_server(&self) -> Result<DevServerStatus> {
        let mut state = self.state.lock().await;
        let container_id = running_container(&state)?;
        let status = self.launch_dev_server(&container_id).await;
        state.dev_server = Some(status.clone());
        self.store.save(&state)?;
        Ok(status)
    }

    async fn resume(&self, state: &mut SandboxState, container_id: &str) -> Result<SandboxState> {
        state.status = SandboxStatus::Starting;
        self.store.save(state)?;

        if let Err(e) = self
            .engine_checked(vec!["start".into(), container_id.to_string()], ENGINE_TIMEOUT)
            .await
        {
            return Err(self.fail(state, e));
        }

        state.status = SandboxStatus::Running;
        state.started_at = Some(Utc::now());
        state.last_error = None;
        state.touch();
        if self.config.auto_start_server {
            state.dev_server = Some(self.launch_dev_server(container_id).await);
        }
        self.store.save(state)?;

        tracing::info!(container = %container_id, "resumed stopped sandbox");
        self.events.publish(CoreEvent::SandboxStarted {
            sandbox_id: state.id.clone(),
            container_id: container_id.to_string(),
            branch: state.branch.clone().unwrap_or_default(),
            resumed: true,
        });
        Ok(state.clone())
    }

    async fn create(&self, state: &mut SandboxState) -> Result<SandboxState> {
        state.status = SandboxStatus::Starting;
        state.last_error = None;
        self.store.save(state)?;

        if let Err(e) = self.provision(state).await {
            return Err(self.fail(state, e));
        }

        state.status = SandboxStatus::Running;
        state.started_at = Some(Utc::now());
        state.touch();
        self.store.save(state)?;

        let container_id = state.container_id.clone().unwrap_or_default();
        let branch = state.branch.clone().unwrap_or_default();
        tracing::info!(
            sandbox_id = %state.id,
            container = %container_id,
            branch = %branch,
            base = ?state.base_commit,
            "created sandbox"
        );
        self.events.publish(CoreEvent::SandboxStarted {
            sandbox_id: state.id.clone(),
            container_id,
            branch,
            resumed: false,
        });
        Ok(state.clone())
    }

    /// Records a start failure and converts it into `EnvironmentUnavailable`.
    fn fail(&self, state: &mut SandboxState, error: Error) -> Error {
        let message = match error {
            Error::EnvironmentUnavailable(message) => message,
            other => other.to_string(),
        };
        tracing::error!(sandbox_id = %state.id, error = %message, "sandbox start failed");

        state.status = SandboxStatus::Error;
        state.last_error = Some(message.clone());
        if let Err(e) = self.store.save(state) {
            tracing::error!(error = %e, "failed to persist sandbox error state");
        }
        self.events.publish(CoreEvent::SandboxError {
            sandbox_id: state.id.clone(),
            error: message.clone(),
        });
        Error::EnvironmentUnavailable(message)
    }

    async fn provision(&self, state: &mut SandboxState) -> Result<()> {
        self.check_engine().await?;

        let name = self.config.container_name.clone();
        let volume = self.config.volume_name();
        let mount = self.config.mount_point.clone();

        // Leftover from an interrupted run.
        self.remove_container(&name).await;

        self.engine_checked(vec!["volume".into(), "create".into(), volume.clone()], ENGINE_TIMEOUT)
            .await?;
        state.volume_name = Some(volume.clone());

        let output = self
            .engine_checked(self.run_args(&name, &volume), self.config.operation_timeout())
            .await?;
        let container_id = output.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(Error::EnvironmentUnavailable(
                "container engine returned no container id".to_string(),
            ));
        }
        state.container_id = Some(container_id.clone());
        self.store.save(state)?;

        for command in &self.config.setup_commands {
            let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];
            self.exec_checked(state, &container_id, argv).await?;
        }

        self.clone_workspace(state, &container_id).await?;

        let git = |args: &[&str]| -> Vec<String> {
            std::iter::once("git".to_string())
                .chain(args.iter().map(|a| a.to_string()))
                .collect()
        };
        self.exec_checked(
            state,
            &container_id,
            git(&["config", "--global", "--add", "safe.directory", mount.as_str()]),
        )
        .await?;
        self.exec_checked(state, &container_id, git(&["config", "user.email", "sandbox@crucible.local"]))
            .await?;
        self.exec_checked(state, &container_id, git(&["config", "user.name", "crucible sandbox"]))
            .await?;

        let branch = self.generate_branch_name();
        self.exec_checked(state, &container_id, git(&["checkout", "-b", branch.as_str()]))
            .await?;
        let head = self
            .exec_checked(state, &container_id, git(&["rev-parse", "HEAD"]))
            .await?;
        let base = head.stdout.trim().to_string();

        state.branch = Some(branch);
        state.base_commit = Some(base.clone());
        state.last_commit = Some(base);

        if self.config.auto_start_server {
            state.dev_server = Some(self.launch_dev_server(&container_id).await);
        }
        Ok(())
    }

    async fn check_engine(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.engine(args, ENGINE_TIMEOUT).await.map_err(|e| {
            Error::EnvironmentUnavailable(format!(
                "container engine '{}' not available: {}",
                self.config.engine, e
            ))
        })?;
        if !output.success() {
            return Err(Error::EnvironmentUnavailable(format!(
                "container engine '{}' unreachable: {}",
                self.config.engine,
                output.combined().trim()
            )));
        }
        Ok(())
    }

    fn run_args(&self, name: &str, volume: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.to_string(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.to_string(),
            "--pids-limit".into(),
            self.config.pids_limit.to_string(),
        ];
        if !self.config.network_enabled {
            args.push("--network".into());
            args.push("none".into());
        }
        if self.config.auto_start_server {
            args.push("-p".into());
            args.push(format!("{0}:{0}", self.config.server_port));
        }
        args.extend([
            "-v".to_string(),
            format!("{}:{}", volume, self.config.mount_point),
            "-w".to_string(),
            self.config.mount_point.clone(),
            self.config.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }

    /// Copies the workspace into the volume, skipping excluded entries at any
    /// depth, then copies `.git` on its own.
    ///
    /// Directories without excluded descendants are copied whole. The others
    /// are created empty and walked entry by entry.
    async fn clone_workspace(&self, state: &mut SandboxState, container_id: &str) -> Result<()> {
        let root = &self.config.workspace_root;
        let git_dir = root.join(".git");
        if !git_dir.exists() {
            return Err(Error::EnvironmentUnavailable(format!(
                "workspace {} is not a git repository",
                root.display()
            )));
        }

        let mount = self.config.mount_point.trim_end_matches('/').to_string();
        let excludes = &self.config.exclude_paths;
        let mut copied = 0usize;
        let mut pending = vec![(root.to_path_buf(), mount.clone())];
        while let Some((dir, target)) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                if path == git_dir {
                    continue;
                }
                if excludes.iter().any(|p| p == &name) {
                    tracing::debug!(entry = ?path, "skipping excluded workspace entry");
                    continue;
                }
                if entry.file_type()?.is_dir() && contains_excluded(&path, excludes)? {
                    let nested = format!("{}/{}", target, name);
                    let argv = vec!["mkdir".to_string(), "-p".to_string(), nested.clone()];
                    self.exec_checked(state, container_id, argv).await?;
                    pending.push((path, nested));
                    continue;
                }
                self.copy_in(container_id, &path, &format!("{}/", target)).await?;
                copied += 1;
            }
        }

        self.copy_in(container_id, &git_dir, &format!("{}/.git", mount))
            .await?;

        tracing::info!(entries = copied, root = ?root, "cloned workspace into sandbox");
        Ok(())
    }

    async fn copy_in(&self, container_id: &str, host: &Path, target: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            host.to_string_lossy().into_owned(),
            format!("{}:{}", container_id, target),
        ];
        self.engine_checked(args, self.config.operation_timeout())
            .await
            .map(|_| ())
    }

    async fn launch_dev_server(&self, container_id: &str) -> DevServerStatus {
        let args = vec![
            "exec".to_string(),
            "-d".to_string(),
            "-w".to_string(),
            self.config.mount_point.clone(),
            container_id.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            self.config.server_command.clone(),
        ];
        let mut status = DevServerStatus {
            running: false,
            port: self.config.server_port,
            command: self.config.server_command.clone(),
            started_at: None,
            error: None,
        };
        match self.engine_checked(args, ENGINE_TIMEOUT).await {
            Ok(_) => {
                status.running = true;
                status.started_at = Some(Utc::now());
                tracing::info!(port = status.port, "started sandbox dev server");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start sandbox dev server");
                status.error = Some(e.to_string());
            }
        }
        status
    }

    fn generate_branch_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            self.config.branch_prefix,
            Utc::now().format("%Y%m%d%H%M%S"),
            &id[..8]
        )
    }

    /// Returns `Some(running)` if the container exists, `None` if it doesn't.
    async fn inspect_running(&self, container_id: &str) -> Result<Option<bool>> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            container_id.to_string(),
        ];
        let output = self.engine(args, ENGINE_TIMEOUT).await.map_err(|e| {
            Error::EnvironmentUnavailable(format!(
                "container engine '{}' not available: {}",
                self.config.engine, e
            ))
        })?;
        if output.success() {
            return Ok(Some(output.stdout.trim() == "true"));
        }
        if output.stderr.contains("No such") {
            return Ok(None);
        }
        Err(Error::EnvironmentUnavailable(format!(
            "failed to inspect sandbox container: {}",
            output.combined().trim()
        )))
    }

    async fn remove_container(&self, container: &str) {
        match self
            .engine(vec!["rm".into(), "-f".into(), container.to_string()], ENGINE_TIMEOUT)
            .await
        {
            Ok(output) if output.success() => {
                tracing::debug!(container = %container, "removed container");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, container = %container, "failed to remove container"),
        }
    }

    async fn engine(&self, args: Vec<String>, timeout: Duration) -> Result<CommandOutput> {
        let options = RunOptions::default().with_timeout(timeout);
        self.runner.run(&self.config.engine, &args, &options).await
    }

    async fn engine_checked(&self, args: Vec<String>, timeout: Duration) -> Result<CommandOutput> {
        let line = display_command(&self.config.engine, &args);
        self.engine(args, timeout).await?.into_checked(&line, timeout)
    }

    fn exec_args(&self, container_id: &str, cwd: Option<&str>, argv: Vec<String>) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            cwd.unwrap_or(&self.config.mount_point).to_string(),
            container_id.to_string(),
        ];
        args.extend(argv);
        args
    }

    /// Runs during provisioning, while the caller already holds the state.
    async fn exec_checked(
        &self,
        state: &mut SandboxState,
        container_id: &str,
        argv: Vec<String>,
    ) -> Result<CommandOutput> {
        let timeout = self.config.operation_timeout();
        let args = self.exec_args(container_id, None, argv);
        let line = display_command(&self.config.engine, &args);
        let output = self.engine(args, timeout).await?;
        state.execution_count += 1;
        output.into_checked(&line, timeout)
    }

    async fn exec_tracked(&self, argv: Vec<String>, options: ExecOptions) -> Result<CommandOutput> {
        let container_id = {
            let state = self.state.lock().await;
            running_container(&state)?
        };

        let timeout = options.timeout.unwrap_or_else(|| self.config.operation_timeout());
        let args = self.exec_args(&container_id, options.cwd.as_deref(), argv);
        let output = self.engine(args, timeout).await?;

        let mut state = self.state.lock().await;
        state.execution_count += 1;
        state.touch();
        self.store.save(&state)?;
        Ok(output)
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        let argv: Vec<String> = std::iter::once("git".to_string())
            .chain(args.iter().map(|a| a.to_string()))
            .collect();
        let line = display_command("git", &argv[1..]);
        let output = self.exec_tracked(argv, ExecOptions::default()).await?;
        if output.timed_out {
            return output.into_checked(&line, self.config.operation_timeout());
        }
        if !output.success() {
            return Err(Error::Git(format!("{}: {}", line, output.combined().trim())));
        }
        Ok(output)
    }

    /// Resolves a workspace-relative path to its location in the container.
    fn container_path(&self, path: &str) -> Result<String> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || escapes {
            return Err(Error::Config(format!(
                "sandbox path '{}' must be relative to the workspace",
                path
            )));
        }
        Ok(format!(
            "{}/{}",
            self.config.mount_point.trim_end_matches('/'),
            path.trim_start_matches("./")
        ))
    }

    async fn run_validation(&self, command: String) -> Result<CommandOutput> {
        let timeout = self.config.operation_timeout();
        let output = self
            .exec_in_container(&command, ExecOptions::default())
            .await?;
        if output.timed_out {
            return Err(Error::CommandTimeout {
                command,
                timeout,
                partial_output: output.combined(),
            });
        }
        Ok(output)
    }
}

fn running_container(state: &SandboxState) -> Result<String> {
    match (&state.status, &state.container_id) {
        (SandboxStatus::Running, Some(id)) => Ok(id.clone()),
        _ => Err(Error::SandboxNotRunning),
    }
}

/// Quotes a value for inclusion in a `sh -c` command line.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Whether any entry below `dir` has an excluded name. Symlinks are not followed.
fn contains_excluded(dir: &Path, excludes: &[String]) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if excludes.iter().any(|p| name.to_str() == Some(p.as_str())) {
            return Ok(true);
        }
        if entry.file_type()?.is_dir() && contains_excluded(&entry.path(), excludes)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Parses `--name-status -z` output: `STATUS\0PATH\0` records.
fn parse_name_status_z(output: &str) -> Vec<ChangedPath> {
    let mut fields = output.split('\0').filter(|f| !f.is_empty());
    let mut changed = Vec::new();
    while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
        let Some(kind) = ChangeKind::from_git_status(status) else {
            tracing::warn!(status = %status, path = %path, "ignoring unknown change status");
            continue;
        };
        changed.push(ChangedPath {
            path: path.to_string(),
            kind,
            additions: 0,
            deletions: 0,
            binary: false,
        });
    }
    changed
}

/// Parses `--numstat -z` output: `ADDED\tDELETED\tPATH\0` records.
/// Binary files report `-` for both counts.
fn parse_numstat_z(output: &str) -> Vec<(String, Option<(u32, u32)>)> {
    output
        .split('\0')
        .filter_map(|record| {
            let mut parts = record.splitn(3, '\t');
            let (added, removed, path) = (parts.next()?, parts.next()?, parts.next()?);
            if path.is_empty() {
                return None;
            }
            let counts = match (added.parse(), removed.parse()) {
                (Ok(a), Ok(d)) => Some((a, d)),
                _ => None,
            };
            Some((path.to_string(), counts))
        })
        .collect()
}

#[async_trait]
impl Sandbox for SandboxManager {
    async fn sandbox_id(&self) -> String {
        self.state.lock().await.id.clone()
    }

    async fn ensure_running(&self) -> Result<()> {
        self.start().await.map(|_| ())
    }

    async fn start_session(&self, purpose: &str) -> Result<ReflectionSession> {
        {
            let state = self.state.lock().await;
            running_container(&state)?;
        }
        let session = self.sessions.start(purpose);
        tracing::info!(session_id = %session.id, purpose = %purpose, "started reflection session");
        self.events.publish(CoreEvent::SessionStarted {
            session_id: session.id.clone(),
            purpose: purpose.to_string(),
        });
        Ok(session)
    }

    async fn record_modification(&self, session_id: &str, preview: ModificationPreview) -> Result<()> {
        self.sessions.record_modification(session_id, preview)
    }

    async fn complete_session(
        &self,
        session_id: &str,
        completion: SessionCompletion,
    ) -> Result<ReflectionSession> {
        let session = self.sessions.complete(session_id, completion)?;
        tracing::info!(
            session_id = %session.id,
            status = %session.status,
            commit = ?session.final_commit,
            "completed reflection session"
        );
        self.events.publish(CoreEvent::SessionCompleted {
            session_id: session.id.clone(),
            status: session.status.to_string(),
            commit: session.final_commit.clone(),
        });
        Ok(session)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.container_path(path)?;
        let container_id = {
            let state = self.state.lock().await;
            running_container(&state)?
        };

        let staged = tempfile::NamedTempFile::new()?;
        tokio::fs::write(staged.path(), content).await?;

        if let Some(parent) = Path::new(&target).parent() {
            let argv = vec![
                "mkdir".to_string(),
                "-p".to_string(),
                parent.to_string_lossy().into_owned(),
            ];
            let line = display_command("mkdir", &argv[1..]);
            self.exec_tracked(argv, ExecOptions::default())
                .await?
                .into_checked(&line, self.config.operation_timeout())?;
        }

        self.copy_in(&container_id, staged.path(), &target).await?;
        tracing::debug!(path = %path, bytes = content.len(), "wrote sandbox file");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let source = self.container_path(path)?;
        let container_id = {
            let state = self.state.lock().await;
            running_container(&state)?
        };

        let staging = tempfile::TempDir::new()?;
        let local: PathBuf = staging.path().join("content");
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", container_id, source),
            local.to_string_lossy().into_owned(),
        ];
        self.engine_checked(args, self.config.operation_timeout())
            .await?;
        Ok(tokio::fs::read_to_string(&local).await?)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let target = self.container_path(path)?;
        let argv = vec!["rm".to_string(), "-f".to_string(), target];
        let line = display_command("rm", &argv[1..]);
        self.exec_tracked(argv, ExecOptions::default())
            .await?
            .into_checked(&line, self.config.operation_timeout())?;
        Ok(())
    }

    async fn type_check(&self) -> Result<TypeCheckResult> {
        let output = self
            .run_validation(self.config.type_check_command.clone())
            .await?;
        Ok(self.check_parser.parse(&output))
    }

    async fn run_tests(&self, pattern: Option<&str>) -> Result<TestResult> {
        let command = match pattern {
            Some(pattern) => format!("{} {}", self.config.test_command, shell_quote(pattern)),
            None => self.config.test_command.clone(),
        };
        let output = self.run_validation(command).await?;
        Ok(self.test_parser.parse(&output))
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "--allow-empty", "-m", message]).await?;
        let hash = self.git(&["rev-parse", "HEAD"]).await?.stdout.trim().to_string();

        let mut state = self.state.lock().await;
        state.last_commit = Some(hash.clone());
        state.touch();
        self.store.save(&state)?;

        tracing::info!(commit = %hash, "committed sandbox changes");
        Ok(hash)
    }

    async fn get_diff(&self, path: Option<&str>) -> Result<String> {
        let base = self
            .state
            .lock()
            .await
            .base_commit
            .clone()
            .ok_or_else(|| Error::Git("sandbox has no base commit".to_string()))?;

        // Make untracked files visible to `git diff`.
        self.git(&["add", "--intent-to-add", "--", "."]).await?;

        let output = match path {
            Some(path) => self.git(&["diff", base.as_str(), "--", path]).await?,
            None => self.git(&["diff", base.as_str()]).await?,
        };
        Ok(output.stdout)
    }

    async fn changed_files(&self, commit: &str) -> Result<Vec<ChangedPath>> {
        let base_args = ["diff-tree", "--no-commit-id", "-r", "--root", "--no-renames", "-z"];

        let mut status_args = base_args.to_vec();
        status_args.extend(["--name-status", commit]);
        let statuses = self.git(&status_args).await?.stdout;

        let mut numstat_args = base_args.to_vec();
        numstat_args.extend(["--numstat", commit]);
        let numstats = self.git(&numstat_args).await?.stdout;

        let mut changed = parse_name_status_z(&statuses);
        for (path, counts) in parse_numstat_z(&numstats) {
            let Some(entry) = changed.iter_mut().find(|c| c.path == path) else {
                continue;
            };
            match counts {
                Some((additions, deletions)) => {
                    entry.additions = additions;
                    entry.deletions = deletions;
                }
                None => entry.binary = true,
            }
        }

        Ok(changed)
    }

    async fn commit_diff(&self, commit: &str, paths: &[String]) -> Result<String> {
        if paths.is_empty() {
            return Ok(String::new());
        }
        let mut args = vec!["diff-tree", "-p", "--no-commit-id", "--root", "--no-renames", commit, "--"];
        args.extend(paths.iter().map(String::as_str));
        Ok(self.git(&args).await?.stdout)
    }

    async fn show_file(&self, commit: &str, path: &str) -> Result<String> {
        let object = format!("{}:{}", commit, path);
        Ok(self.git(&["show", object.as_str()]).await?.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// In-memory stand-in for the container engine.
    #[derive(Default)]
    struct FakeEngine {
        files: StdMutex<HashMap<String, Vec<u8>>>,
        calls: StdMutex<Vec<Vec<String>>>,
        running: StdMutex<Option<bool>>,
        unreachable: bool,
        name_status: String,
        numstat: String,
    }

    impl FakeEngine {
        fn count(&self, pred: impl Fn(&[String]) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeEngine {
        async fn run(&self, _program: &str, args: &[String], _options: &RunOptions) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            if self.unreachable {
                return Ok(CommandOutput::failed(1, "Cannot connect to the Docker daemon"));
            }
            let output = match args[0].as_str() {
                "version" => CommandOutput::ok("27.0.1\n"),
                "run" => {
                    *self.running.lock().unwrap() = Some(true);
                    CommandOutput::ok("cid123\n")
                }
                "inspect" => match *self.running.lock().unwrap() {
                    Some(running) => CommandOutput::ok(format!("{}\n", running)),
                    None => CommandOutput::failed(1, "Error: No such object: cid123"),
                },
                "start" => {
                    *self.running.lock().unwrap() = Some(true);
                    CommandOutput::ok("cid123\n")
                }
                "stop" => {
                    *self.running.lock().unwrap() = Some(false);
                    CommandOutput::ok("cid123\n")
                }
                "rm" => {
                    *self.running.lock().unwrap() = None;
                    CommandOutput::ok("")
                }
                "cp" => {
                    let (src, dest) = (&args[1], &args[2]);
                    if let Some((_, container_path)) = src.split_once(':') {
                        match self.files.lock().unwrap().get(container_path) {
                            Some(bytes) => {
                                std::fs::write(dest, bytes).unwrap();
                                CommandOutput::ok("")
                            }
                            None => CommandOutput::failed(1, "No such container:path"),
                        }
                    } else {
                        let (_, container_path) = dest.split_once(':').unwrap();
                        if Path::new(src).is_file() {
                            let bytes = std::fs::read(src).unwrap();
                            self.files.lock().unwrap().insert(container_path.to_string(), bytes);
                        }
                        CommandOutput::ok("")
                    }
                }
                "exec" => {
                    let argv = &args[4..];
                    match argv.first().map(String::as_str) {
                        Some("git") if argv.get(1).map(String::as_str) == Some("rev-parse") => {
                            CommandOutput::ok("abc123\n")
                        }
                        Some("git") if argv.iter().any(|a| a == "--name-status") => {
                            CommandOutput::ok(self.name_status.clone())
                        }
                        Some("git") if argv.iter().any(|a| a == "--numstat") => {
                            CommandOutput::ok(self.numstat.clone())
                        }
                        Some("sh") if argv.get(2).is_some_and(|c| c.starts_with("npm test")) => {
                            CommandOutput::failed(1, "Tests:       1 failed, 2 passed, 3 total\n")
                        }
                        _ => CommandOutput::ok(""),
                    }
                }
                _ => CommandOutput::ok(""),
            };
            Ok(output)
        }
    }

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("src/app.ts"), "export const x = 1;\n").unwrap();
        dir
    }

    fn manager(
        engine: Arc<FakeEngine>,
        workspace: &Path,
        state_dir: &Path,
    ) -> (SandboxManager, Arc<RecordingSink>) {
        let config = SandboxConfig {
            workspace_root: workspace.to_path_buf(),
            ..Default::default()
        };
        let events = Arc::new(RecordingSink::new());
        let manager = SandboxManager::new(config, state_dir, engine, events.clone()).unwrap();
        (manager, events)
    }

    #[tokio::test]
    async fn start_creates_container_branch_and_persists_state() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, events) = manager(engine.clone(), ws.path(), state_dir.path());

        let state = manager.start().await.unwrap();

        assert_eq!(state.status, SandboxStatus::Running);
        assert_eq!(state.container_id.as_deref(), Some("cid123"));
        assert!(state.branch.as_deref().unwrap().starts_with("sandbox-"));
        assert_eq!(state.base_commit.as_deref(), Some("abc123"));
        assert!(state.execution_count > 0);
        assert_eq!(events.names(), vec!["sandbox_started"]);

        // node_modules is excluded, .git is copied on its own
        let copies: Vec<Vec<String>> = engine
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c[0] == "cp")
            .cloned()
            .collect();
        assert!(copies.iter().all(|c| !c[1].ends_with("node_modules")));
        assert!(copies.iter().any(|c| c[2] == "cid123:/workspace/.git"));
        assert!(copies.iter().any(|c| c[1].ends_with("src")));

        let persisted = StateStore::new(state_dir.path().join("sandbox-state.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(persisted, state);
    }

    #[tokio::test]
    async fn start_is_idempotent_when_running() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());

        let first = manager.start().await.unwrap();
        let second = manager.start().await.unwrap();

        assert_eq!(engine.count(|c| c[0] == "run"), 1);
        assert_eq!(
            engine.count(|c| c[0] == "exec" && c.get(5).map(String::as_str) == Some("checkout")),
            1
        );

        let mut normalized = second.clone();
        normalized.last_used_at = first.last_used_at;
        assert_eq!(normalized, first);
    }

    #[tokio::test]
    async fn start_resumes_stopped_container_in_place() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, events) = manager(engine.clone(), ws.path(), state_dir.path());

        let created = manager.start().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.status().await.status, SandboxStatus::Stopped);

        let resumed = manager.start().await.unwrap();
        assert_eq!(resumed.status, SandboxStatus::Running);
        assert_eq!(resumed.branch, created.branch);
        assert_eq!(engine.count(|c| c[0] == "run"), 1);
        assert_eq!(engine.count(|c| c[0] == "start"), 1);
        assert_eq!(
            events.names(),
            vec!["sandbox_started", "sandbox_stopped", "sandbox_started"]
        );
    }

    #[tokio::test]
    async fn restart_reattaches_from_persisted_state() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());

        let created = {
            let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
            manager.start().await.unwrap()
        };

        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
        let reattached = manager.start().await.unwrap();
        assert_eq!(reattached.id, created.id);
        assert_eq!(engine.count(|c| c[0] == "run"), 1);
    }

    #[tokio::test]
    async fn unreachable_engine_marks_error_state() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine {
            unreachable: true,
            ..Default::default()
        });
        let (manager, events) = manager(engine, ws.path(), state_dir.path());

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::EnvironmentUnavailable(_)));

        let state = manager.status().await;
        assert_eq!(state.status, SandboxStatus::Error);
        assert!(state.last_error.unwrap().contains("Docker daemon"));
        assert_eq!(events.names(), vec!["sandbox_error"]);
    }

    #[tokio::test]
    async fn workspace_without_git_fails_to_start() {
        let ws = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let (manager, _) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());

        let err = manager.start().await.unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
        assert_eq!(manager.status().await.status, SandboxStatus::Error);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_exact_content() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let (manager, _) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        let content = "const s = \"quoted 'inner'\";\n\tline two\n\nlast $HOME `x`";
        manager.write_file("src/new/file.ts", content).await.unwrap();
        let read = manager.read_file("src/new/file.ts").await.unwrap();
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn file_operations_require_running_sandbox() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let (manager, _) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());

        let err = manager.write_file("a.ts", "x").await.unwrap_err();
        assert!(matches!(err, Error::SandboxNotRunning));
        let err = manager
            .exec_in_container("ls", ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SandboxNotRunning));
    }

    #[tokio::test]
    async fn paths_escaping_the_workspace_are_rejected() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let (manager, _) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        assert!(manager.write_file("../etc/passwd", "x").await.is_err());
        assert!(manager.write_file("/etc/passwd", "x").await.is_err());
        assert_eq!(
            manager.container_path("./src/a.ts").unwrap(),
            "/workspace/src/a.ts"
        );
    }

    #[tokio::test]
    async fn exec_counts_executions_and_returns_non_zero_exit() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let (manager, _) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());
        let before = manager.start().await.unwrap().execution_count;

        manager
            .exec_in_container("true", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(manager.status().await.execution_count, before + 1);
    }

    #[tokio::test]
    async fn commit_updates_last_commit() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        let hash = manager.commit("iteration 1").await.unwrap();
        assert_eq!(hash, "abc123");
        assert_eq!(manager.status().await.last_commit.as_deref(), Some("abc123"));
        assert_eq!(
            engine.count(|c| c.len() > 6 && c[5] == "commit" && c[6] == "--allow-empty"),
            1
        );
    }

    #[tokio::test]
    async fn destroy_resets_state() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, events) = manager(engine.clone(), ws.path(), state_dir.path());
        let created = manager.start().await.unwrap();

        manager.destroy().await.unwrap();

        let state = manager.status().await;
        assert_ne!(state.id, created.id);
        assert_eq!(state.status, SandboxStatus::Stopped);
        assert!(state.container_id.is_none());
        assert_eq!(state.execution_count, 0);
        assert_eq!(engine.count(|c| c[0] == "volume" && c[1] == "rm"), 1);
        assert_eq!(events.names().last(), Some(&"sandbox_destroyed"));
    }

    #[tokio::test]
    async fn sessions_require_running_sandbox_and_publish_events() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let (manager, events) = manager(Arc::new(FakeEngine::default()), ws.path(), state_dir.path());

        assert!(manager.start_session("early").await.is_err());

        manager.start().await.unwrap();
        let session = manager.start_session("fix login").await.unwrap();
        manager
            .complete_session(
                &session.id,
                SessionCompletion {
                    status: crate::sandbox::SessionStatus::Completed,
                    iterations: 1,
                    final_commit: Some("abc123".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            events.names(),
            vec!["sandbox_started", "session_started", "session_completed"]
        );
        assert!(state_dir.path().join("sessions.jsonl").exists());
    }

    #[tokio::test]
    async fn run_tests_parses_output_and_quotes_pattern() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        let result = manager.run_tests(Some("login flow")).await.unwrap();
        assert!(!result.success);
        assert_eq!((result.passed, result.failed, result.total), (2, 1, 3));
        assert_eq!(
            engine.count(|c| c.last().map(String::as_str) == Some("npm test --silent 'login flow'")),
            1
        );

        let check = manager.type_check().await.unwrap();
        assert!(check.passed);
    }

    #[tokio::test]
    async fn dev_server_starts_detached_and_is_recorded() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());

        assert!(matches!(
            manager.start_dev_server().await,
            Err(Error::SandboxNotRunning)
        ));

        manager.start().await.unwrap();
        let server = manager.start_dev_server().await.unwrap();
        assert!(server.running);
        assert_eq!(server.port, 3000);
        assert_eq!(engine.count(|c| c[0] == "exec" && c[1] == "-d"), 1);
        assert_eq!(manager.status().await.dev_server, Some(server));
    }

    #[tokio::test]
    async fn changed_files_reads_nul_separated_git_output() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine {
            name_status: "A\0src/new.ts\0M\0src/app.ts\0D\0old.txt\0M\0logo.png\0A\0notes\tdraft.md\0X\0odd\0"
                .to_string(),
            numstat: "12\t0\tsrc/new.ts\03\t1\tsrc/app.ts\00\t7\told.txt\0-\t-\tlogo.png\02\t0\tnotes\tdraft.md\0"
                .to_string(),
            ..Default::default()
        });
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        let changed = manager.changed_files("def456").await.unwrap();

        let summary: Vec<(&str, ChangeKind, u32, u32, bool)> = changed
            .iter()
            .map(|c| (c.path.as_str(), c.kind, c.additions, c.deletions, c.binary))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("src/new.ts", ChangeKind::Added, 12, 0, false),
                ("src/app.ts", ChangeKind::Modified, 3, 1, false),
                ("old.txt", ChangeKind::Deleted, 0, 7, false),
                ("logo.png", ChangeKind::Modified, 0, 0, true),
                ("notes\tdraft.md", ChangeKind::Added, 2, 0, false),
            ]
        );
        assert_eq!(
            engine.count(|c| c.len() > 5 && c[5] == "diff-tree" && c.iter().any(|a| a == "-z")),
            2
        );
    }

    #[tokio::test]
    async fn get_diff_compares_against_the_base_commit() {
        let ws = workspace();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());
        manager.start().await.unwrap();

        manager.get_diff(None).await.unwrap();
        manager.get_diff(Some("src/app.ts")).await.unwrap();

        assert_eq!(
            engine.count(|c| c.len() > 6 && c[5] == "add" && c[6] == "--intent-to-add"),
            2
        );
        assert_eq!(engine.count(|c| c.len() == 7 && c[5] == "diff" && c[6] == "abc123"), 1);
        assert_eq!(
            engine.count(|c| c.len() == 9 && c[5] == "diff" && c[6] == "abc123" && c[8] == "src/app.ts"),
            1
        );
    }

    #[tokio::test]
    async fn nested_excluded_directories_are_not_copied() {
        let ws = workspace();
        let web = ws.path().join("packages/web");
        std::fs::create_dir_all(web.join("node_modules/react")).unwrap();
        std::fs::write(web.join("node_modules/react/index.js"), "module.exports = {};\n").unwrap();
        std::fs::write(web.join("index.js"), "console.log('web');\n").unwrap();
        std::fs::create_dir_all(ws.path().join("docs")).unwrap();
        std::fs::write(ws.path().join("docs/readme.md"), "# docs\n").unwrap();
        let state_dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (manager, _) = manager(engine.clone(), ws.path(), state_dir.path());

        manager.start().await.unwrap();

        let copies: Vec<Vec<String>> = engine
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c[0] == "cp")
            .cloned()
            .collect();
        assert!(copies.iter().all(|c| !c[1].contains("node_modules")));
        assert!(copies
            .iter()
            .any(|c| c[1].ends_with("index.js") && c[2] == "cid123:/workspace/packages/web/"));
        assert!(copies
            .iter()
            .any(|c| c[1].ends_with("docs") && c[2] == "cid123:/workspace/"));
        assert!(!copies.iter().any(|c| c[1].ends_with("packages")));

        let files = engine.files.lock().unwrap();
        assert!(files.keys().all(|k| !k.contains("node_modules")));
        assert_eq!(
            engine.count(|c| c.len() > 6 && c[4] == "mkdir" && c[6] == "/workspace/packages/web"),
            1
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}

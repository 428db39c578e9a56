//! File operations against the production workspace.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::{display_command, CommandRunner, RunOptions};
use crate::error::{Error, Result};
use crate::parser::{ResultParser, TestOutputParser, TestResult};

/// Where the pre-change content of a file was saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    /// Path relative to the workspace root.
    pub path: String,
    /// Copy of the previous content. `None` means the file did not exist,
    /// so restoring deletes it.
    pub backup_path: Option<PathBuf>,
}

/// Mutates the production workspace with restorable backups.
#[async_trait]
pub trait FileMutator: Send + Sync {
    /// Writes a new file. An existing file is backed up first.
    async fn create_file(&self, path: &str, content: &str) -> Result<BackupRef>;

    /// Replaces a file's content after backing it up.
    async fn edit_file(&self, path: &str, content: &str) -> Result<BackupRef>;

    /// Removes a file after backing it up.
    async fn delete_file(&self, path: &str) -> Result<BackupRef>;

    /// Puts a file back the way it was before the change.
    async fn restore_backup(&self, backup: &BackupRef) -> Result<()>;

    /// Runs the production test suite.
    async fn run_tests(&self) -> Result<TestResult>;

    /// Commits `paths` with `message`. Returns the commit hash.
    async fn commit(&self, message: &str, paths: &[String]) -> Result<String>;
}

/// [`FileMutator`] over a local git checkout.
pub struct WorkspaceMutator {
    root: PathBuf,
    backup_dir: PathBuf,
    test_command: String,
    test_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl WorkspaceMutator {
    /// Creates a mutator for the workspace at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        test_command: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            test_command: test_command.into(),
            test_timeout: Duration::from_secs(300),
            runner,
        }
    }

    /// Sets the production test timeout.
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || escapes {
            return Err(Error::PartialApplyFailure {
                path: path.to_string(),
                reason: "path must be relative to the workspace".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn backup(&self, path: &str, target: &Path) -> Result<BackupRef> {
        if !tokio::fs::try_exists(target).await? {
            return Ok(BackupRef {
                path: path.to_string(),
                backup_path: None,
            });
        }

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", &id[..12], path.replace(['/', '\\'], "__"));
        let backup_path = self.backup_dir.join(name);
        tokio::fs::copy(target, &backup_path).await?;

        tracing::debug!(path = %path, backup = ?backup_path, "backed up production file");
        Ok(BackupRef {
            path: path.to_string(),
            backup_path: Some(backup_path),
        })
    }

    async fn write(&self, path: &str, content: &str) -> Result<BackupRef> {
        let target = self.resolve(path)?;
        let backup = self.backup(path, &target).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(backup)
    }

    async fn git(&self, args: &[String]) -> Result<String> {
        let options = RunOptions::default()
            .with_cwd(&self.root)
            .with_timeout(Duration::from_secs(60));
        let output = self.runner.run("git", args, &options).await?;
        if !output.success() {
            return Err(Error::Git(format!(
                "{}: {}",
                display_command("git", args),
                output.combined().trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl FileMutator for WorkspaceMutator {
    async fn create_file(&self, path: &str, content: &str) -> Result<BackupRef> {
        self.write(path, content).await
    }

    async fn edit_file(&self, path: &str, content: &str) -> Result<BackupRef> {
        self.write(path, content).await
    }

    async fn delete_file(&self, path: &str) -> Result<BackupRef> {
        let target = self.resolve(path)?;
        let backup = self.backup(path, &target).await?;
        if backup.backup_path.is_some() {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(backup)
    }

    async fn restore_backup(&self, backup: &BackupRef) -> Result<()> {
        let target = self.resolve(&backup.path)?;
        match &backup.backup_path {
            Some(saved) => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(saved, &target).await?;
            }
            None => match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        tracing::debug!(path = %backup.path, "restored production file");
        Ok(())
    }

    async fn run_tests(&self) -> Result<TestResult> {
        let args = vec!["-c".to_string(), self.test_command.clone()];
        let options = RunOptions::default()
            .with_cwd(&self.root)
            .with_timeout(self.test_timeout);
        let output = self.runner.run("sh", &args, &options).await?;
        if output.timed_out {
            tracing::warn!(command = %self.test_command, "production tests timed out");
        }
        Ok(TestOutputParser.parse(&output))
    }

    async fn commit(&self, message: &str, paths: &[String]) -> Result<String> {
        let mut add = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
        add.extend(paths.iter().cloned());
        self.git(&add).await?;

        let mut commit = vec![
            "commit".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--".to_string(),
        ];
        commit.extend(paths.iter().cloned());
        self.git(&commit).await?;

        let hash = self
            .git(&["rev-parse".to_string(), "HEAD".to_string()])
            .await?
            .trim()
            .to_string();
        tracing::info!(commit = %hash, files = paths.len(), "committed production changes");
        Ok(hash)
    }
}

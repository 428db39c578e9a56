//! Promotion of validated sandbox commits into the production workspace.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::HandoffConfig;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventSink};
use crate::reflection::ReflectionResult;
use crate::sandbox::{ChangeKind, Sandbox};

use super::artifact::{
    filter_diff, ArtifactStatus, FileChange, HandoffArtifact, HandoffResult, ReviewResult,
    RollbackResult,
};
use super::mutator::{BackupRef, FileMutator};
use super::store::ArtifactStore;

/// Review gate and executor for handoff artifacts.
///
/// State transitions are serialized; a second call waits for the first.
pub struct HandoffProtocol {
    config: HandoffConfig,
    protected: Vec<String>,
    store: ArtifactStore,
    sandbox: Arc<dyn Sandbox>,
    mutator: Arc<dyn FileMutator>,
    events: Arc<dyn EventSink>,
    lock: Mutex<()>,
}

impl HandoffProtocol {
    pub fn new(
        config: HandoffConfig,
        store: ArtifactStore,
        sandbox: Arc<dyn Sandbox>,
        mutator: Arc<dyn FileMutator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let protected = config.effective_protected_paths();
        Self {
            config,
            protected,
            store,
            sandbox,
            mutator,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Returns the protected path substring matching `path`, if any.
    pub fn protected_match(&self, path: &str) -> Option<&str> {
        self.protected
            .iter()
            .find(|pattern| path.contains(pattern.as_str()))
            .map(String::as_str)
    }

    /// Packages a successful reflection result as a pending artifact.
    pub async fn prepare(&self, result: &ReflectionResult) -> Result<HandoffArtifact> {
        if !result.ready_for_promotion {
            return Err(Error::NotReadyForPromotion(format!(
                "task {} ended {}",
                result.task_id, result.status
            )));
        }
        let commit = result.commit_hash.clone().ok_or_else(|| {
            Error::NotReadyForPromotion(format!("task {} has no commit", result.task_id))
        })?;

        let _guard = self.lock.lock().await;
        let now = Utc::now();
        self.store.purge_expired(now)?;
        self.store.trim(self.config.max_artifacts)?;

        let mut files = Vec::new();
        for changed in self.sandbox.changed_files(&commit).await? {
            if let Some(pattern) = self.protected_match(&changed.path) {
                tracing::warn!(
                    path = %changed.path,
                    pattern = %pattern,
                    "excluding protected path from artifact"
                );
                continue;
            }
            if changed.binary && changed.kind != ChangeKind::Deleted {
                return Err(Error::BinaryFile(format!(
                    "{} in commit {}",
                    changed.path, commit
                )));
            }
            let content = match changed.kind {
                ChangeKind::Deleted => None,
                ChangeKind::Added | ChangeKind::Modified => {
                    Some(self.sandbox.show_file(&commit, &changed.path).await?)
                }
            };
            files.push(FileChange {
                path: changed.path,
                change_type: changed.kind,
                content,
                additions: changed.additions,
                deletions: changed.deletions,
            });
        }

        if files.is_empty() {
            return Err(Error::NothingToPromote(format!(
                "commit {} changes no promotable files",
                commit
            )));
        }

        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let diff = self.sandbox.commit_diff(&commit, &paths).await?;

        let ttl = chrono::Duration::from_std(self.config.artifact_ttl())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let artifact = HandoffArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            sandbox_id: result.sandbox_id.clone(),
            session_id: result.session_id.clone(),
            commit_hash: commit,
            objective: result.objective.clone(),
            files,
            diff,
            test_result: result.final_test_result.clone(),
            type_check_passed: result.type_check_passed,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            status: ArtifactStatus::Pending,
            metadata: Default::default(),
        };
        self.store.save(&artifact)?;

        tracing::info!(
            artifact_id = %artifact.id,
            commit = %artifact.commit_hash,
            files = artifact.files.len(),
            expires_at = %artifact.expires_at,
            "prepared handoff artifact"
        );
        self.events.publish(CoreEvent::ArtifactPrepared {
            artifact_id: artifact.id.clone(),
            files: artifact.files.len(),
        });
        Ok(artifact)
    }

    /// Records a review decision on a pending artifact.
    pub async fn review(&self, id: &str, review: ReviewResult) -> Result<HandoffArtifact> {
        let _guard = self.lock.lock().await;
        let mut artifact = self.store.get(id)?;
        self.expire_if_stale(&mut artifact, "reviewed")?;
        if artifact.status != ArtifactStatus::Pending {
            return Err(not_approvable(&artifact, "reviewed"));
        }

        if review.approved {
            if let Some(subset) = &review.approved_files {
                artifact.files.retain(|f| subset.contains(&f.path));
                if artifact.files.is_empty() {
                    return Err(Error::NothingToPromote(format!(
                        "no approved file belongs to artifact {}",
                        id
                    )));
                }
                artifact.diff = filter_diff(&artifact.diff, &artifact.paths());
            }
            artifact.status = ArtifactStatus::Approved;
        } else {
            artifact.status = ArtifactStatus::Expired;
        }

        tracing::info!(
            artifact_id = %id,
            approved = review.approved,
            reviewer = %review.reviewer,
            files = artifact.files.len(),
            "reviewed handoff artifact"
        );
        self.events.publish(CoreEvent::ArtifactReviewed {
            artifact_id: id.to_string(),
            approved: review.approved,
            reviewer: review.reviewer.clone(),
        });
        artifact.metadata.review = Some(review);
        self.store.save(&artifact)?;
        Ok(artifact)
    }

    /// Applies an artifact to the production workspace.
    ///
    /// Requires an approved artifact unless `force` is set or approval is
    /// disabled, in which case a pending one is accepted too.
    pub async fn execute(&self, id: &str, force: bool) -> Result<HandoffResult> {
        let _guard = self.lock.lock().await;
        let mut artifact = self.store.get(id)?;

        let allowed = match artifact.status {
            ArtifactStatus::Approved => true,
            ArtifactStatus::Pending => force || !self.config.require_approval,
            _ => false,
        };
        if !allowed {
            return Err(not_approvable(&artifact, "executed"));
        }
        self.expire_if_stale(&mut artifact, "executed")?;

        artifact.status = ArtifactStatus::Executing;
        self.store.save(&artifact)?;
        tracing::info!(artifact_id = %id, files = artifact.files.len(), force, "executing handoff artifact");

        let started = Instant::now();
        let mut backups: Vec<BackupRef> = Vec::new();
        let mut applied = Vec::new();
        let mut failed = Vec::new();
        let mut errors = Vec::new();

        for file in &artifact.files {
            let outcome = match (file.change_type, &file.content) {
                (ChangeKind::Deleted, _) => self.mutator.delete_file(&file.path).await,
                (ChangeKind::Added, Some(content)) => {
                    self.mutator.create_file(&file.path, content).await
                }
                (ChangeKind::Modified, Some(content)) => {
                    self.mutator.edit_file(&file.path, content).await
                }
                (_, None) => Err(Error::PartialApplyFailure {
                    path: file.path.clone(),
                    reason: "no content recorded".to_string(),
                }),
            };
            match outcome {
                Ok(backup) => {
                    backups.push(backup);
                    applied.push(file.path.clone());
                }
                Err(e) => {
                    tracing::warn!(artifact_id = %id, path = %file.path, error = %e, "failed to apply file");
                    let error = match e {
                        Error::PartialApplyFailure { .. } => e,
                        other => Error::PartialApplyFailure {
                            path: file.path.clone(),
                            reason: other.to_string(),
                        },
                    };
                    errors.push(error.to_string());
                    failed.push(file.path.clone());
                }
            }
        }

        artifact.metadata.backups = backups.clone();
        artifact.metadata.executed_at = Some(Utc::now());
        self.store.save(&artifact)?;

        let mut validated = true;
        if self.config.run_production_tests && !applied.is_empty() {
            let failure = match self.mutator.run_tests().await {
                Ok(tests) if tests.success => None,
                Ok(tests) if tests.total > 0 => Some(format!(
                    "{} of {} production tests failed",
                    tests.failed, tests.total
                )),
                Ok(_) => Some("production test command failed".to_string()),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                validated = false;
                tracing::warn!(artifact_id = %id, reason = %reason, "production validation failed");
                errors.push(Error::ProductionValidationFailed(reason).to_string());

                if self.config.auto_rollback {
                    let (restored, restore_errors) = self.restore(&backups).await;
                    errors.extend(restore_errors.iter().cloned());
                    artifact.metadata.rollback = Some(RollbackResult {
                        artifact_id: id.to_string(),
                        success: restore_errors.is_empty(),
                        expected: backups.len(),
                        restored,
                        errors: restore_errors,
                        revert_commit: None,
                        automatic: true,
                        rolled_back_at: Utc::now(),
                    });
                    artifact.status = ArtifactStatus::Failed;
                    self.store.save(&artifact)?;

                    tracing::info!(artifact_id = %id, restored, expected = backups.len(), "rolled back after failed validation");
                    self.events.publish(CoreEvent::RolledBack {
                        artifact_id: id.to_string(),
                        restored,
                        expected: backups.len(),
                    });
                    self.events.publish(CoreEvent::Executed {
                        artifact_id: id.to_string(),
                        success: false,
                        production_commit: None,
                    });
                    return Ok(HandoffResult {
                        artifact_id: id.to_string(),
                        success: false,
                        files_applied: Vec::new(),
                        files_failed: failed,
                        production_commit: None,
                        backups,
                        errors,
                        duration: started.elapsed(),
                        can_rollback: false,
                    });
                }
            }
        }

        let mut production_commit = None;
        if validated && self.config.auto_commit && !applied.is_empty() {
            let message = format!("handoff: {}\n\nArtifact: {}\nSandbox commit: {}", artifact.objective, id, artifact.commit_hash);
            match self.mutator.commit(&message, &applied).await {
                Ok(hash) => production_commit = Some(hash),
                Err(e) => {
                    tracing::warn!(artifact_id = %id, error = %e, "failed to commit production changes");
                    errors.push(format!("commit failed: {}", e));
                }
            }
        }

        let success = errors.is_empty();
        artifact.status = if failed.is_empty() {
            ArtifactStatus::Completed
        } else {
            ArtifactStatus::Failed
        };
        artifact.metadata.production_commit = production_commit.clone();
        self.store.save(&artifact)?;

        tracing::info!(
            artifact_id = %id,
            success,
            applied = applied.len(),
            failed = failed.len(),
            commit = ?production_commit,
            "executed handoff artifact"
        );
        self.events.publish(CoreEvent::Executed {
            artifact_id: id.to_string(),
            success,
            production_commit: production_commit.clone(),
        });

        Ok(HandoffResult {
            artifact_id: id.to_string(),
            success,
            files_applied: applied,
            files_failed: failed,
            production_commit,
            can_rollback: !backups.is_empty(),
            backups,
            errors,
            duration: started.elapsed(),
        })
    }

    /// Restores the production files an execution changed. Allowed once.
    pub async fn rollback(&self, id: &str) -> Result<RollbackResult> {
        let _guard = self.lock.lock().await;
        let mut artifact = self.store.get(id)?;

        if !matches!(
            artifact.status,
            ArtifactStatus::Completed | ArtifactStatus::Failed
        ) {
            return Err(Error::NotRollbackable {
                id: id.to_string(),
                reason: format!("artifact is {}", artifact.status),
            });
        }
        if artifact.metadata.rollback.is_some() {
            return Err(Error::NotRollbackable {
                id: id.to_string(),
                reason: "already rolled back".to_string(),
            });
        }
        let backups = artifact.metadata.backups.clone();
        if backups.is_empty() {
            return Err(Error::NotRollbackable {
                id: id.to_string(),
                reason: "no backups recorded".to_string(),
            });
        }

        let (restored, mut errors) = self.restore(&backups).await;

        let mut revert_commit = None;
        if let Some(commit) = &artifact.metadata.production_commit {
            let paths: Vec<String> = backups.iter().map(|b| b.path.clone()).collect();
            let message = format!("Revert handoff {}\n\nReverts production commit {}", id, commit);
            match self.mutator.commit(&message, &paths).await {
                Ok(hash) => revert_commit = Some(hash),
                Err(e) => errors.push(format!("revert commit failed: {}", e)),
            }
        }

        let result = RollbackResult {
            artifact_id: id.to_string(),
            success: errors.is_empty(),
            expected: backups.len(),
            restored,
            errors,
            revert_commit,
            automatic: false,
            rolled_back_at: Utc::now(),
        };
        artifact.metadata.rollback = Some(result.clone());
        self.store.save(&artifact)?;

        tracing::info!(
            artifact_id = %id,
            restored = result.restored,
            expected = result.expected,
            revert = ?result.revert_commit,
            "rolled back handoff artifact"
        );
        self.events.publish(CoreEvent::RolledBack {
            artifact_id: id.to_string(),
            restored: result.restored,
            expected: result.expected,
        });
        Ok(result)
    }

    /// Loads an artifact.
    pub fn get(&self, id: &str) -> Result<HandoffArtifact> {
        self.store.get(id)
    }

    /// All stored artifacts, oldest first.
    pub fn list(&self) -> Result<Vec<HandoffArtifact>> {
        self.store.list()
    }

    /// Restores backups in reverse order. Returns the restored count and errors.
    async fn restore(&self, backups: &[BackupRef]) -> (usize, Vec<String>) {
        let mut restored = 0;
        let mut errors = Vec::new();
        for backup in backups.iter().rev() {
            match self.mutator.restore_backup(backup).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(path = %backup.path, error = %e, "failed to restore backup");
                    errors.push(format!("failed to restore {}: {}", backup.path, e));
                }
            }
        }
        (restored, errors)
    }

    /// Marks a stale pending or approved artifact as expired and rejects it.
    fn expire_if_stale(&self, artifact: &mut HandoffArtifact, action: &'static str) -> Result<()> {
        let open = matches!(
            artifact.status,
            ArtifactStatus::Pending | ArtifactStatus::Approved
        );
        if open && artifact.is_expired(Utc::now()) {
            artifact.status = ArtifactStatus::Expired;
            self.store.save(artifact)?;
            tracing::info!(artifact_id = %artifact.id, "artifact expired");
            return Err(not_approvable(artifact, action));
        }
        Ok(())
    }
}

fn not_approvable(artifact: &HandoffArtifact, action: &'static str) -> Error {
    Error::ArtifactNotApprovable {
        id: artifact.id.clone(),
        status: artifact.status.to_string(),
        action,
    }
}

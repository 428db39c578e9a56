//! On-disk artifact storage, one JSON document per artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::persist;

use super::artifact::{ArtifactStatus, HandoffArtifact};

/// Stores artifacts under `<state_dir>/artifacts/<id>.json`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::ArtifactNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Persists an artifact, replacing any previous version.
    pub fn save(&self, artifact: &HandoffArtifact) -> Result<()> {
        persist::write_json_atomic(&self.path_for(&artifact.id)?, artifact)
    }

    /// Loads an artifact.
    pub fn get(&self, id: &str) -> Result<HandoffArtifact> {
        persist::read_json(&self.path_for(id)?)?.ok_or_else(|| Error::ArtifactNotFound(id.to_string()))
    }

    /// Removes an artifact. Missing artifacts are ignored.
    pub fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable artifacts, oldest first.
    ///
    /// Undecodable documents are skipped with a warning.
    pub fn list(&self) -> Result<Vec<HandoffArtifact>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match persist::read_json::<HandoffArtifact>(&path) {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = ?path, error = %e, "skipping unreadable artifact"),
            }
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(artifacts)
    }

    /// Deletes artifacts that expired before being executed.
    ///
    /// Returns the removed ids.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for artifact in self.list()? {
            let stale = match artifact.status {
                ArtifactStatus::Expired => true,
                ArtifactStatus::Pending | ArtifactStatus::Approved => artifact.is_expired(now),
                _ => false,
            };
            if stale {
                self.remove(&artifact.id)?;
                removed.push(artifact.id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "purged expired artifacts");
        }
        Ok(removed)
    }

    /// Evicts the oldest artifacts so one more fits under `max`.
    ///
    /// Artifacts mid-execution are never evicted. Returns the removed ids.
    pub fn trim(&self, max: usize) -> Result<Vec<String>> {
        let artifacts = self.list()?;
        let limit = max.max(1) - 1;
        let mut excess = artifacts.len().saturating_sub(limit);
        let mut removed = Vec::new();

        for artifact in artifacts {
            if excess == 0 {
                break;
            }
            if artifact.status == ArtifactStatus::Executing {
                continue;
            }
            self.remove(&artifact.id)?;
            tracing::info!(artifact_id = %artifact.id, status = %artifact.status, "evicted artifact");
            removed.push(artifact.id);
            excess -= 1;
        }
        Ok(removed)
    }
}

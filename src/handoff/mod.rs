//! Handoff: review gate, promotion and rollback of validated sandbox commits.
//!
//! A successful [`ReflectionResult`](crate::reflection::ReflectionResult) is
//! packaged into a [`HandoffArtifact`], reviewed, then applied to the
//! production workspace through a [`FileMutator`] with per-file backups.

mod artifact;
mod mutator;
mod protocol;
mod store;

pub use artifact::{
    ArtifactMetadata, ArtifactStatus, FileChange, HandoffArtifact, HandoffResult, ReviewResult,
    RollbackResult,
};
pub use mutator::{BackupRef, FileMutator, WorkspaceMutator};
pub use protocol::HandoffProtocol;
pub use store::ArtifactStore;

//! Crucible - safe self-modification for autonomous agents
//!
//! This library runs generated code changes in a persistent container sandbox,
//! iterates on them until the project's tests and type checks pass, and
//! promotes validated commits to the production workspace behind a review
//! gate with reversible, backed-up file operations.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod handoff;
pub mod parser;
pub mod reflection;
pub mod sandbox;

mod persist;

pub use error::{Error, Result};

pub use command::{CommandOutput, CommandRunner, RunOptions, ShellRunner};
pub use config::{
    CrucibleConfig, HandoffConfig, ReflectionConfig, SandboxConfig, Validate, ValidationResult,
    DEFAULT_EXCLUDE_PATHS, DEFAULT_PROTECTED_PATHS,
};
pub use events::{BroadcastSink, CoreEvent, EventSink, NullSink, RecordingSink};
pub use handoff::{
    ArtifactStatus, ArtifactStore, BackupRef, FileChange, FileMutator, HandoffArtifact,
    HandoffProtocol, HandoffResult, ReviewResult, RollbackResult, WorkspaceMutator,
};
pub use parser::{
    ResultParser, TestFailure, TestOutputParser, TestResult, TypeCheckError,
    TypeCheckOutputParser, TypeCheckResult,
};
pub use reflection::{
    ChangeOperation, CodeChange, Refinement, RefinementRequest, Refiner, ReflectionIteration,
    ReflectionLoop, ReflectionResult, ReflectionStatus, ReflectionTask,
};
pub use sandbox::{
    ChangeKind, ChangedPath, ExecOptions, ReflectionSession, Sandbox, SandboxManager,
    SandboxState, SandboxStatus, SessionStatus,
};

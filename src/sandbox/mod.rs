//! Sandbox module for the persistent isolated environment.
//!
//! This module provides the [`Sandbox`] trait consumed by the reflection loop
//! and the handoff, and the container-backed [`SandboxManager`] implementing it.

mod manager;
mod provider;
mod session;
mod state;

pub use manager::{ExecOptions, SandboxManager};
pub use provider::{ChangeKind, ChangedPath, Sandbox};
pub use session::{
    ModificationPreview, ReflectionSession, SessionCompletion, SessionRegistry, SessionStatus,
};
pub use state::{DevServerStatus, SandboxState, SandboxStatus, StateStore};

//! Reflection loop: iterate on code in the sandbox until validation passes.
//!
//! Apply changes, type-check, run tests, then either commit or ask the
//! injected [`Refiner`] for a better attempt.

mod extract;
mod orchestrator;
mod refine;
mod task;

pub use extract::extract_code_changes;
pub use orchestrator::{ActiveTask, ReflectionLoop};
pub use refine::{Refinement, RefinementRequest, Refiner};
pub use task::{
    ChangeOperation, CodeChange, ReflectionIteration, ReflectionResult, ReflectionStatus,
    ReflectionTask, ResolvedTask,
};

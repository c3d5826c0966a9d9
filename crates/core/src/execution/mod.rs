//! Executor boundary: wraps an external action runner with state snapshots
//! and derives how the effects of an operation could be undone.

pub mod capture;
pub mod executor;
pub mod reversibility;

pub use capture::StateCapture;
pub use executor::{
    ActionError, ActionOutput, ActionRunner, ExecutionError, ExecutionOutcome, ExecutionRequest,
    OperationExecutor,
};
pub use reversibility::derive_reversibility;

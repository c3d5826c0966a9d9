pub mod engine;
pub mod states;

pub use engine::{FlowTransitionError, LifecycleEngine};
pub use states::{LifecycleAction, LifecycleEvent, TransitionOutcome};

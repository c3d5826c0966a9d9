pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod execution;
pub mod feedback;
pub mod flows;
pub mod lexicon;
pub mod verification;

pub use domain::execution::{ExecutionResult, ReversibilityInfo, StateSnapshot};
pub use domain::feedback::{FeedbackSignal, FeedbackType, UserFeedback};
pub use domain::operation::{derive_parent_status, AtomicOperation, OperationId, OperationStatus};
pub use domain::taxonomy::{Classification, ClassificationLabel, Consumer, Destination, Semantics};
pub use domain::verification::{VerificationLayer, VerificationResult};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use execution::{ActionRunner, OperationExecutor, StateCapture};
pub use feedback::{FeedbackCollector, LearningAggregator};
pub use flows::{LifecycleEngine, LifecycleEvent};
pub use verification::{PipelineResult, VerificationContext, VerificationPipeline};

pub mod collector;
pub mod learning;

pub use collector::{FeedbackCollector, FeedbackSession};
pub use learning::LearningAggregator;

pub mod execution;
pub mod feedback;
pub mod operation;
pub mod taxonomy;
pub mod verification;

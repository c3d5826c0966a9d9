//! Agent runtime: turns natural-language requests into verified atomic
//! operations.
//!
//! The flow for one request:
//! 1. **Decomposition** (`decomposer`) splits compound requests into atomic
//!    clauses, recursively and with a depth cap.
//! 2. **Classification** (`classifier`) labels each leaf with the
//!    destination/consumer/semantics taxonomy, through the model backend
//!    (`llm`) or the keyword fallback.
//! 3. **Verification and gating** (`processor`, `guardrails`) run the core
//!    pipeline and decide between refusing, asking and auto-approving.
//! 4. **Execution** (`tools`) hands approved leaves to a tool registry.
//!
//! `runtime` ties these together for assistants and records user feedback.
//!
//! # Safety Principle
//!
//! The model only translates. It never approves an operation: an uncertain
//! or mutating classification always waits for the user.

pub mod classifier;
pub mod decomposer;
pub mod guardrails;
pub mod intent_judge;
pub mod intents;
pub mod llm;
pub mod processor;
pub mod runtime;
pub mod tools;

pub use classifier::{AtomicClassifier, ClassificationError};
pub use decomposer::{AtomicDecomposer, DecomposeContext, Decomposition};
pub use intents::{DomainIntent, IntentAction};
pub use llm::{LlmClient, LlmError, OllamaClient};
pub use processor::{ProcessOptions, ProcessResult, Processor, ProcessorError};
pub use runtime::{BridgeResponse, OpgateRuntime, RuntimeError};

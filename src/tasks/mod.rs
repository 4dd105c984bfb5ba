//! # Task Module
//!
//! The asynchronous analysis task subsystem: task records and their state
//! machine, the persistence boundary, the worker queue, and the orchestrator
//! that drives one task through the pipeline.
//!
//! ## Lifecycle:
//! `PENDING → PROCESSING → COMPLETED` (terminal, success and exhausted
//! retries alike) with `CANCELLED` reachable from the two non-terminal
//! states. The committed PENDING→PROCESSING write is the factual lock that
//! keeps a task on a single worker attempt at a time.

pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod task;

pub use orchestrator::AnalysisOrchestrator;
pub use queue::{AnalysisQueue, QueuedJob};
pub use store::{InMemoryTaskStore, TaskRecordStore};
pub use task::{AnalysisParams, AnalysisPayload, AnalysisResult, AnalysisTask, TaskKind, TaskStatus};

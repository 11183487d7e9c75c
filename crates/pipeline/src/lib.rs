//! Asynchronous job orchestration with callback correlation.
//!
//! Leaves first:
//!
//! - [`store`]: the job state machine and per-job audit trail.
//! - [`admission`]: global bounded-concurrency gate with RAII tickets.
//! - [`registry`]: correlation tokens and exactly-once callback hand-off.
//! - [`polling`]: backoff-driven status checks when no callback arrives.
//! - [`durable`]: checkpointed step execution seam.
//! - [`runner`]: drives one job from admission to a terminal state.
//! - [`orchestrator`]: the facade tying the components together.
//! - [`batch`]: parallel and sequential job groups.
//! - [`query`]: read-only progress, history, listing and stats.

pub mod admission;
pub mod batch;
pub mod config;
pub mod durable;
pub mod error;
pub mod orchestrator;
pub mod polling;
pub mod query;
pub mod registry;
pub mod runner;
pub mod store;

pub use admission::{AdmissionController, AdmissionTicket};
pub use batch::{BatchOrchestrator, BatchSnapshot};
pub use config::{ConfigError, PipelineConfig};
pub use durable::{DurableContext, InMemoryCheckpoints};
pub use error::PipelineError;
pub use orchestrator::Orchestrator;
pub use query::{JobFilter, ProgressQuery};
pub use registry::{CorrelationRegistry, DeliveryOutcome, ResumeEvent};
pub use runner::ProviderSet;
pub use store::JobStore;

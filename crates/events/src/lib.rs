//! Event bus and outbound event delivery for the orchestration pipeline.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`]: the lifecycle event envelope.
//! - [`EventJournal`]: background service appending every event to a
//!   JSON-lines file.
//! - [`delivery`]: webhook notifications to job submitters.

pub mod bus;
pub mod delivery;
pub mod journal;

pub use bus::{EventBus, JobEvent};
pub use delivery::webhook::{WebhookDelivery, WebhookNotifier};
pub use journal::EventJournal;

//! Domain types and pure logic for generation job orchestration.
//!
//! This crate has no internal dependencies so it can be shared by the
//! event bus, provider clients, the orchestration pipeline, and the HTTP
//! boundary alike.

pub mod audit;
pub mod backoff;
pub mod batch;
pub mod error;
pub mod job;
pub mod job_events;
pub mod signing;
pub mod state_machine;
pub mod types;

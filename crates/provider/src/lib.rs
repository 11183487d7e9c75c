//! Generation provider integration.
//!
//! - [`provider`]: the [`GenerationProvider`] contract the pipeline drives.
//! - [`error`]: transient vs permanent provider failures.
//! - [`http`]: reqwest-backed client for a REST generation service.
//! - [`callback`]: parsing of inbound webhook callback bodies.
//! - [`scripted`]: in-process provider with scripted behaviour, used for
//!   local development and tests.

pub mod callback;
pub mod error;
pub mod http;
pub mod provider;
pub mod scripted;

pub use callback::{CallbackOutcome, CallbackParseError, CallbackPayload};
pub use error::ProviderError;
pub use http::HttpProvider;
pub use provider::{GenerationProvider, GenerationRequest, PollStatus, SubmitReceipt};
pub use scripted::ScriptedProvider;

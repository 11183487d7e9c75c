//! External delivery channels for lifecycle events.

pub mod webhook;

use std::sync::Arc;

use genflow_pipeline::{BatchOrchestrator, Orchestrator};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: every field is behind an `Arc` or is itself a handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job submission, cancellation and the callback registry.
    pub orchestrator: Orchestrator,
    pub batches: BatchOrchestrator,
}

impl AppState {
    pub fn new(config: ServerConfig, orchestrator: Orchestrator) -> Self {
        let batches = BatchOrchestrator::new(orchestrator.clone());
        Self {
            config: Arc::new(config),
            orchestrator,
            batches,
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use genflow_events::{EventBus, EventJournal, WebhookDelivery, WebhookNotifier};
use genflow_pipeline::{Orchestrator, PipelineConfig, ProviderSet};
use genflow_provider::{GenerationProvider, HttpProvider, ScriptedProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genflow_api::config::{ProviderSettings, ServerConfig};
use genflow_api::router::build_app_router;
use genflow_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "genflow_api=debug,genflow_pipeline=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().unwrap_or_else(|e| panic!("Invalid server configuration: {e}"));
    let mut pipeline_config =
        PipelineConfig::from_env().unwrap_or_else(|e| panic!("Invalid pipeline configuration: {e}"));
    match &config.public_base_url {
        Some(base) => pipeline_config = pipeline_config.with_callback_base_url(base.clone()),
        None => tracing::warn!("PUBLIC_BASE_URL not set, providers will not be offered callbacks"),
    }
    tracing::info!(
        host = %config.host,
        port = config.port,
        max_concurrent_jobs = pipeline_config.max_concurrent_jobs,
        "Loaded configuration"
    );

    // --- Providers ---
    let providers = ProviderSet::new(
        build_provider(&config.image_provider),
        build_provider(&config.video_provider),
    );

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());

    let journal_handle = config.event_journal_path.clone().map(|path| {
        tokio::spawn(EventJournal::run(path, event_bus.subscribe()))
    });

    let mut delivery = WebhookDelivery::new();
    if let Some(secret) = &config.webhook_secret {
        delivery = delivery.with_secret(secret.clone());
    }
    let notifier_handle = tokio::spawn(WebhookNotifier::run(Arc::new(delivery), event_bus.subscribe()));

    // --- Orchestrator ---
    let orchestrator = Orchestrator::new(pipeline_config, providers, Arc::clone(&event_bus));
    orchestrator.start_background();
    tracing::info!(providers = ?orchestrator.providers().names(), "Orchestrator started");

    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );

    let app = build_app_router(AppState::new(config, orchestrator.clone()));

    // --- Start server ---
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    orchestrator.shutdown(shutdown_timeout).await;
    tracing::info!("Orchestrator shut down");

    // Dropping the last bus handles closes the channel, which stops the
    // journal and the notifier after they drain.
    drop(orchestrator);
    drop(event_bus);
    if let Some(handle) = journal_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "Event journal failed"),
            Err(_) => tracing::warn!("Event journal did not stop in time"),
            _ => {}
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), notifier_handle).await;
    tracing::info!("Event services shut down");

    tracing::info!("Graceful shutdown complete");
}

/// Build the provider for one job type, falling back to the in-process
/// scripted provider when no URL is configured.
fn build_provider(settings: &ProviderSettings) -> Arc<dyn GenerationProvider> {
    match &settings.url {
        Some(url) => {
            tracing::info!(provider = %settings.name, url = %url, callbacks = settings.callbacks, "Using HTTP provider");
            Arc::new(HttpProvider::new(settings.name.clone(), url.clone(), settings.callbacks))
        }
        None => {
            tracing::warn!(
                provider = %settings.name,
                "No provider URL configured, using the in-process scripted provider"
            );
            Arc::new(ScriptedProvider::new(settings.name.clone()))
        }
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

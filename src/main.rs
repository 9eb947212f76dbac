use std::panic;
use std::sync::Arc;

use collab_sync::{bootstrap, config::Config, routes::create_app, ws::registry::SessionRegistry, AppState};
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration before tracing so its log level can seed the filter
    let loaded = Config::load();
    let log_level = loaded
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| Config::default().log_level);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting server...");

    let config = loaded.unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // One registry for the lifetime of the process
    let registry = SessionRegistry::new(config.grace_period(), config.awareness_timeout());
    let app_state = AppState {
        registry: registry.clone(),
        config: Arc::new(config.clone()),
    };
    let app = create_app(app_state);

    // Bind, walking forward over ports that are already taken
    let listener = match bootstrap::bind_with_retry(&config.host, config.port, config.port_retry_attempts).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| format!("{}:{}", config.host, config.port));

    info!("🚀 Server running on http://{}", addr);
    info!("📡 WebSocket available at ws://{}/ws/<documentId>", addr);
    info!("📚 Swagger UI available at http://{}/swagger", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
    {
        error!("Server error: {}", e);
    }
}

async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    // Closes sessions and kicks clients so upgraded sockets do not hold the server open.
    registry.shutdown().await;
}

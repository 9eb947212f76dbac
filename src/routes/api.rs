use crate::{
    config::Config,
    docs::ApiDoc,
    handlers::{diagnostics, health_check, ready_check},
    websocket::handler::{document_websocket_handler, websocket_handler},
    AppState,
};
use axum::{http::{HeaderValue, Method}, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Create API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
}

/// Full application: API, WebSocket endpoints and Swagger UI
pub fn create_app(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state.config);
    Router::new()
        .nest("/api", create_api_routes())
        .route("/ws", get(websocket_handler))
        .route("/ws/:document_id", get(document_websocket_handler))
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin {}: {}", origin, e);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        if config.is_development() {
            return CorsLayer::permissive();
        }
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
}

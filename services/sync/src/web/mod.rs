pub mod hooks;
pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use middleware::require_webhook_secret;
use rest::ApiDoc;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Builds the complete application: API routes plus the Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Router {
    let origin = match &app_state.config.allowed_origin {
        Some(origin) => AllowOrigin::exact(origin.clone()),
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let feed_routes = Router::new()
        .route("/matches", get(rest::list_matches_handler))
        .route("/events", get(rest::list_events_handler))
        .route("/aggregates", get(rest::aggregates_handler))
        .route("/feed/errors", get(rest::feed_errors_handler))
        .route("/session", get(rest::session_handler))
        .route("/thoughts/{kind}/{id}", get(rest::thoughts_handler))
        .route("/reload", post(rest::reload_handler))
        .route("/scrape", post(rest::scrape_handler));

    let hook_routes = Router::new()
        .route("/hooks/realtime", post(hooks::realtime_hook_handler))
        .route("/hooks/auth", post(hooks::auth_hook_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_webhook_secret,
        ));

    let api_router = Router::new()
        .merge(feed_routes)
        .merge(hook_routes)
        .layer(cors)
        .with_state(app_state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

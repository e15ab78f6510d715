//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ChatResponse, ChatSummary, ErrorResponse, ShareResponse},
    route_guard::route_guard,
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_chats,
        handlers::get_chat,
        handlers::share_chat,
        handlers::get_shared_chat,
    ),
    components(
        schemas(ChatSummary, ChatResponse, ShareResponse, ErrorResponse)
    ),
    tags(
        (name = "Parley API", description = "Chat history and sharing for the trading assistant")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let guard = Arc::clone(&app_state.guard);

    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/chats", get(handlers::list_chats))
        .route("/chats/{id}", get(handlers::get_chat))
        .route("/chats/{id}/share", post(handlers::share_chat))
        .route("/share/{id}", get(handlers::get_shared_chat))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Pages are served elsewhere; the guard still decides redirects for them.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(guard, route_guard))
}

use axum::Router;

use crate::assets::handlers as asset_handlers;
use crate::state::AppState;

/// Build the full axum Router with all routes.
/// Rate limiting happens per verified identity inside the pipeline, so no
/// per-IP layer sits in front of these routes.
pub fn build_router(state: AppState) -> Router {
    // Identity token required (header, Authorization: tma, or ?initData=)
    let delivery_routes = Router::new()
        .route("/api/feed", axum::routing::get(asset_handlers::get_feed))
        .route(
            "/api/assets/{id}/play",
            axum::routing::get(asset_handlers::get_play),
        );

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(delivery_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

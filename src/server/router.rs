use axum::{extract::State, http::Method, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use super::state::ServeState;
use super::ws;

pub(crate) fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(ws::router())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_handler(State(state): State<ServeState>) -> Json<Value> {
    let relays = state.relay_summaries();
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime_seconds(),
        "bridge": {
            "connected": state.browser_connected(),
            "browserCount": state.bridge.tab_count(),
            "relayCount": relays.len(),
            "relays": relays,
        },
        "rateLimit": {
            "maxPerMinute": state.rate_limiter.max_per_minute(),
            "activeCallers": state.rate_limiter.active_callers(),
        },
    }))
}

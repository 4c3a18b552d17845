//! Router construction and request-level middleware.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use arbok_observability::metrics;

use crate::auth::require_api_key;
use crate::handlers::{dispatch, health, tunnels};
use crate::state::ApiState;

/// Build the public router.
///
/// Explicit routes win on path; everything else falls through to the
/// Host-based dispatcher.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route(
            "/tunnel/{value}",
            axum::routing::post(tunnels::create_tunnel)
                .get(tunnels::get_tunnel)
                .delete(tunnels::delete_tunnel),
        )
        .route("/tunnels", get(tunnels::list_tunnels))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let cors = build_cors_layer(&state.cfg.allowed_origins);

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(arbok_observability::metrics_handler))
        .nest("/api", api)
        .fallback(dispatch::dispatch)
        .layer(middleware::from_fn(track_requests))
        .layer(cors)
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Record count, duration, and an access log line for every request.
async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    metrics().record_request(method.as_str(), status, elapsed.as_secs_f64());
    info!(
        method = %method,
        path = %path,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "http request"
    );
    response
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(86400));

    if allowed_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_builds_for_both_modes() {
        let _any = build_cors_layer(&[]);
        let _pinned = build_cors_layer(&[
            "https://example.com".to_string(),
            "http://localhost:3000".to_string(),
        ]);
    }
}

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::{
    config::{CompiledRoutes, RateLimitPolicy},
    error::{RateLimitError, Result},
    http::client_address,
    limiter::{RateLimitResult, RateLimiter, WindowStatus},
    utils::RouteName,
};

/// Route-aware façade over the limiter used by the HTTP server
pub struct RateLimitService {
    limiter: Arc<RateLimiter>,
    routes: CompiledRoutes,
}

impl RateLimitService {
    pub fn new(limiter: Arc<RateLimiter>, routes: CompiledRoutes) -> Self {
        Self { limiter, routes }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Parse a route name and find its configured policy
    pub fn resolve(&self, route: &str) -> Result<(RouteName, RateLimitPolicy)> {
        let route = RouteName::new(route)?;
        let policy = self.routes.find_policy(&route).ok_or_else(|| {
            RateLimitError::InvalidRoute(format!("no policy configured for route {}", route))
        })?;
        Ok((route, policy))
    }

    /// Check one request from `client_address` on a configured route
    pub async fn check(&self, client_address: &str, route: &str) -> Result<RateLimitResult> {
        let (route, policy) = self.resolve(route)?;
        self.limiter.check(client_address, &route, &policy).await
    }

    /// Window status on a configured route, `Ok(None)` when the store failed
    pub async fn status(&self, client_address: &str, route: &str) -> Result<Option<WindowStatus>> {
        let (route, policy) = self.resolve(route)?;
        Ok(self
            .limiter
            .status(client_address, &route, policy.window_ms)
            .await)
    }

    pub async fn reset(&self, client_address: &str, route: &str) -> Result<bool> {
        let route = RouteName::new(route)?;
        Ok(self.limiter.reset(client_address, &route).await)
    }

    /// Longest configured window, used to bound the stale-key sweep
    pub fn max_window_ms(&self) -> Option<u64> {
        self.routes.max_window_ms()
    }

    pub async fn health_check(&self) -> Result<()> {
        self.limiter.health_check().await
    }
}

/// HTTP surface: health, metrics, admission checks and admin operations
pub fn router(service: Arc<RateLimitService>) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/check/:route", post(check_handler))
        .route(
            "/admin/ratelimit/:route/:client",
            get(status_handler).delete(reset_handler),
        )
        .with_state(service)
}

fn error_response(err: RateLimitError) -> Response {
    let status = match err {
        RateLimitError::InvalidRoute(_) => StatusCode::NOT_FOUND,
        RateLimitError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
}

async fn check_handler(
    State(service): State<Arc<RateLimitService>>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Response {
    let client = client_address(&headers);
    match service.check(&client, &route).await {
        Ok(result) if result.success => {
            let mut response = Json(&result).into_response();
            if !result.is_fail_open() {
                result.apply_headers(response.headers_mut());
            }
            response
        }
        Ok(result) => result.rejection_response(service.limiter().now_millis()),
        Err(e) => error_response(e),
    }
}

async fn status_handler(
    State(service): State<Arc<RateLimitService>>,
    Path((route, client)): Path<(String, String)>,
) -> Response {
    match service.status(&client, &route).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": "rate limit store unavailable" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn reset_handler(
    State(service): State<Arc<RateLimitService>>,
    Path((route, client)): Path<(String, String)>,
) -> Response {
    match service.reset(&client, &route).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(e) => error_response(e),
    }
}

async fn health_check(State(service): State<Arc<RateLimitService>>) -> Response {
    match service.health_check().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
        .into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn metrics_handler(State(service): State<Arc<RateLimitService>>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = service.limiter().metrics().registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => metrics.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

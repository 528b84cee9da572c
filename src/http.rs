//! HTTP integration: rejection responses, rate limit headers, and handler
//! wrapping for axum.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{future::Future, pin::Pin, sync::Arc};
use tracing::error;

use crate::{
    config::RateLimitPolicy,
    error::Result,
    limiter::{RateLimitResult, RateLimiter, LIMIT_EXCEEDED},
    utils::{retry_after_secs, RouteName},
};

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Address used when a request carries no client identification
pub const FALLBACK_CLIENT_ADDRESS: &str = "127.0.0.1";

/// Boxed response future returned by [`wrap`]
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Stable client identifier for a request.
///
/// Takes the first hop of `X-Forwarded-For`, then `X-Real-IP`, and falls back
/// to a fixed address so every request maps to some key.
pub fn client_address(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(address) = forwarded {
        return address.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(FALLBACK_CLIENT_ADDRESS)
        .to_string()
}

impl RateLimitResult {
    /// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(self.reset_time));
    }

    /// 429 response for a rejected check
    pub fn rejection_response(&self, now_millis: u64) -> Response {
        let retry_after = retry_after_secs(self.reset_time, now_millis);
        let body = Json(json!({
            "success": false,
            "error": self.error.as_deref().unwrap_or(LIMIT_EXCEEDED),
            "retryAfter": retry_after,
        }));

        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = response.headers_mut();
        self.apply_headers(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

/// Run the limiter in front of one request.
///
/// Returns the response to send instead of calling the inner handler, or the
/// admitted result whose headers belong on the handler's response.
async fn admit(
    limiter: &RateLimiter,
    route: &RouteName,
    policy: &RateLimitPolicy,
    client: &str,
) -> std::result::Result<RateLimitResult, Response> {
    match limiter.check(client, route, policy).await {
        Ok(result) if result.success => Ok(result),
        Ok(result) => Err(result.rejection_response(limiter.now_millis())),
        Err(e) => {
            error!("Rate limit check on route {} failed: {}", route, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn finish(result: &RateLimitResult, mut response: Response) -> Response {
    if !result.is_fail_open() {
        result.apply_headers(response.headers_mut());
    }
    response
}

/// Put `handler` behind a sliding-window limit of `max_requests` per `window_ms`.
///
/// Rejected requests get a 429 without reaching `handler`. Admitted ones get
/// the handler's response with rate limit headers attached.
pub fn wrap<H, Fut, R>(
    limiter: Arc<RateLimiter>,
    handler: H,
    route: RouteName,
    max_requests: u32,
    window_ms: u64,
) -> Result<impl Fn(Request) -> ResponseFuture + Clone + Send + Sync + 'static>
where
    H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    let policy = RateLimitPolicy::new(max_requests, window_ms)?;

    Ok(move |request: Request<Body>| {
        let limiter = limiter.clone();
        let handler = handler.clone();
        let route = route.clone();
        Box::pin(async move {
            let client = client_address(request.headers());
            let result = match admit(&limiter, &route, &policy, &client).await {
                Ok(result) => result,
                Err(response) => return response,
            };
            let response = handler(request).await.into_response();
            finish(&result, response)
        }) as ResponseFuture
    })
}

/// State for [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitLayerState {
    pub limiter: Arc<RateLimiter>,
    pub route: RouteName,
    pub policy: RateLimitPolicy,
}

impl RateLimitLayerState {
    pub fn new(limiter: Arc<RateLimiter>, route: RouteName, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            route,
            policy,
        }
    }
}

/// axum middleware form of [`wrap`], for use with
/// `axum::middleware::from_fn_with_state`
pub async fn rate_limit_middleware(
    State(state): State<RateLimitLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_address(request.headers());
    let result = match admit(&state.limiter, &state.route, &state.policy, &client).await {
        Ok(result) => result,
        Err(response) => return response,
    };
    let response = next.run(request).await;
    finish(&result, response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_client_address_prefers_first_forwarded_hop() {
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
        ]);
        assert_eq!(client_address(&map), "203.0.113.9");
    }

    #[test]
    fn test_client_address_fallbacks() {
        assert_eq!(client_address(&headers(&[("x-real-ip", "10.0.0.2")])), "10.0.0.2");
        assert_eq!(client_address(&headers(&[("x-forwarded-for", " ")])), "127.0.0.1");
        assert_eq!(client_address(&HeaderMap::new()), FALLBACK_CLIENT_ADDRESS);
    }

    #[test]
    fn test_rejection_response() {
        let result = RateLimitResult {
            success: false,
            limit: 2,
            remaining: 0,
            reset_time: 61_000,
            error: Some(LIMIT_EXCEEDED.to_string()),
        };

        let response = result.rejection_response(1_000);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers[RETRY_AFTER], "60");
        assert_eq!(headers[&X_RATELIMIT_LIMIT], "2");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[&X_RATELIMIT_RESET], "61000");
    }

    #[test]
    fn test_fail_open_result_gets_no_headers() {
        let result = RateLimitResult {
            success: true,
            limit: 0,
            remaining: 0,
            reset_time: 0,
            error: Some("Rate limiting service unavailable".to_string()),
        };
        let response = finish(&result, StatusCode::OK.into_response());
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
    }
}

//! API Middleware
//!
//! Request context, actor extraction and request logging.

use std::net::IpAddr;

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::domain::{Actor, OperationContext, Role};
use crate::error::AppError;

pub const ACTOR_ID_HEADER: &str = "X-Actor-Id";
pub const ACTOR_ROLE_HEADER: &str = "X-Actor-Role";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// =========================================================================
// Operation context
// =========================================================================

/// Build the [`OperationContext`] for every API request
pub async fn context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let headers = request.headers();

    // Extract correlation ID or generate new one
    let correlation_id = header_str(headers, CORRELATION_ID_HEADER)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let mut context = OperationContext::new()
        .with_correlation_id(correlation_id)
        .with_origin("api");

    if let Some(ip) = header_str(headers, "X-Forwarded-For")
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        context = context.with_client_ip(ip);
    }

    request.extensions_mut().insert(context);
    next.run(request).await
}

// =========================================================================
// Actor extraction
// =========================================================================

/// Read the authenticated actor set by the upstream auth layer
pub fn extract_actor(headers: &HeaderMap) -> Result<Actor, AppError> {
    let account_id = header_str(headers, ACTOR_ID_HEADER)
        .ok_or_else(|| AppError::Unauthenticated(format!("missing {} header", ACTOR_ID_HEADER)))?;
    let account_id = Uuid::parse_str(account_id).map_err(|_| {
        AppError::Unauthenticated(format!("invalid {} header format", ACTOR_ID_HEADER))
    })?;

    let role = header_str(headers, ACTOR_ROLE_HEADER).ok_or_else(|| {
        AppError::Unauthenticated(format!("missing {} header", ACTOR_ROLE_HEADER))
    })?;
    let role: Role = role
        .parse()
        .map_err(|e: crate::domain::UnknownRole| AppError::Unauthenticated(e.to_string()))?;

    Ok(Actor::new(account_id, role))
}

/// Reject requests without an actor; store it in request extensions
pub async fn actor_middleware(
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let actor = extract_actor(request.headers())?;
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

// =========================================================================
// Request logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["x-api-key", "authorization", "cookie", "set-cookie"];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

/// Request logging middleware. Runs inside `context_middleware`.
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();

    let headers = mask_headers_for_logging(request.headers());

    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.correlation_id);

    let start = std::time::Instant::now();

    tracing::info!(
        method = %method,
        uri = %uri,
        version = ?version,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = %duration.as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}

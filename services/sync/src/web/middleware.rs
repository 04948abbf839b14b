//! services/sync/src/web/middleware.rs
//!
//! Shared-secret check for the webhook ingress routes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::AppState;

/// Middleware that only lets through requests carrying
/// `Authorization: Bearer <WEBHOOK_SECRET>`. Anything else gets 401.
pub async fn require_webhook_secret(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !secrets_match(presented.trim(), &state.config.webhook_secret) {
        warn!(path = %req.uri().path(), "Rejected webhook with a bad secret");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

/// Compares every byte so the time taken does not leak the matching prefix.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("hook-secret", "hook-secret"));
        assert!(!secrets_match("hook-secreT", "hook-secret"));
        assert!(!secrets_match("hook", "hook-secret"));
        assert!(!secrets_match("", "hook-secret"));
    }
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ProxyError;
use crate::SigningProxyState;

const BODY_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bearer-token auth: every request but `/health` requires
/// `Authorization: Bearer <secret>` matching this process's minted secret.
/// Wraps the downstream handler in a 5-second timeout, surfaced as 408.
pub async fn auth_middleware(
    State(state): State<Arc<SigningProxyState>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let path = request.uri().path();

    if path == "/health" {
        return run_with_timeout(next, request).await;
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|header| header.strip_prefix("Bearer ").unwrap_or(header));

    match token {
        Some(token) if token == state.secret => run_with_timeout(next, request).await,
        _ => Err(ProxyError::Unauthorized),
    }
}

async fn run_with_timeout(next: Next, request: Request) -> Result<Response, ProxyError> {
    match tokio::time::timeout(BODY_READ_TIMEOUT, next.run(request)).await {
        Ok(response) => Ok(response),
        Err(_) => Err(ProxyError::Timeout),
    }
}

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};

use crate::dispatch::{DispatchRequest, DispatchResponse};
use crate::error::ProxyError;
use crate::SigningProxyState;

pub fn router() -> Router<Arc<SigningProxyState>> {
    Router::new().route("/dispatch", post(dispatch))
}

async fn dispatch(
    State(state): State<Arc<SigningProxyState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ProxyError> {
    let result = state
        .dispatcher
        .dispatch(request)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    Ok(Json(result))
}

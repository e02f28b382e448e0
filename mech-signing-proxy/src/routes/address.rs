use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::SigningProxyState;

pub fn router() -> Router<Arc<SigningProxyState>> {
    Router::new().route("/address", get(get_address))
}

async fn get_address(State(state): State<Arc<SigningProxyState>>) -> Json<Value> {
    let mut cache = state.address_cache.write().await;
    if cache.is_none() {
        *cache = Some(format!("{:#x}", state.signer.address()).to_lowercase());
    }
    Json(json!({ "address": cache.clone().unwrap() }))
}

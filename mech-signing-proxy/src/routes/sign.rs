use std::sync::Arc;

use alloy::dyn_abi::TypedData;
use alloy::signers::Signer;
use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ProxyError;
use crate::SigningProxyState;

pub fn router() -> Router<Arc<SigningProxyState>> {
    Router::new()
        .route("/sign", post(sign_message))
        .route("/sign-raw", post(sign_raw))
        .route("/sign-typed-data", post(sign_typed_data))
}

#[derive(Deserialize)]
struct SignMessageBody {
    message: String,
}

/// EIP-191 `personal_sign` over the UTF-8 bytes of `message`.
async fn sign_message(
    State(state): State<Arc<SigningProxyState>>,
    Json(body): Json<SignMessageBody>,
) -> Result<Json<Value>, ProxyError> {
    let signature = state
        .signer
        .sign_message(body.message.as_bytes())
        .await
        .map_err(|e| ProxyError::Internal(format!("signing failed: {e}")))?;

    Ok(Json(json!({
        "signature": format!("0x{}", hex::encode(signature.as_bytes())),
        "address": format!("{:#x}", state.signer.address()).to_lowercase(),
    })))
}

#[derive(Deserialize)]
struct SignRawBody {
    message: String,
}

/// EIP-191 `personal_sign` over raw bytes given as an even-length 0x-hex string.
async fn sign_raw(
    State(state): State<Arc<SigningProxyState>>,
    Json(body): Json<SignRawBody>,
) -> Result<Json<Value>, ProxyError> {
    let hex_str = body.message.trim_start_matches("0x");
    if hex_str.len() % 2 != 0 {
        return Err(ProxyError::BadRequest(
            "message must be an even-length hex string".to_string(),
        ));
    }

    let bytes = hex::decode(hex_str)
        .map_err(|e| ProxyError::BadRequest(format!("invalid hex message: {e}")))?;

    let signature = state
        .signer
        .sign_message(&bytes)
        .await
        .map_err(|e| ProxyError::Internal(format!("signing failed: {e}")))?;

    Ok(Json(json!({
        "signature": format!("0x{}", hex::encode(signature.as_bytes())),
        "address": format!("{:#x}", state.signer.address()).to_lowercase(),
    })))
}

/// EIP-712 typed-data signature over `{domain, types, primaryType, message}`.
async fn sign_typed_data(
    State(state): State<Arc<SigningProxyState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ProxyError> {
    let typed_data: TypedData = serde_json::from_value(body)
        .map_err(|e| ProxyError::BadRequest(format!("invalid typed data: {e}")))?;

    let signature = state
        .signer
        .sign_dynamic_typed_data(&typed_data)
        .await
        .map_err(|e| ProxyError::Internal(format!("signing failed: {e}")))?;

    Ok(Json(json!({
        "signature": format!("0x{}", hex::encode(signature.as_bytes())),
        "address": format!("{:#x}", state.signer.address()).to_lowercase(),
    })))
}

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mech_signing_proxy::{build_router, DispatchError, DispatchRequest, DispatchResponse, Dispatcher, SigningProxyState};
use tower::ServiceExt;

struct StubDispatcher;

#[async_trait]
impl Dispatcher for StubDispatcher {
    async fn dispatch(&self, _request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        Ok(DispatchResponse {
            success: true,
            request_ids: vec!["0xabc".to_string()],
            tx_hash: Some("0xdef".to_string()),
            error: None,
        })
    }
}

fn test_state() -> Arc<SigningProxyState> {
    let signer: alloy::signers::local::PrivateKeySigner =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap();
    Arc::new(SigningProxyState::new(
        signer,
        "test-secret".to_string(),
        Arc::new(StubDispatcher),
    ))
}

#[tokio::test]
async fn health_requires_no_auth() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn address_without_bearer_token_is_unauthorized() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/address").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn address_with_correct_bearer_token_returns_lowercase_address() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/address")
                .header("authorization", "Bearer test-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let address = json["address"].as_str().unwrap();
    assert_eq!(address, address.to_lowercase());
    assert!(address.starts_with("0x"));
}

#[tokio::test]
async fn sign_message_returns_a_65_byte_signature() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sign")
                .header("authorization", "Bearer test-secret")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message": "hello worker"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let sig = json["signature"].as_str().unwrap();
    assert_eq!(sig.len(), 2 + 65 * 2);
}

#[tokio::test]
async fn dispatch_forwards_to_injected_dispatcher() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/dispatch")
                .header("authorization", "Bearer test-secret")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"prompts": {}, "tools": {}, "ipfsJsonContents": {}}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["requestIds"][0], "0xabc");
}

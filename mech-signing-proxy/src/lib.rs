pub mod auth;
pub mod dispatch;
pub mod error;
pub mod routes;

use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use axum::Router;
use tokio::sync::RwLock;

pub use dispatch::{DispatchError, DispatchRequest, DispatchResponse, Dispatcher};
pub use error::ProxyError;

/// Per-process state for the signing proxy. One instance is spun up per
/// agent dispatch and torn down when the agent subprocess exits.
pub struct SigningProxyState {
    pub signer: PrivateKeySigner,
    pub secret: String,
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Cached lowercase address string; cleared on service rotation.
    pub address_cache: RwLock<Option<String>>,
}

impl SigningProxyState {
    pub fn new(signer: PrivateKeySigner, secret: String, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            signer,
            secret,
            dispatcher,
            address_cache: RwLock::new(None),
        }
    }
}

pub fn build_router(state: Arc<SigningProxyState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::address::router())
        .merge(routes::sign::router())
        .merge(routes::dispatch::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state)
}

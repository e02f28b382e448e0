//! Operator registration (§4.11): an ERC-8128-signed, empty-body POST to
//! `/admin/operators` that announces this worker's on-chain identity to the
//! Control API. Registration is idempotent on the server side — 201 (newly
//! registered) and 409 (already registered) both count as success — and a
//! failure here is non-fatal: the worker logs and continues, retrying on the
//! next registration tick rather than refusing to start.

use std::time::Duration;

use tracing::warn;
use url::Url;

use mech_runtime::WorkerError;

use crate::erc8128::Erc8128Signer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_PATH: &str = "/admin/operators";

#[derive(Debug, Clone)]
pub struct OperatorRegistrar {
    base_url: Url,
    signer: Erc8128Signer,
    client: reqwest::Client,
}

impl OperatorRegistrar {
    pub fn new(base_url: Url, signer: Erc8128Signer) -> Self {
        Self {
            base_url,
            signer,
            client: reqwest::Client::new(),
        }
    }

    /// Register this operator. Returns `true` if this call newly registered
    /// it, `false` if it was already registered.
    pub async fn register(&self) -> Result<bool, WorkerError> {
        let now = chrono::Utc::now().timestamp();
        let headers = self.signer.sign("POST", REGISTER_PATH, b"", now)?;
        let response = headers
            .apply(self.client.post(self.base_url.join(REGISTER_PATH).unwrap()))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        match response.status().as_u16() {
            201 => Ok(true),
            409 => Ok(false),
            other => Err(WorkerError::HttpError(format!(
                "operator registration failed with status {other}"
            ))),
        }
    }

    /// Register, logging and swallowing any failure — registration never
    /// blocks the worker's main loop.
    pub async fn register_best_effort(&self) {
        match self.register().await {
            Ok(true) => tracing::info!("operator registered"),
            Ok(false) => tracing::debug!("operator already registered"),
            Err(e) => warn!(error = %e, "operator registration failed, will retry next tick"),
        }
    }
}

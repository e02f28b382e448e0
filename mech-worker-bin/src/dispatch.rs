//! Concrete [`Dispatcher`] wired into the Signing Proxy's `/dispatch` route:
//! when the agent subprocess needs to submit a *child* marketplace request
//! (it has no direct chain access), the proxy forwards the request here,
//! which pins the job payload to IPFS and submits it through the Safe
//! Transaction Engine on the agent's behalf.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use mech_runtime::ipfs::IpfsClient;
use mech_runtime::safe_tx::{MarketplaceRequestParams, SafeTxEngine};
use mech_signing_proxy::{DispatchError, DispatchRequest, DispatchResponse, Dispatcher};

const PIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 300;

pub struct ProxyDispatcher {
    ipfs: IpfsClient,
    safe_tx: Arc<SafeTxEngine>,
    default_priority_mech: Address,
}

impl ProxyDispatcher {
    pub fn new(ipfs: IpfsClient, safe_tx: Arc<SafeTxEngine>, default_priority_mech: Address) -> Self {
        Self {
            ipfs,
            safe_tx,
            default_priority_mech,
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for ProxyDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let contents = serde_json::json!({
            "prompts": request.prompts,
            "tools": request.tools,
            "ipfsJsonContents": request.ipfs_json_contents,
        });

        let digest = self
            .ipfs
            .pin_json(&contents, PIN_TIMEOUT)
            .await
            .map_err(|e| DispatchError(format!("pin failed: {e}")))?;

        if request.post_only {
            return Ok(DispatchResponse {
                success: true,
                request_ids: vec![],
                tx_hash: None,
                error: None,
            });
        }

        let priority_mech = request
            .priority_mech
            .and_then(|s| s.parse::<Address>().ok())
            .unwrap_or(self.default_priority_mech);

        let outcome = self
            .safe_tx
            .submit_marketplace_request(MarketplaceRequestParams {
                request_data: Bytes::from(digest.as_slice().to_vec()),
                priority_mech,
                response_timeout: request
                    .response_timeout
                    .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_SECS),
                validate_native_payment: true,
            })
            .await
            .map_err(|e| DispatchError(format!("submit failed: {e}")))?;

        Ok(DispatchResponse {
            success: true,
            request_ids: outcome.request_ids.iter().map(|id| format!("{id}")).collect(),
            tx_hash: Some(format!("{}", outcome.tx_hash)),
            error: None,
        })
    }
}

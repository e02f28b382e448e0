//! The `/dispatch` endpoint forwards to the Safe Transaction Engine. The
//! proxy itself holds no chain client — it depends on an injected
//! `Dispatcher` so this crate stays decoupled from `mech-runtime`'s
//! concrete Safe/Tx-Queue wiring (supplied by `mech-worker-bin`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub prompts: serde_json::Value,
    pub tools: serde_json::Value,
    #[serde(rename = "ipfsJsonContents")]
    pub ipfs_json_contents: serde_json::Value,
    #[serde(default, rename = "postOnly")]
    pub post_only: bool,
    #[serde(default, rename = "responseTimeout")]
    pub response_timeout: Option<u64>,
    #[serde(default, rename = "priorityMech")]
    pub priority_mech: Option<String>,
    #[serde(default, rename = "chainConfig")]
    pub chain_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    #[serde(rename = "requestIds")]
    pub request_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DispatchError {}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

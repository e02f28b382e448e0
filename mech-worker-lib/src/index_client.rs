//! Read-only client for the ledger index (Ponder GraphQL), used by request
//! discovery, the Blueprint Builder's job-context provider, and the venture
//! watcher's duplicate-dispatch check.

use std::time::Duration;

use alloy::primitives::{Address, B256};
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use mech_runtime::types::Venture;
use mech_runtime::WorkerError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct IndexClient {
    graphql_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRow {
    pub id: B256,
    pub mech: Address,
    pub sender: Address,
    #[serde(default)]
    pub source_job_definition_id: Option<Uuid>,
    #[serde(default)]
    pub source_request_id: Option<B256>,
    pub ipfs_hash: String,
    #[serde(default)]
    pub delivery_ipfs_hash: Option<String>,
    pub block_timestamp: i64,
    pub delivered: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildJobRow {
    pub id: Uuid,
    pub name: String,
    pub last_status: String,
    #[serde(default)]
    pub branch: Option<String>,
}

impl IndexClient {
    pub fn new(graphql_url: Url) -> Self {
        Self {
            graphql_url,
            client: reqwest::Client::new(),
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, WorkerError> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(self.graphql_url.clone())
            .json(&body)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await?;

        let payload: serde_json::Value = response.json().await?;
        if let Some(errors) = payload.get("errors") {
            return Err(WorkerError::HttpError(format!(
                "ledger index returned errors: {errors}"
            )));
        }
        let data = payload
            .get("data")
            .cloned()
            .ok_or_else(|| WorkerError::HttpError("ledger index response missing data".into()))?;
        serde_json::from_value(data).map_err(WorkerError::from)
    }

    /// Undelivered requests addressed to any of `mechs` (discovery, §4.10 step 2).
    pub async fn undelivered_requests_for_mechs(
        &self,
        mechs: &[Address],
    ) -> Result<Vec<RequestRow>, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            requests: Vec<RequestRow>,
        }
        let data: Data = self
            .query(
                "query($mechs: [String!]) { requests(where: { mech_in: $mechs, delivered: false }) \
                 { id mech sender sourceJobDefinitionId sourceRequestId ipfsHash deliveryIpfsHash blockTimestamp delivered } }",
                json!({ "mechs": mechs.iter().map(|a| format!("{a:#x}")).collect::<Vec<_>>() }),
            )
            .await?;
        Ok(data.requests)
    }

    /// All rows whose `jobDefinitionId` equals `job_definition_id` — used by
    /// the venture watcher's second dedup layer.
    pub async fn requests_for_job_definition(
        &self,
        job_definition_id: Uuid,
    ) -> Result<Vec<RequestRow>, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            requests: Vec<RequestRow>,
        }
        let data: Data = self
            .query(
                "query($id: String!) { requests(where: { jobDefinitionId: $id }) \
                 { id mech sender sourceJobDefinitionId sourceRequestId ipfsHash deliveryIpfsHash blockTimestamp delivered } }",
                json!({ "id": job_definition_id.to_string() }),
            )
            .await?;
        Ok(data.requests)
    }

    /// All children of `job_definition_id` (Blueprint Builder's JobContext provider).
    pub async fn job_definition_children(
        &self,
        job_definition_id: Uuid,
    ) -> Result<Vec<ChildJobRow>, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "jobDefinitions")]
            job_definitions: Vec<ChildJobRow>,
        }
        let data: Data = self
            .query(
                "query($parent: String!) { jobDefinitions(where: { sourceJobDefinitionId: $parent }) \
                 { id name lastStatus branch: codeMetadata { branchName } } }",
                json!({ "parent": job_definition_id.to_string() }),
            )
            .await?;
        Ok(data.job_definitions)
    }

    /// All ventures with at least one enabled schedule entry — polled by the
    /// venture watcher each cadence.
    pub async fn list_ventures(&self) -> Result<Vec<Venture>, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            ventures: Vec<Venture>,
        }
        let data: Data = self
            .query(
                "query { ventures(where: { scheduleEntries_some: { enabled: true } }) \
                 { id scheduleEntries { id templateId cron enabled } } }",
                json!({}),
            )
            .await?;
        Ok(data.ventures)
    }
}

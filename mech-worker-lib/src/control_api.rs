//! Control API client: ERC-8128-signed GraphQL mutations against the
//! coordination backend — claim locks, job reports, artifacts, and
//! transaction-status updates.

use std::time::Duration;

use alloy::primitives::B256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use mech_runtime::WorkerError;

use crate::erc8128::Erc8128Signer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];
const GRAPHQL_PATH: &str = "/graphql";

/// Build an idempotency key from ordered parts, joined with `:`.
pub fn idempotency_key(parts: &[&str]) -> String {
    parts.join(":")
}

/// Build an idempotency key by hashing ordered parts down to 32 base64url
/// characters — used for long status-update keys (§4.12).
pub fn idempotency_key_hashed(parts: &[&str]) -> String {
    let joined = parts.join(":");
    let digest = Sha256::digest(joined.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.chars().take(32).collect()
}

#[derive(Debug, Clone)]
pub struct ControlApiClient {
    base_url: Url,
    signer: Erc8128Signer,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimResult {
    pub status: String,
    #[serde(rename = "alreadyClaimed")]
    pub already_claimed: bool,
}

impl ControlApiClient {
    pub fn new(base_url: Url, signer: Erc8128Signer) -> Self {
        Self {
            base_url,
            signer,
            client: reqwest::Client::new(),
        }
    }

    async fn mutate<R: DeserializeOwned>(
        &self,
        idempotency_key: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<R, WorkerError> {
        let body = serde_json::to_vec(&json!({ "query": query, "variables": variables }))?;
        let path = GRAPHQL_PATH;

        let mut last_err = None;
        for (attempt, delay_ms) in std::iter::once(0).chain(RETRY_DELAYS_MS).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let now = chrono::Utc::now().timestamp();
            let headers = self.signer.sign("POST", path, &body, now)?;

            let result = headers
                .apply(self.client.post(self.base_url.join(path).unwrap()))
                .header("Content-Type", "application/json")
                .header("Idempotency-Key", idempotency_key)
                .timeout(REQUEST_TIMEOUT)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(payload) => {
                        if let Some(errors) = payload.get("errors") {
                            last_err = Some(WorkerError::HttpError(format!(
                                "control api returned errors: {errors}"
                            )));
                            continue;
                        }
                        let data = payload.get("data").cloned().ok_or_else(|| {
                            WorkerError::HttpError("control api response missing data".into())
                        })?;
                        return serde_json::from_value(data).map_err(WorkerError::from);
                    }
                    Err(e) => last_err = Some(WorkerError::from(e)),
                },
                Err(e) => last_err = Some(WorkerError::from(e)),
            }

            if attempt == RETRY_DELAYS_MS.len() {
                break;
            }
        }

        Err(last_err.unwrap_or_else(|| WorkerError::HttpError("control api call failed".into())))
    }

    pub async fn claim_request(&self, request_id: B256) -> Result<ClaimResult, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "claimRequest")]
            claim_request: ClaimResult,
        }
        let key = idempotency_key(&[&format!("{request_id}"), "claim"]);
        let data: Data = self
            .mutate(
                &key,
                "mutation($id: String!) { claimRequest(requestId: $id) { status alreadyClaimed } }",
                json!({ "id": format!("{request_id}") }),
            )
            .await?;
        Ok(data.claim_request)
    }

    pub async fn claim_parent_dispatch(
        &self,
        parent_job_definition_id: Uuid,
        child_job_definition_id: Uuid,
    ) -> Result<bool, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "claimParentDispatch")]
            allowed: bool,
        }
        let key = idempotency_key(&[
            &parent_job_definition_id.to_string(),
            &child_job_definition_id.to_string(),
            "parent-dispatch",
        ]);
        let data: Data = self
            .mutate(
                &key,
                "mutation($parent: String!, $child: String!) { claimParentDispatch(parentJobDefId: $parent, childJobDefId: $child) }",
                json!({ "parent": parent_job_definition_id, "child": child_job_definition_id }),
            )
            .await?;
        Ok(data.allowed)
    }

    pub async fn claim_venture_dispatch(
        &self,
        venture_id: Uuid,
        template_id: Uuid,
        schedule_tick: &str,
    ) -> Result<bool, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "claimVentureDispatch")]
            allowed: bool,
        }
        let key = idempotency_key(&[&venture_id.to_string(), &template_id.to_string(), schedule_tick]);
        let data: Data = self
            .mutate(
                &key,
                "mutation($v: String!, $t: String!, $tick: String!) { claimVentureDispatch(ventureId: $v, templateId: $t, scheduleTick: $tick) }",
                json!({ "v": venture_id, "t": template_id, "tick": schedule_tick }),
            )
            .await?;
        Ok(data.allowed)
    }

    pub async fn create_job_report(
        &self,
        request_id: B256,
        report: serde_json::Value,
    ) -> Result<(), WorkerError> {
        let key = idempotency_key(&[&format!("{request_id}"), "report"]);
        let _: serde_json::Value = self
            .mutate(
                &key,
                "mutation($id: String!, $data: JSON!) { createJobReport(requestId: $id, reportData: $data) { ok: id } }",
                json!({ "id": format!("{request_id}"), "data": report }),
            )
            .await?;
        Ok(())
    }

    pub async fn create_artifact(
        &self,
        request_id: B256,
        artifact: serde_json::Value,
    ) -> Result<(), WorkerError> {
        let key = idempotency_key_hashed(&[&format!("{request_id}"), &artifact.to_string(), "artifact"]);
        let _: serde_json::Value = self
            .mutate(
                &key,
                "mutation($id: String!, $data: JSON!) { createArtifact(requestId: $id, artifactData: $data) { ok: id } }",
                json!({ "id": format!("{request_id}"), "data": artifact }),
            )
            .await?;
        Ok(())
    }

    pub async fn create_message(
        &self,
        request_id: B256,
        message: serde_json::Value,
    ) -> Result<(), WorkerError> {
        let key = idempotency_key_hashed(&[&format!("{request_id}"), &message.to_string(), "message"]);
        let _: serde_json::Value = self
            .mutate(
                &key,
                "mutation($id: String!, $data: JSON!) { createMessage(requestId: $id, messageData: $data) { ok: id } }",
                json!({ "id": format!("{request_id}"), "data": message }),
            )
            .await?;
        Ok(())
    }

    pub async fn claim_transaction_request(&self) -> Result<bool, WorkerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "claimTransactionRequest")]
            allowed: bool,
        }
        let key = idempotency_key(&[&Uuid::new_v4().to_string(), "tx-claim"]);
        let data: Data = self
            .mutate(
                &key,
                "mutation { claimTransactionRequest }",
                serde_json::Value::Null,
            )
            .await?;
        Ok(data.allowed)
    }

    pub async fn update_transaction_status(
        &self,
        tx_request_id: Uuid,
        status: &str,
        tx_hash: Option<B256>,
    ) -> Result<(), WorkerError> {
        let key = idempotency_key_hashed(&[&tx_request_id.to_string(), status, "tx-status"]);
        let _: serde_json::Value = self
            .mutate(
                &key,
                "mutation($id: String!, $status: String!, $txHash: String) { updateTransactionStatus(id: $id, status: $status, txHash: $txHash) { ok: id } }",
                json!({ "id": tx_request_id, "status": status, "txHash": tx_hash.map(|h| format!("{h}")) }),
            )
            .await?;
        Ok(())
    }

    pub async fn update_job_status(
        &self,
        request_id: B256,
        status: &str,
    ) -> Result<(), WorkerError> {
        let key = idempotency_key(&[&format!("{request_id}"), status, "job-status"]);
        let _: serde_json::Value = self
            .mutate(
                &key,
                "mutation($id: String!, $status: String!) { updateJobStatus(requestId: $id, status: $status) { ok: id } }",
                json!({ "id": format!("{request_id}"), "status": status }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn client(server: &MockServer) -> ControlApiClient {
        ControlApiClient::new(
            server.uri().parse().unwrap(),
            Erc8128Signer::new(TEST_KEY.parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn claim_request_signs_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header_exists("X-ERC8128-Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "claimRequest": { "status": "IN_PROGRESS", "alreadyClaimed": false } }
            })))
            .mount(&server)
            .await;

        let result = client(&server).claim_request(B256::ZERO).await.unwrap();
        assert_eq!(result.status, "IN_PROGRESS");
        assert!(!result.already_claimed);
    }

    #[tokio::test]
    async fn graphql_errors_are_treated_as_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/graphql")).respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "errors": [{"message": "nope"}] })),
        ).mount(&server).await;

        let err = client(&server).claim_request(B256::ZERO).await.unwrap_err();
        assert!(matches!(err, WorkerError::HttpError(_)));
    }

    #[test]
    fn idempotency_key_joins_parts_with_colon() {
        assert_eq!(idempotency_key(&["abc", "claim"]), "abc:claim");
    }

    #[test]
    fn hashed_idempotency_key_is_stable_and_bounded() {
        let a = idempotency_key_hashed(&["abc", "report"]);
        let b = idempotency_key_hashed(&["abc", "report"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}

//! Credential Bridge client: ERC-8128-signed HTTP calls to the service that
//! brokers OAuth credential quota and token refresh for the model provider.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use url::Url;

use mech_runtime::WorkerError;

use crate::credentials::{Credential, QuotaIntrospector, QuotaStatus};
use crate::erc8128::Erc8128Signer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CredentialBridgeClient {
    base_url: Url,
    signer: Erc8128Signer,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    exhausted: bool,
    #[serde(rename = "accessTokenExpired")]
    access_token_expired: bool,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "expiresAt")]
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl CredentialBridgeClient {
    pub fn new(base_url: Url, signer: Erc8128Signer) -> Self {
        Self {
            base_url,
            signer,
            client: reqwest::Client::new(),
        }
    }

    async fn signed_post<R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<R, WorkerError> {
        let body_bytes = serde_json::to_vec(&body)?;
        let now = chrono::Utc::now().timestamp();
        let headers = self.signer.sign("POST", path, &body_bytes, now)?;
        let response = headers
            .apply(self.client.post(self.base_url.join(path).unwrap()))
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .body(body_bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(WorkerError::HttpError(format!(
                "credential bridge returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(WorkerError::from)
    }

    pub async fn introspect_quota(&self, credential_id: &str) -> Result<QuotaStatus, WorkerError> {
        let resp: IntrospectResponse = self
            .signed_post(
                "/credentials/introspect",
                json!({ "credentialId": credential_id }),
            )
            .await?;
        Ok(QuotaStatus {
            exhausted: resp.exhausted,
            access_token_expired: resp.access_token_expired,
        })
    }

    pub async fn refresh_token(&self, credential: &Credential) -> Result<Credential, WorkerError> {
        let resp: RefreshResponse = self
            .signed_post(
                "/credentials/refresh",
                json!({ "credentialId": credential.id, "refreshToken": credential.refresh_token }),
            )
            .await?;
        Ok(Credential {
            id: credential.id.clone(),
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: resp.expires_at,
        })
    }

}

#[async_trait::async_trait]
impl QuotaIntrospector for CredentialBridgeClient {
    async fn introspect(&self, credential: &Credential) -> Result<QuotaStatus, WorkerError> {
        self.introspect_quota(&credential.id).await
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, WorkerError> {
        self.refresh_token(credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn client(server: &MockServer) -> CredentialBridgeClient {
        CredentialBridgeClient::new(
            server.uri().parse().unwrap(),
            Erc8128Signer::new(TEST_KEY.parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn introspect_quota_parses_exhaustion_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/credentials/introspect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exhausted": true,
                "accessTokenExpired": false
            })))
            .mount(&server)
            .await;

        let status = client(&server).introspect_quota("cred-1").await.unwrap();
        assert!(status.exhausted);
        assert!(!status.access_token_expired);
    }

}

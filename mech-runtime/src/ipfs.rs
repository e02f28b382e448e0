//! IPFS gateway client: fetch JSON payloads/artifacts by CID, pin new
//! content, and reconstruct a CIDv1 directory CID from the raw multihash
//! the marketplace stores on-chain.

use std::time::Duration;

use alloy::primitives::B256;
use url::Url;

use crate::error::WorkerError;

/// CIDv1 dag-pb prefix: version(1) || codec(dag-pb=0x70) || multihash
/// function(sha2-256=0x12) || digest length(0x20).
const CIDV1_DAG_PB_PREFIX: [u8; 4] = [0x01, 0x70, 0x12, 0x20];

/// Reconstruct the base32, multibase-prefixed CIDv1 directory CID from a
/// raw 32-byte sha2-256 multihash digest (as emitted on-chain, e.g.
/// `0x1220...`). See spec §4.6.
pub fn directory_cid_from_multihash(digest: B256) -> String {
    let mut bytes = Vec::with_capacity(4 + 32);
    bytes.extend_from_slice(&CIDV1_DAG_PB_PREFIX);
    bytes.extend_from_slice(digest.as_slice());
    let encoded = data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase();
    format!("b{encoded}")
}

#[derive(Clone)]
pub struct IpfsClient {
    gateway_url: Url,
    client: reqwest::Client,
}

impl IpfsClient {
    pub fn new(gateway_url: Url) -> Self {
        Self {
            gateway_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn gateway_url(&self) -> Url {
        self.gateway_url.clone()
    }

    /// GET `<gateway>/<cid>` and parse as JSON.
    pub async fn fetch_json(&self, cid: &str, timeout: Duration) -> Result<serde_json::Value, WorkerError> {
        let url = self
            .gateway_url
            .join(cid)
            .map_err(|e| WorkerError::ConfigError(format!("invalid gateway URL: {e}")))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    /// GET `<gateway>/<dirCid>/<entry>` — a file inside a directory CID,
    /// used to fetch a child job's previously-delivered output.
    pub async fn fetch_directory_entry(
        &self,
        dir_cid: &str,
        entry: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, WorkerError> {
        let path = format!("{dir_cid}/{entry}");
        self.fetch_json(&path, timeout).await
    }

    /// POST `value` to the gateway's metadata-pin endpoint, returning the
    /// raw 32-byte multihash digest of the pinned content.
    pub async fn pin_json(&self, value: &serde_json::Value, timeout: Duration) -> Result<B256, WorkerError> {
        #[derive(serde::Deserialize)]
        struct PinResponse {
            digest: String,
        }

        let url = self
            .gateway_url
            .join("pin")
            .map_err(|e| WorkerError::ConfigError(format!("invalid gateway URL: {e}")))?;

        let response: PinResponse = self
            .client
            .post(url)
            .json(value)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .digest
            .parse::<B256>()
            .map_err(|e| WorkerError::IpfsError(format!("invalid digest from pin endpoint: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn directory_cid_has_multibase_b_prefix_and_is_lowercase() {
        let digest = B256::repeat_byte(0xab);
        let cid = directory_cid_from_multihash(digest);
        assert!(cid.starts_with('b'));
        assert_eq!(cid, cid.to_lowercase());
    }

    #[test]
    fn directory_cid_is_deterministic() {
        let digest = B256::repeat_byte(0x11);
        assert_eq!(
            directory_cid_from_multihash(digest),
            directory_cid_from_multihash(digest)
        );
    }

    #[tokio::test]
    async fn fetch_json_parses_gateway_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bafytest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let gateway = format!("{}/", server.uri());
        let client = IpfsClient::new(gateway.parse().unwrap());
        let result = client
            .fetch_json("bafytest", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }
}

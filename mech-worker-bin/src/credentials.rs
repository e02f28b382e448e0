//! Gemini OAuth credential rotation: iterate a pool of credentials, refresh
//! expired tokens, skip quota-exhausted ones via the Credential Bridge, and
//! write the first usable token to the agent's expected credentials file.
//! Falls back to a single static API key when no pool is configured.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use mech_runtime::WorkerError;
use mech_worker_lib::credential_bridge::CredentialBridgeClient;
use mech_worker_lib::credentials::{
    exhaustion_backoff, select_active_credential, Credential, QuotaIntrospector, QuotaStatus,
};

const MAX_EXHAUSTION_RETRIES: u32 = 8;

struct BridgeIntrospector(CredentialBridgeClient);

#[async_trait::async_trait]
impl QuotaIntrospector for BridgeIntrospector {
    async fn introspect(&self, credential: &Credential) -> Result<QuotaStatus, WorkerError> {
        self.0.introspect_quota(&credential.id).await
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, WorkerError> {
        self.0.refresh_token(credential).await
    }
}

#[derive(Debug, Deserialize)]
struct RawCredential {
    id: String,
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

pub struct GeminiCredentialManager {
    pool: Vec<Credential>,
    introspector: BridgeIntrospector,
    credentials_path: PathBuf,
    attempt: u32,
}

impl GeminiCredentialManager {
    /// Parses `GEMINI_OAUTH_CREDENTIALS` (a JSON array) if present. Returns
    /// `None` when only a static `GEMINI_API_KEY` is configured — in that
    /// case the key is already in the worker's own environment and the
    /// spawned agent subprocess inherits it directly.
    pub fn from_raw_json(
        raw: &str,
        bridge: CredentialBridgeClient,
        credentials_path: PathBuf,
    ) -> Result<Self, WorkerError> {
        let raw_credentials: Vec<RawCredential> = serde_json::from_str(raw)
            .map_err(|e| WorkerError::ConfigError(format!("invalid GEMINI_OAUTH_CREDENTIALS: {e}")))?;
        let pool = raw_credentials
            .into_iter()
            .map(|c| Credential {
                id: c.id,
                access_token: c.access_token,
                refresh_token: c.refresh_token,
                expires_at: c.expires_at,
            })
            .collect();
        Ok(Self {
            pool,
            introspector: BridgeIntrospector(bridge),
            credentials_path,
            attempt: 0,
        })
    }

    /// Select the first credential with remaining quota and write its
    /// access token to the agent's credentials file. Retries with
    /// exponential backoff (capped at [`MAX_EXHAUSTION_RETRIES`]) while the
    /// whole pool reports exhausted.
    pub async fn acquire(&mut self) -> Result<(), WorkerError> {
        for _ in 0..MAX_EXHAUSTION_RETRIES {
            let now = Utc::now();
            match select_active_credential(&mut self.pool, &self.introspector, now).await? {
                Some(credential) => {
                    self.attempt = 0;
                    self.write_token(&credential)?;
                    return Ok(());
                }
                None => {
                    let backoff = exhaustion_backoff(self.attempt);
                    self.attempt += 1;
                    tracing::warn!(attempt = self.attempt, ?backoff, "gemini quota exhausted, backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(WorkerError::QuotaExhausted(
            "all gemini credentials exhausted after max retries".to_string(),
        ))
    }

    fn write_token(&self, credential: &Credential) -> Result<(), WorkerError> {
        let contents = serde_json::json!({
            "accessToken": credential.access_token,
            "refreshToken": credential.refresh_token,
        });
        if let Some(parent) = self.credentials_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorkerError::ConfigError(format!("failed to create credentials dir: {e}")))?;
        }
        std::fs::write(&self.credentials_path, contents.to_string())
            .map_err(|e| WorkerError::ConfigError(format!("failed to write credentials file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials_json() -> String {
        let expires = Utc::now() + chrono::Duration::hours(1);
        format!(
            r#"[{{"id":"a","access_token":"tok-a","refresh_token":"ref-a","expires_at":"{}"}}]"#,
            expires.to_rfc3339()
        )
    }

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn parses_credential_pool_from_json() {
        let signer: alloy::signers::local::PrivateKeySigner = TEST_KEY.parse().unwrap();
        let bridge = CredentialBridgeClient::new(
            "http://localhost".parse().unwrap(),
            mech_worker_lib::erc8128::Erc8128Signer::new(signer),
        );
        let manager = GeminiCredentialManager::from_raw_json(
            &sample_credentials_json(),
            bridge,
            PathBuf::from("/tmp/gemini-creds.json"),
        )
        .unwrap();
        assert_eq!(manager.pool.len(), 1);
        assert_eq!(manager.pool[0].id, "a");
    }
}

//! Concrete [`TemplateDispatcher`]: a venture's schedule entry dispatches by
//! minting a fresh marketplace request from the venture's template, the same
//! way any other job payload is assembled and pinned.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use serde::Deserialize;
use uuid::Uuid;

use mech_runtime::ipfs::IpfsClient;
use mech_runtime::safe_tx::{MarketplaceRequestParams, SafeTxEngine};
use mech_runtime::types::{AdditionalContext, Blueprint, Lineage};
use mech_runtime::WorkerError;
use mech_worker_lib::ipfs_payload::{build_payload, PayloadInput};
use mech_worker_lib::venture_watcher::TemplateDispatcher;

const PIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 300;

/// A template's static config: its job name and whatever invariants/tool
/// policy it always carries, looked up by `template_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub job_name: String,
    #[serde(default)]
    pub blueprint: Blueprint,
    #[serde(default)]
    pub enabled_tools: HashSet<String>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
}

/// Load venture templates from a JSON file keyed by template ID. Missing
/// file means no ventures are configured on this worker; schedule ticks for
/// unknown template IDs are logged and skipped by `VentureWatcher`.
pub fn load_templates(path: &Path) -> Result<HashMap<Uuid, Template>, WorkerError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| WorkerError::ConfigError(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| WorkerError::ConfigError(format!("invalid templates config: {e}")))
}

pub struct VentureDispatcher {
    templates: HashMap<Uuid, Template>,
    ipfs: IpfsClient,
    safe_tx: Arc<SafeTxEngine>,
    priority_mech: Address,
}

impl VentureDispatcher {
    pub fn new(
        templates: HashMap<Uuid, Template>,
        ipfs: IpfsClient,
        safe_tx: Arc<SafeTxEngine>,
        priority_mech: Address,
    ) -> Self {
        Self {
            templates,
            ipfs,
            safe_tx,
            priority_mech,
        }
    }
}

#[async_trait::async_trait]
impl TemplateDispatcher for VentureDispatcher {
    async fn dispatch(
        &self,
        venture_id: Uuid,
        template_id: Uuid,
        scheduled_job_definition_id: Uuid,
    ) -> Result<(), WorkerError> {
        let template = self.templates.get(&template_id).ok_or_else(|| {
            WorkerError::ConfigError(format!("unknown venture template {template_id}"))
        })?;

        let payload = build_payload(PayloadInput {
            job_definition_id: scheduled_job_definition_id,
            job_name: template.job_name.clone(),
            enabled_tools: template.enabled_tools.clone(),
            blueprint: template.blueprint.clone(),
            is_coding_job: false,
            model: None,
            allowed_models: template.allowed_models.clone(),
            additional_context: AdditionalContext::default(),
            inherited_env: HashMap::new(),
            inherited_env_allowlist: HashSet::new(),
            venture_id: Some(venture_id),
            template_id: Some(template_id),
            lineage: Lineage::default(),
            code_metadata: None,
            base_branch: None,
            default_branch: "main".to_string(),
            is_agent_initiated: false,
            allow_human_workspace_repo: false,
            source_request_id: None,
            source_job_definition_id: None,
            dependencies: vec![],
            input_spec: None,
            output_spec: None,
            cyclic: false,
        })?;

        let payload_json = serde_json::to_value(&payload)?;
        let digest = self.ipfs.pin_json(&payload_json, PIN_TIMEOUT).await?;

        self.safe_tx
            .submit_marketplace_request(MarketplaceRequestParams {
                request_data: Bytes::from(digest.as_slice().to_vec()),
                priority_mech: self.priority_mech,
                response_timeout: DEFAULT_RESPONSE_TIMEOUT_SECS,
                validate_native_payment: true,
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_runtime::chain::ChainClient;
    use mech_runtime::safe_tx::SafeTxEngine;
    use mech_runtime::types::Profile;
    use std::io::Write;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_profile() -> Profile {
        Profile {
            master_eoa: Address::ZERO,
            master_safe: HashMap::new(),
            service_safe: Address::ZERO,
            agent_eoa: Address::ZERO,
            agent_private_key: TEST_KEY.to_string(),
            mech_address: Address::repeat_byte(0x11),
            marketplace_address: Address::repeat_byte(0x22),
            staking_contract: Address::repeat_byte(0x33),
            chain_id: 1,
        }
    }

    fn test_dispatcher(templates: HashMap<Uuid, Template>) -> VentureDispatcher {
        let chain = ChainClient::new("http://localhost:1", TEST_KEY, 1).unwrap();
        let safe_tx = Arc::new(SafeTxEngine::new(chain, &test_profile()).unwrap());
        let ipfs = IpfsClient::new("http://localhost:1/".parse().unwrap());
        VentureDispatcher::new(templates, ipfs, safe_tx, Address::repeat_byte(0x44))
    }

    #[tokio::test]
    async fn dispatch_errors_on_unknown_template() {
        let dispatcher = test_dispatcher(HashMap::new());
        let err = dispatcher
            .dispatch(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ConfigError(_)));
    }

    #[test]
    fn load_templates_returns_empty_map_when_file_missing() {
        let templates = load_templates(Path::new("/nonexistent/templates.json")).unwrap();
        assert!(templates.is_empty());
    }

    #[test]
    fn load_templates_parses_keyed_json_file() {
        let template_id = Uuid::new_v4();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"{template_id}": {{"job_name": "daily report"}}}}"#
        )
        .unwrap();

        let templates = load_templates(file.path()).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[&template_id].job_name, "daily report");
    }
}

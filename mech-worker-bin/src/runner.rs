//! Request Lifecycle Engine: the real, I/O-driven main-loop tick, wiring
//! `mech_worker_lib::lifecycle`'s pure stages to the actual clients —
//! discover → claim → fetch payload → build blueprint → dispatch agent
//! through a per-tick Signing Proxy → collect → deliver via the Safe
//! Transaction Engine through the Tx Queue → report.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use uuid::Uuid;

use mech_runtime::allowlist::Allowlist;
use mech_runtime::contracts::IMech;
use mech_runtime::ipfs::IpfsClient;
use mech_runtime::safe_tx::SafeTxEngine;
use mech_runtime::txqueue::{EnqueueInput, StatusUpdate, TxQueue};
use mech_runtime::types::{
    Blueprint, EncodedTransaction, ExecutionStrategy, IpfsJobPayload, JobDefinition, Profile,
    TxStatus,
};
use mech_runtime::WorkerError;
use mech_signing_proxy::{build_router, SigningProxyState};
use mech_worker_lib::blueprint::{BlueprintBuilder, BlueprintInput};
use mech_worker_lib::control_api::ControlApiClient;
use mech_worker_lib::index_client::IndexClient;
use mech_worker_lib::lifecycle::{
    assemble_delivery_payload, model_is_allowed, promote_result_fields, select_candidate_requests,
    WorkOutcome,
};

use crate::agent::{AgentLauncher, JobContext};
use crate::credentials::GeminiCredentialManager;
use crate::dispatch::ProxyDispatcher;

const IPFS_FETCH_TIMEOUT: Duration = Duration::from_secs(7);
const IPFS_PIN_TIMEOUT: Duration = Duration::from_secs(10);
const CLAIM_TIMEOUT_MS: i64 = 120_000;
const MODEL_DENYLIST: &[&str] = &["gpt-3.5-turbo", "text-davinci-003"];

pub struct Runner {
    pub profile: Profile,
    pub chain_id: u64,
    pub worker_id: String,
    pub index: IndexClient,
    pub control_api: ControlApiClient,
    pub ipfs: IpfsClient,
    pub allowlist: Allowlist,
    pub tx_queue: TxQueue,
    pub safe_tx: Arc<SafeTxEngine>,
    pub blueprint_builder: BlueprintBuilder,
    pub agent_launcher: AgentLauncher,
    pub credentials: Option<GeminiCredentialManager>,
    in_flight: HashSet<B256>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: Profile,
        chain_id: u64,
        worker_id: String,
        index: IndexClient,
        control_api: ControlApiClient,
        ipfs: IpfsClient,
        allowlist: Allowlist,
        tx_queue: TxQueue,
        safe_tx: Arc<SafeTxEngine>,
        blueprint_builder: BlueprintBuilder,
        agent_launcher: AgentLauncher,
        credentials: Option<GeminiCredentialManager>,
    ) -> Self {
        Self {
            profile,
            chain_id,
            worker_id,
            index,
            control_api,
            ipfs,
            allowlist,
            tx_queue,
            safe_tx,
            blueprint_builder,
            agent_launcher,
            credentials,
            in_flight: HashSet::new(),
        }
    }

    /// One tick of the outer loop: at most one candidate request is claimed,
    /// executed, and delivered per call — the caller sleeps according to the
    /// returned [`WorkOutcome`] before calling again.
    pub async fn run_once(&mut self, staked_mechs: &[Address]) -> WorkOutcome {
        match self.try_run_once(staked_mechs).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "request lifecycle tick failed");
                WorkOutcome::CriticalError
            }
        }
    }

    async fn try_run_once(&mut self, staked_mechs: &[Address]) -> Result<WorkOutcome, WorkerError> {
        let requests = self.index.undelivered_requests_for_mechs(staked_mechs).await?;
        let candidates = select_candidate_requests(&requests, staked_mechs, &self.in_flight);

        let Some(candidate) = candidates.first().copied() else {
            return Ok(WorkOutcome::NoWork);
        };

        let request_id = candidate.id;
        let mech_address = candidate.mech;
        self.in_flight.insert(request_id);
        let result = self.process_request(request_id, mech_address, &candidate.ipfs_hash).await;
        self.in_flight.remove(&request_id);

        match result {
            Ok(()) => Ok(WorkOutcome::PartialWork),
            Err(WorkerError::AlreadyClaimed) => Ok(WorkOutcome::PartialWork),
            Err(e) => Err(e),
        }
    }

    async fn process_request(
        &mut self,
        request_id: B256,
        mech_address: Address,
        ipfs_hash: &str,
    ) -> Result<(), WorkerError> {
        let claim = self.control_api.claim_request(request_id).await?;
        if claim.already_claimed {
            return Err(WorkerError::AlreadyClaimed);
        }

        let payload_json = self.ipfs.fetch_json(ipfs_hash, IPFS_FETCH_TIMEOUT).await?;
        let payload: IpfsJobPayload = serde_json::from_value(payload_json)?;

        if let Some(model) = &payload.model {
            if !model_is_allowed(model, &payload.allowed_models, MODEL_DENYLIST) {
                return Err(WorkerError::ValidationError(format!(
                    "model {model} not permitted for request {request_id}"
                )));
            }
        }

        let job_definition = JobDefinition {
            job_definition_id: payload.job_definition_id,
            name: payload.job_name.clone(),
            enabled_tools: payload.enabled_tools.clone(),
            blueprint: payload.blueprint.clone(),
            code_metadata: payload.code_metadata.clone(),
            source_job_definition_id: payload.source_job_definition_id,
        };

        let blueprint = self
            .blueprint_builder
            .build(BlueprintInput {
                job_definition,
                parent_job_definition_id: payload.lineage.parent_job_definition_id,
                is_rerun: false,
                is_verification_task: false,
                merge_conflicts_detected: false,
                checkpoint_progress: None,
                unmeasured_mission_invariant_ids: vec![],
            })
            .await?;

        let mission_brief = payload
            .additional_context
            .summary
            .clone()
            .unwrap_or_else(|| payload.job_name.clone());
        let prompt = self.blueprint_builder.build_prompt(&blueprint, &mission_brief);

        let agent_result = self
            .dispatch_agent(&prompt, &payload, &blueprint, request_id, mech_address)
            .await?;

        if agent_result.status != "COMPLETED" {
            self.control_api.update_job_status(request_id, "FAILED").await?;
            return Err(WorkerError::AgentFailure(format!(
                "agent reported status {}",
                agent_result.status
            )));
        }

        let promoted = promote_result_fields(&agent_result.result, &payload.output_spec);
        let delivery_payload = assemble_delivery_payload(request_id, promoted, agent_result.summary.clone());
        let delivery_digest = self.ipfs.pin_json(&delivery_payload, IPFS_PIN_TIMEOUT).await?;

        self.deliver(request_id, mech_address, delivery_digest).await?;

        let report = serde_json::json!({
            "requestId": format!("{request_id}"),
            "durationMs": agent_result.duration_ms,
            "tokenCount": agent_result.token_count,
        });
        self.control_api.create_job_report(request_id, report).await?;
        for artifact in &agent_result.artifacts {
            self.control_api.create_artifact(request_id, artifact.clone()).await?;
        }
        self.control_api.update_job_status(request_id, "COMPLETED").await?;

        Ok(())
    }

    async fn dispatch_agent(
        &mut self,
        prompt: &str,
        payload: &IpfsJobPayload,
        blueprint: &Blueprint,
        request_id: B256,
        mech_address: Address,
    ) -> Result<crate::agent::AgentResult, WorkerError> {
        if let Some(credentials) = self.credentials.as_mut() {
            credentials.acquire().await?;
        }

        let agent_signer: PrivateKeySigner = self
            .profile
            .agent_private_key
            .parse()
            .map_err(|e| WorkerError::ConfigError(format!("invalid agent key: {e}")))?;

        let secret = Uuid::new_v4().to_string();
        let dispatcher = Arc::new(ProxyDispatcher::new(
            self.ipfs.clone(),
            self.safe_tx.clone(),
            mech_address,
        ));
        let state = Arc::new(SigningProxyState::new(agent_signer, secret.clone(), dispatcher));
        let router = build_router(state);

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .map_err(|e| WorkerError::HttpError(format!("signing proxy bind failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WorkerError::HttpError(format!("signing proxy addr failed: {e}")))?;
        let proxy_url = format!("http://{local_addr}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        let context = JobContext {
            request_id: format!("{request_id}"),
            job_definition_id: payload.job_definition_id.to_string(),
            workstream_id: payload.workstream_id.map(|u| u.to_string()),
            venture_id: payload.venture_id.map(|u| u.to_string()),
            parent_request_id: payload.source_request_id.map(|id| format!("{id}")),
            branch_name: payload.branch_name.clone(),
            base_branch: payload.base_branch.clone(),
            completed_children: vec![],
            child_work_reviewed: false,
            required_tools: payload.enabled_tools.iter().cloned().collect(),
            available_tools: payload
                .tools
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect(),
            blueprint_invariant_ids: blueprint.invariants.iter().map(|i| i.id().to_string()).collect(),
            allowed_models: payload.allowed_models.clone(),
            default_model: payload.model.clone(),
            inherited_env: payload.additional_context.env.clone(),
        };

        let outcome = self
            .agent_launcher
            .run(prompt, context, &proxy_url, &secret)
            .await;

        let _ = shutdown_tx.send(());
        let _ = server.await;

        outcome
    }

    async fn deliver(&self, request_id: B256, mech_address: Address, digest: B256) -> Result<(), WorkerError> {
        let data = Bytes::from(digest.as_slice().to_vec());
        let encoded = IMech::deliverCall {
            requestId: request_id,
            data: data.clone(),
        }
        .abi_encode();

        self.allowlist.validate(
            self.chain_id,
            self.chain_id,
            &EncodedTransaction {
                to: mech_address,
                data: encoded,
                value: 0,
            },
            ExecutionStrategy::Safe,
        )?;

        let enqueue_payload = serde_json::json!({
            "kind": "deliver",
            "mech": format!("{mech_address:#x}"),
            "requestId": format!("{request_id}"),
            "digest": format!("{digest}"),
        });
        let tx_request = self
            .tx_queue
            .enqueue(EnqueueInput {
                chain_id: self.chain_id,
                execution_strategy: ExecutionStrategy::Safe,
                payload: enqueue_payload,
                idempotency_key: Some(format!("deliver:{request_id}")),
            })
            .await?;

        let claimed = self
            .tx_queue
            .claim(&self.worker_id, CLAIM_TIMEOUT_MS)
            .await?
            .ok_or_else(|| WorkerError::QueueError("delivery enqueued but not claimable".to_string()))?;

        if claimed.id != tx_request.id {
            // Another worker's delivery was due first; this one remains
            // PENDING and will be claimed on a later tick.
            return Ok(());
        }

        match self.safe_tx.deliver_request(mech_address, request_id, data).await {
            Ok(outcome) => {
                self.tx_queue
                    .update_status(
                        claimed.id,
                        TxStatus::Confirmed,
                        StatusUpdate {
                            safe_tx_hash: Some(outcome.safe_tx_hash),
                            tx_hash: Some(outcome.tx_hash),
                            completed: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.tx_queue
                    .update_status(
                        claimed.id,
                        TxStatus::Failed,
                        StatusUpdate {
                            error_message: Some(e.to_string()),
                            completed: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }
}

//! Process entry point for the mech marketplace worker.
//!
//! Wires the profile store, chain client, tx queue, allowlist, blueprint
//! builder and agent launcher together, then runs three independent
//! periodic tasks sharing one event loop: the request lifecycle engine
//! (the main loop), the checkpoint driver, and the venture watcher. Only
//! one agent subprocess runs at a time — that's the worker's natural
//! backpressure.

mod agent;
mod config;
mod credentials;
mod dispatch;
mod runner;
mod venture;

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use url::Url;

use mech_runtime::allowlist::Allowlist;
use mech_runtime::chain::ChainClient;
use mech_runtime::checkpoint::{CheckpointDriver, CheckpointOutcome};
use mech_runtime::ipfs::IpfsClient;
use mech_runtime::profile::load_profile;
use mech_runtime::safe_tx::SafeTxEngine;
use mech_runtime::staking_filter::StakingFilter;
use mech_runtime::txqueue::TxQueue;
use mech_worker_lib::blueprint::BlueprintBuilder;
use mech_worker_lib::control_api::ControlApiClient;
use mech_worker_lib::credential_bridge::CredentialBridgeClient;
use mech_worker_lib::erc8128::Erc8128Signer;
use mech_worker_lib::index_client::IndexClient;
use mech_worker_lib::lifecycle::sleep_for;
use mech_worker_lib::registration::OperatorRegistrar;
use mech_worker_lib::venture_watcher::VentureWatcher;

use crate::agent::AgentLauncher;
use crate::config::WorkerConfig;
use crate::credentials::GeminiCredentialManager;
use crate::runner::Runner;
use crate::venture::{load_templates, VentureDispatcher};

#[tokio::main]
async fn main() -> Result<(), mech_runtime::WorkerError> {
    setup_log();
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env()?;
    let profile = load_profile(&config.operate_password, &config.profile_base_path)?;
    let worker_id = format!("{:#x}", profile.agent_eoa);

    let agent_signer: PrivateKeySigner = profile
        .agent_private_key
        .parse()
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid agent key: {e}")))?;
    let erc8128_signer = Erc8128Signer::new(agent_signer);

    let control_api_url = Url::parse(&config.control_api_url)
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid CONTROL_API_URL: {e}")))?;
    let index_graphql_url = Url::parse(&config.ledger_index_graphql_url)
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid PONDER_GRAPHQL_URL: {e}")))?;
    let ipfs_gateway_url = Url::parse(&config.ipfs_gateway_url)
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid IPFS_GATEWAY_URL: {e}")))?;

    let control_api = ControlApiClient::new(control_api_url.clone(), erc8128_signer.clone());
    let index = IndexClient::new(index_graphql_url.clone());
    let ipfs = IpfsClient::new(ipfs_gateway_url);
    let allowlist = Allowlist::load(&config.allowlist_config_path)?;
    let tx_queue = TxQueue::connect(&config.local_queue_db_path).await?;

    let staking_contract: alloy::primitives::Address = config
        .worker_staking_contract
        .parse()
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid WORKER_STAKING_CONTRACT: {e}")))?;
    let staking_filter = StakingFilter::new(index_graphql_url.clone(), staking_contract);

    let main_chain = ChainClient::new(&config.rpc_url, &profile.agent_private_key, config.chain_id)?;
    let safe_tx = Arc::new(SafeTxEngine::new(main_chain, &profile)?);

    let checkpoint_chain = ChainClient::new(&config.rpc_url, &profile.agent_private_key, config.chain_id)?;
    let checkpoint_driver = CheckpointDriver::new(checkpoint_chain, staking_contract, profile.agent_eoa);

    let blueprint_builder = BlueprintBuilder::new().with_standard_invariant_providers();
    let agent_launcher = AgentLauncher::new(config.agent_binary_path.clone());

    let credential_bridge_url = Url::parse(&config.credential_bridge_url)
        .map_err(|e| mech_runtime::WorkerError::ConfigError(format!("invalid X402_GATEWAY_URL: {e}")))?;
    let credential_manager = match &config.gemini_oauth_credentials {
        Some(raw) => Some(GeminiCredentialManager::from_raw_json(
            raw,
            CredentialBridgeClient::new(credential_bridge_url, erc8128_signer.clone()),
            config.middleware_path.join("gemini-credentials.json"),
        )?),
        None => None,
    };
    if credential_manager.is_none() && config.gemini_api_key.is_none() {
        tracing::warn!("neither GEMINI_OAUTH_CREDENTIALS nor GEMINI_API_KEY is set");
    }

    OperatorRegistrar::new(control_api_url.clone(), erc8128_signer.clone())
        .register_best_effort()
        .await;

    // ── Checkpoint driver: runs its own staking-checkpoint cadence ──────────
    tokio::spawn({
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match checkpoint_driver.run_if_due().await {
                    Ok(CheckpointOutcome::NotDue) => {}
                    Ok(CheckpointOutcome::Executed { tx_hash }) => {
                        tracing::info!(%tx_hash, "staking checkpoint executed");
                    }
                    Err(e) => tracing::error!(error = %e, "checkpoint tick failed"),
                }
            }
        }
    });

    // ── Venture watcher: dispatches scheduled templates on their cron ──────
    tokio::spawn({
        let control_api = control_api.clone();
        let index = index.clone();
        let templates = load_templates(&config.venture_templates_path)?;
        let venture_dispatcher = VentureDispatcher::new(
            templates,
            ipfs.clone(),
            safe_tx.clone(),
            profile.mech_address,
        );
        let mut watcher = VentureWatcher::new(control_api, index.clone(), venture_dispatcher);
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let ventures = match index.list_ventures().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to list ventures");
                        continue;
                    }
                };
                let now = chrono::Utc::now();
                for venture in &ventures {
                    if let Err(e) = watcher.tick(venture, now).await {
                        tracing::error!(venture_id = %venture.id, error = %e, "venture tick failed");
                    }
                }
            }
        }
    });

    let mut runner = Runner::new(
        profile.clone(),
        config.chain_id,
        worker_id,
        index,
        control_api,
        ipfs,
        allowlist,
        tx_queue,
        safe_tx,
        blueprint_builder,
        agent_launcher,
        credential_manager,
    );

    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down mech worker");
                break;
            }
            outcome = async {
                let staked = staking_filter.resolve_staked_mechs().await;
                let staked = if staked.is_empty() { vec![profile.mech_address] } else { staked };
                runner.run_once(&staked).await
            } => {
                tokio::time::sleep(sleep_for(outcome)).await;
            }
        }
    }

    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}

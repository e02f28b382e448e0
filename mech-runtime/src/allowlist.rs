//! Allowlist validation: every outbound transaction's `(chain, contract,
//! selector)` triple must appear in a JSON configuration file before the
//! Tx Queue will enqueue or submit it.

use std::collections::HashMap;
use std::path::Path;

use alloy::primitives::Address;
use serde::Deserialize;

use crate::error::WorkerError;
use crate::types::{EncodedTransaction, ExecutionStrategy};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectorEntry {
    Plain(String),
    Detailed {
        selector: String,
        #[serde(default)]
        allowed_executors: Option<Vec<ExecutionStrategy>>,
        #[serde(default)]
        notes: Option<String>,
    },
}

impl SelectorEntry {
    fn selector(&self) -> String {
        match self {
            SelectorEntry::Plain(s) => s.to_lowercase(),
            SelectorEntry::Detailed { selector, .. } => selector.to_lowercase(),
        }
    }

    fn allowed_executors(&self) -> Option<&[ExecutionStrategy]> {
        match self {
            SelectorEntry::Plain(_) => None,
            SelectorEntry::Detailed {
                allowed_executors, ..
            } => allowed_executors.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct ContractAllowlist(Vec<SelectorEntry>);

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct ChainAllowlist(HashMap<String, ContractAllowlist>);

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct AllowlistFile(HashMap<String, ChainAllowlist>);

/// Loaded, normalized allowlist: `chainId -> lowercased contract address ->
/// selector entries`.
pub struct Allowlist {
    chains: HashMap<u64, HashMap<String, Vec<SelectorEntry>>>,
}

impl Allowlist {
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::ConfigError(format!("cannot read allowlist config: {e}")))?;
        let file: AllowlistFile = serde_json::from_str(&raw)
            .map_err(|e| WorkerError::ConfigError(format!("malformed allowlist config: {e}")))?;

        let mut chains = HashMap::new();
        for (chain_str, chain_allowlist) in file.0 {
            let chain_id: u64 = chain_str
                .parse()
                .map_err(|_| WorkerError::ConfigError(format!("invalid chain id: {chain_str}")))?;
            let mut contracts = HashMap::new();
            for (addr, selectors) in chain_allowlist.0 {
                contracts.insert(addr.to_lowercase(), selectors.0);
            }
            chains.insert(chain_id, contracts);
        }

        Ok(Self { chains })
    }

    /// Validate a transaction against the allowlist. Mirrors spec §4.3's
    /// checks, in the order listed there.
    pub fn validate(
        &self,
        worker_chain_id: u64,
        request_chain_id: u64,
        tx: &EncodedTransaction,
        execution_strategy: ExecutionStrategy,
    ) -> Result<(), WorkerError> {
        if tx.value != 0 {
            return Err(WorkerError::InvalidPayload(
                "payload.value must be zero".to_string(),
            ));
        }

        if tx.data.len() < 4 {
            return Err(WorkerError::InvalidPayload(
                "payload.data shorter than a function selector".to_string(),
            ));
        }

        let Some(contracts) = self.chains.get(&request_chain_id) else {
            return Err(WorkerError::ChainNotSupported(request_chain_id));
        };

        if worker_chain_id != request_chain_id {
            return Err(WorkerError::ChainMismatch {
                worker: worker_chain_id,
                request: request_chain_id,
            });
        }

        let contract_key = format_address(tx.to);
        let Some(selectors) = contracts.get(&contract_key) else {
            return Err(WorkerError::AllowlistViolation(format!(
                "contract {contract_key} not in allowlist for chain {request_chain_id}"
            )));
        };

        let selector_hex = hex::encode(&tx.data[0..4]);
        let matched = selectors
            .iter()
            .find(|entry| entry.selector().trim_start_matches("0x") == selector_hex);

        let Some(matched) = matched else {
            return Err(WorkerError::AllowlistViolation(format!(
                "selector 0x{selector_hex} not allowlisted for {contract_key}"
            )));
        };

        if let Some(allowed) = matched.allowed_executors() {
            if !allowed.contains(&execution_strategy) {
                return Err(WorkerError::ExecutionStrategyMismatch(format!(
                    "selector 0x{selector_hex} does not permit execution strategy {execution_strategy:?}"
                )));
            }
        }

        Ok(())
    }
}

fn format_address(addr: Address) -> String {
    format!("{addr:#x}").to_lowercase()
}

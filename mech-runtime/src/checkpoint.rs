//! Checkpoint Driver: periodically calls the permissionless `checkpoint()`
//! on the staking contract once the current epoch's reward checkpoint is
//! overdue. Idempotent per epoch; harmless if multiple workers race it.

use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;

use crate::chain::ChainClient;
use crate::contracts::IStaking;
use crate::error::WorkerError;

/// 0.0001 native coin, in wei — minimum signer balance required to attempt
/// a checkpoint call.
const MIN_CHECKPOINT_BALANCE_WEI: u128 = 100_000_000_000_000;

#[derive(Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    NotDue,
    Executed { tx_hash: B256 },
}

pub struct CheckpointDriver {
    chain: ChainClient,
    staking_contract: Address,
    signer_address: Address,
}

impl CheckpointDriver {
    pub fn new(chain: ChainClient, staking_contract: Address, signer_address: Address) -> Self {
        Self {
            chain,
            staking_contract,
            signer_address,
        }
    }

    pub async fn run_if_due(&self) -> Result<CheckpointOutcome, WorkerError> {
        let provider = self.chain.provider();
        let staking = IStaking::new(self.staking_contract, provider);

        let next_checkpoint = staking
            .getNextRewardCheckpointTimestamp()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("getNextRewardCheckpointTimestamp: {e}")))?;

        let now = U256::from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );

        if now < next_checkpoint {
            return Ok(CheckpointOutcome::NotDue);
        }

        let balance = provider
            .get_balance(self.signer_address)
            .await
            .map_err(|e| WorkerError::RpcError(format!("get_balance: {e}")))?;

        if balance < U256::from(MIN_CHECKPOINT_BALANCE_WEI) {
            return Err(WorkerError::ValidationError(format!(
                "signer balance {balance} below minimum {MIN_CHECKPOINT_BALANCE_WEI} required for checkpoint"
            )));
        }

        let pending = staking
            .checkpoint()
            .send()
            .await
            .map_err(|e| WorkerError::RpcError(format!("checkpoint: {e}")))?;

        let receipt = pending
            .with_required_confirmations(1)
            .get_receipt()
            .await
            .map_err(|e| WorkerError::RpcError(format!("checkpoint receipt: {e}")))?;

        if !receipt.status() {
            return Err(WorkerError::OnChainRevert(format!(
                "checkpoint tx {} reverted",
                receipt.transaction_hash
            )));
        }

        Ok(CheckpointOutcome::Executed {
            tx_hash: receipt.transaction_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_checkpoint_balance_is_one_tenth_milli_eth() {
        assert_eq!(MIN_CHECKPOINT_BALANCE_WEI, 100_000_000_000_000);
    }
}

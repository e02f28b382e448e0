//! Safe Transaction Engine: build, sign, and execute Gnosis-Safe
//! transactions on behalf of the Service Safe, submitting marketplace
//! requests signed by the Agent EOA.
//!
//! The signature format is the non-obvious part: Safe's `execTransaction`
//! distinguishes an `eth_sign` (EIP-191 personal_sign) proof from an
//! EIP-712 one purely by the top bits of `v` in the packed signature blob.
//! Adding 4 to a normal `{27,28}` recovery id tells the Safe contract "this
//! was personal_sign of the tx hash bytes, not typed-data".

use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;

use crate::chain::ChainClient;
use crate::contracts::{
    IMarketplace, IMech, ISafe, NATIVE_PAYMENT_TYPE,
};
use crate::error::WorkerError;
use crate::types::Profile;

/// Courtesy pacing between independent read calls against the RPC endpoint.
const RPC_CALL_SPACING: Duration = Duration::from_millis(200);

pub struct MarketplaceRequestParams {
    pub request_data: Bytes,
    pub priority_mech: Address,
    pub response_timeout: u64,
    pub validate_native_payment: bool,
}

pub struct SafeTxOutcome {
    pub request_ids: Vec<B256>,
    pub tx_hash: B256,
    pub safe_tx_hash: B256,
}

pub struct SafeTxEngine {
    chain: ChainClient,
    agent_signer: PrivateKeySigner,
    service_safe: Address,
    marketplace_address: Address,
}

impl SafeTxEngine {
    pub fn new(chain: ChainClient, profile: &Profile) -> Result<Self, WorkerError> {
        let agent_signer: PrivateKeySigner = profile
            .agent_private_key
            .parse()
            .map_err(|e| WorkerError::ConfigError(format!("invalid agent key: {e}")))?;

        Ok(Self {
            chain,
            agent_signer,
            service_safe: profile.service_safe,
            marketplace_address: profile.marketplace_address,
        })
    }

    /// Submit a marketplace request from the Service Safe. See spec §4.4.
    pub async fn submit_marketplace_request(
        &self,
        params: MarketplaceRequestParams,
    ) -> Result<SafeTxOutcome, WorkerError> {
        let provider = self.chain.provider();

        let mech = IMech::new(params.priority_mech, provider);
        let payment_type = mech
            .paymentType()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("paymentType: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        if params.validate_native_payment && payment_type.0 != NATIVE_PAYMENT_TYPE {
            return Err(WorkerError::ValidationError(
                "mech payment type is not native payment".to_string(),
            ));
        }

        let max_delivery_rate = mech
            .maxDeliveryRate()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("maxDeliveryRate: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        let marketplace = IMarketplace::new(self.marketplace_address, provider);
        let min_timeout = marketplace
            .minResponseTimeout()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("minResponseTimeout: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        let max_timeout = marketplace
            .maxResponseTimeout()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("maxResponseTimeout: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        let clamped_timeout = params
            .response_timeout
            .max(min_timeout.to::<u64>())
            .min(max_timeout.to::<u64>());

        let final_price = max_delivery_rate;

        let safe = ISafe::new(self.service_safe, provider);
        let balance = provider
            .get_balance(self.service_safe)
            .await
            .map_err(|e| WorkerError::RpcError(format!("get_balance: {e}")))?;
        if balance < final_price {
            return Err(WorkerError::ValidationError(format!(
                "service safe balance {balance} below required price {final_price}"
            )));
        }

        let call_data = IMarketplace::requestCall {
            requestData: params.request_data,
            maxDeliveryRate: max_delivery_rate,
            paymentType: payment_type,
            priorityMech: params.priority_mech,
            responseTimeout: U256::from(clamped_timeout),
            paymentData: Bytes::new(),
        }
        .abi_encode();

        let safe_nonce = safe
            .nonce()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("safe nonce: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        let safe_tx_hash = safe
            .getTransactionHash(
                self.marketplace_address,
                final_price,
                call_data.clone().into(),
                0u8,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                Address::ZERO,
                Address::ZERO,
                safe_nonce,
            )
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("getTransactionHash: {e}")))?;

        let signature = self
            .agent_signer
            .sign_message(safe_tx_hash.as_slice())
            .await
            .map_err(|e| WorkerError::SafeError(format!("signing failed: {e}")))?;

        let signatures = eth_sign_signature_bytes(&signature.as_bytes());

        let exec_call_data = ISafe::execTransactionCall {
            to: self.marketplace_address,
            value: final_price,
            data: call_data.into(),
            operation: 0u8,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: signatures.into(),
        }
        .abi_encode();

        let tx_request = TransactionRequest::default()
            .to(self.service_safe)
            .input(exec_call_data.into());

        let pending = provider
            .send_transaction(tx_request)
            .await
            .map_err(|e| WorkerError::SafeError(format!("send_transaction: {e}")))?;
        let tx_hash = *pending.tx_hash();

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| WorkerError::SafeError(format!("get_receipt: {e}")))?;

        if !receipt.status() {
            return Err(WorkerError::OnChainRevert(format!("tx {tx_hash} reverted")));
        }

        let request_ids = parse_marketplace_request_ids(&receipt);

        Ok(SafeTxOutcome {
            request_ids,
            tx_hash,
            safe_tx_hash,
        })
    }

    /// Submit a signed delivery from the Service Safe to the mech's
    /// `deliver(requestId, data)`. Shares the sign/exec machinery with
    /// `submit_marketplace_request`, against a different target contract.
    pub async fn deliver_request(
        &self,
        mech_address: Address,
        request_id: B256,
        data: Bytes,
    ) -> Result<SafeTxOutcome, WorkerError> {
        let provider = self.chain.provider();

        let call_data = IMech::deliverCall {
            requestId: request_id,
            data,
        }
        .abi_encode();

        let safe = ISafe::new(self.service_safe, provider);
        let safe_nonce = safe
            .nonce()
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("safe nonce: {e}")))?;
        tokio::time::sleep(RPC_CALL_SPACING).await;

        let safe_tx_hash = safe
            .getTransactionHash(
                mech_address,
                U256::ZERO,
                call_data.clone().into(),
                0u8,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                Address::ZERO,
                Address::ZERO,
                safe_nonce,
            )
            .call()
            .await
            .map_err(|e| WorkerError::RpcError(format!("getTransactionHash: {e}")))?;

        let signature = self
            .agent_signer
            .sign_message(safe_tx_hash.as_slice())
            .await
            .map_err(|e| WorkerError::SafeError(format!("signing failed: {e}")))?;

        let signatures = eth_sign_signature_bytes(&signature.as_bytes());

        let exec_call_data = ISafe::execTransactionCall {
            to: mech_address,
            value: U256::ZERO,
            data: call_data.into(),
            operation: 0u8,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: signatures.into(),
        }
        .abi_encode();

        let tx_request = TransactionRequest::default()
            .to(self.service_safe)
            .input(exec_call_data.into());

        let pending = provider
            .send_transaction(tx_request)
            .await
            .map_err(|e| WorkerError::SafeError(format!("send_transaction: {e}")))?;
        let tx_hash = *pending.tx_hash();

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| WorkerError::SafeError(format!("get_receipt: {e}")))?;

        if !receipt.status() {
            return Err(WorkerError::OnChainRevert(format!("tx {tx_hash} reverted")));
        }

        Ok(SafeTxOutcome {
            request_ids: vec![request_id],
            tx_hash,
            safe_tx_hash,
        })
    }
}

/// Reassemble a 65-byte `r || s || v` signature as `r || s || (v+4)`, the
/// form Gnosis Safe expects for an `eth_sign` (personal_sign) proof.
fn eth_sign_signature_bytes(sig: &[u8; 65]) -> [u8; 65] {
    let mut out = *sig;
    out[64] += 4;
    out
}

fn parse_marketplace_request_ids(
    receipt: &alloy::rpc::types::TransactionReceipt,
) -> Vec<B256> {
    let mut ids = Vec::new();
    for log in receipt.inner.logs() {
        if let Ok(decoded) = log.log_decode::<IMarketplace::MarketplaceRequest>() {
            ids.extend(decoded.inner.data.requestIds.iter().copied());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eth_sign_adjustment_adds_four_to_v() {
        let mut sig = [0u8; 65];
        sig[64] = 27;
        let adjusted = eth_sign_signature_bytes(&sig);
        assert_eq!(adjusted[64], 31);

        let mut sig = [0u8; 65];
        sig[64] = 28;
        let adjusted = eth_sign_signature_bytes(&sig);
        assert_eq!(adjusted[64], 32);
    }

    #[test]
    fn eth_sign_adjustment_preserves_r_and_s() {
        let mut sig = [7u8; 65];
        sig[64] = 27;
        let adjusted = eth_sign_signature_bytes(&sig);
        assert_eq!(&adjusted[0..64], &sig[0..64]);
    }
}

//! Shared domain types for the request lifecycle: profile, request, job
//! definition, blueprint/invariant, IPFS payload, transaction queue row,
//! venture/schedule, and situation artifact.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static, per-process operator profile decrypted from the on-disk keystore.
#[derive(Debug, Clone)]
pub struct Profile {
    pub master_eoa: Address,
    pub master_safe: HashMap<u64, Address>,
    pub service_safe: Address,
    pub agent_eoa: Address,
    pub agent_private_key: String,
    pub mech_address: Address,
    pub marketplace_address: Address,
    pub staking_contract: Address,
    pub chain_id: u64,
}

/// A marketplace request as surfaced by the ledger index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: B256,
    pub mech: Address,
    pub requester: Address,
    pub block_timestamp: DateTime<Utc>,
    pub ipfs_hash: B256,
    pub delivered: bool,
    pub delivery_ipfs_hash: Option<B256>,
}

/// Code metadata attached to a coding job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeMetadata {
    pub repo_url: String,
    pub branch_name: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_definition_id: Uuid,
    pub name: String,
    pub enabled_tools: HashSet<String>,
    pub blueprint: Blueprint,
    pub code_metadata: Option<CodeMetadata>,
    pub source_job_definition_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Blueprint {
    pub invariants: Vec<Invariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_meta: Option<TemplateMeta>,
}

/// A tagged-union invariant. The ID prefix (before the first `-`) determines
/// its layer when rendered: see `mech-worker-lib`'s blueprint builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Invariant {
    #[serde(rename = "BOOLEAN")]
    Boolean {
        id: String,
        condition: String,
        assessment: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        examples: Option<Vec<String>>,
    },
    #[serde(rename = "FLOOR")]
    Floor { id: String, metric: String, min: f64 },
    #[serde(rename = "CEILING")]
    Ceiling { id: String, metric: String, max: f64 },
    #[serde(rename = "RANGE")]
    Range {
        id: String,
        metric: String,
        min: f64,
        max: f64,
    },
}

impl Invariant {
    pub fn id(&self) -> &str {
        match self {
            Invariant::Boolean { id, .. }
            | Invariant::Floor { id, .. }
            | Invariant::Ceiling { id, .. }
            | Invariant::Range { id, .. } => id,
        }
    }

    /// The prefix before the first `-`, e.g. `"COORD"` for `"COORD-FAILED-CHILDREN"`.
    pub fn prefix(&self) -> &str {
        self.id().split('-').next().unwrap_or(self.id())
    }
}

/// Hierarchy/lineage context carried in `additionalContext`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdditionalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_repo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Lineage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_job_definition_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_definition_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

/// The canonical job payload pushed to IPFS and referenced on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsJobPayload {
    pub network_id: String,
    pub blueprint: Blueprint,
    pub job_name: String,
    pub job_definition_id: Uuid,
    pub enabled_tools: HashSet<String>,
    pub tools: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub nonce: Uuid,
    pub additional_context: AdditionalContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venture_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_metadata: Option<CodeMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_policy: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_request_id: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_definition_id: Option<Uuid>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_spec: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_spec: Option<serde_json::Value>,
    #[serde(default)]
    pub cyclic: bool,
}

/// Status of a durable transaction-queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Pending,
    Claimed,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Claimed => "CLAIMED",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TxStatus::Pending),
            "CLAIMED" => Ok(TxStatus::Claimed),
            "CONFIRMED" => Ok(TxStatus::Confirmed),
            "FAILED" => Ok(TxStatus::Failed),
            other => Err(format!("unknown tx status: {other}")),
        }
    }
}

/// How a transaction is to be submitted: directly from an EOA, or routed
/// through the Service Safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStrategy {
    Eoa,
    Safe,
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EOA" => Ok(ExecutionStrategy::Eoa),
            "SAFE" => Ok(ExecutionStrategy::Safe),
            other => Err(format!("unknown execution strategy: {other}")),
        }
    }
}

/// The payload of a to-be-submitted transaction: an allowlisted on-chain call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedTransaction {
    pub to: Address,
    pub data: Vec<u8>,
    pub value: u128,
}

/// A durable row in the transaction queue.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub id: Uuid,
    pub status: TxStatus,
    pub attempt_count: i64,
    pub payload_hash: String,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub chain_id: u64,
    pub execution_strategy: ExecutionStrategy,
    pub payload: serde_json::Value,
    pub safe_tx_hash: Option<B256>,
    pub tx_hash: Option<B256>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub template_id: Uuid,
    pub cron: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venture {
    pub id: Uuid,
    pub schedule_entries: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SituationArtifactMeta {
    pub recognition: serde_json::Value,
    pub embedding_status: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SituationArtifact {
    pub summary_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub meta: SituationArtifactMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_prefix_extracts_before_first_dash() {
        let inv = Invariant::Boolean {
            id: "COORD-FAILED-CHILDREN".to_string(),
            condition: "no failed children".to_string(),
            assessment: "".to_string(),
            examples: None,
        };
        assert_eq!(inv.prefix(), "COORD");
    }

    #[test]
    fn tx_status_round_trips_through_str() {
        use std::str::FromStr;
        for s in ["PENDING", "CLAIMED", "CONFIRMED", "FAILED"] {
            let status = TxStatus::from_str(s).unwrap();
            assert_eq!(status.as_str(), s);
        }
    }
}

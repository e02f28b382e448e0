//! Phase-1 context providers: populate a [`BlueprintContext`] with data the
//! invariant providers need but can't fetch themselves (they're pure).

use std::time::Duration;

use mech_runtime::ipfs::{directory_cid_from_multihash, IpfsClient};
use mech_runtime::WorkerError;

use crate::index_client::IndexClient;

use super::{BlueprintContext, BlueprintInput, ContextProvider};

const CHILD_SUMMARY_TIMEOUT: Duration = Duration::from_secs(8);

/// Fetches the job definition's children and, for any child that has
/// already delivered, its summary from the IPFS gateway.
pub struct JobContextProvider {
    index: IndexClient,
    ipfs: IpfsClient,
}

impl JobContextProvider {
    pub fn new(index: IndexClient, ipfs: IpfsClient) -> Self {
        Self { index, ipfs }
    }
}

#[async_trait::async_trait]
impl ContextProvider for JobContextProvider {
    async fn populate(&self, input: &BlueprintInput, ctx: &mut BlueprintContext) -> Result<(), WorkerError> {
        let children = self
            .index
            .job_definition_children(input.job_definition.job_definition_id)
            .await?;

        for child in &children {
            if child.last_status != "COMPLETED" {
                continue;
            }
            let delivered = self.index.requests_for_job_definition(child.id).await?;
            let Some(row) = delivered.iter().find(|r| r.delivery_ipfs_hash.is_some()) else {
                continue;
            };
            let request_id = row.id;
            let dir_cid = directory_cid_from_multihash(row.delivery_ipfs_hash.unwrap());
            match self
                .ipfs
                .fetch_directory_entry(&dir_cid, &format!("{request_id}"), CHILD_SUMMARY_TIMEOUT)
                .await
            {
                Ok(summary) => {
                    ctx.child_summaries.insert(child.id, summary);
                }
                Err(e) => {
                    tracing::warn!(child_id = %child.id, error = %e, "failed to fetch child summary, continuing without it");
                }
            }
        }

        ctx.children = children;
        Ok(())
    }
}

/// Passes the checkpoint driver's last-recorded progress snapshot through
/// to the blueprint context unchanged — the builder doesn't reach into the
/// checkpoint store itself.
pub struct ProgressCheckpointProvider;

#[async_trait::async_trait]
impl ContextProvider for ProgressCheckpointProvider {
    async fn populate(&self, input: &BlueprintInput, ctx: &mut BlueprintContext) -> Result<(), WorkerError> {
        ctx.checkpoint_progress = input.checkpoint_progress.clone();
        Ok(())
    }
}

/// Passes through which mission invariants haven't yet been measured on a
/// re-run, for the coordination invariant provider's COORD-UNMEASURED rule.
pub struct MeasurementContextProvider;

#[async_trait::async_trait]
impl ContextProvider for MeasurementContextProvider {
    async fn populate(&self, input: &BlueprintInput, ctx: &mut BlueprintContext) -> Result<(), WorkerError> {
        ctx.unmeasured_mission_invariant_ids = input.unmeasured_mission_invariant_ids.clone();
        ctx.is_rerun = input.is_rerun;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_runtime::types::{Blueprint, JobDefinition};
    use std::collections::HashSet;
    use uuid::Uuid;

    fn job_definition() -> JobDefinition {
        JobDefinition {
            job_definition_id: Uuid::new_v4(),
            name: "test".to_string(),
            enabled_tools: HashSet::new(),
            blueprint: Blueprint::default(),
            code_metadata: None,
            source_job_definition_id: None,
        }
    }

    fn input() -> BlueprintInput {
        BlueprintInput {
            job_definition: job_definition(),
            parent_job_definition_id: None,
            is_rerun: true,
            is_verification_task: false,
            merge_conflicts_detected: false,
            checkpoint_progress: Some(serde_json::json!({"step": 2})),
            unmeasured_mission_invariant_ids: vec!["JOB-SCOPE".to_string()],
        }
    }

    #[tokio::test]
    async fn progress_checkpoint_provider_passes_through_snapshot() {
        let mut ctx = BlueprintContext::default();
        ProgressCheckpointProvider.populate(&input(), &mut ctx).await.unwrap();
        assert_eq!(ctx.checkpoint_progress, Some(serde_json::json!({"step": 2})));
    }

    #[tokio::test]
    async fn measurement_context_provider_carries_unmeasured_ids_and_rerun_flag() {
        let mut ctx = BlueprintContext::default();
        MeasurementContextProvider.populate(&input(), &mut ctx).await.unwrap();
        assert!(ctx.is_rerun);
        assert_eq!(ctx.unmeasured_mission_invariant_ids, vec!["JOB-SCOPE".to_string()]);
    }
}

//! Blueprint Builder (§4.6): assembles a job's [`Blueprint`] — its list of
//! invariants and template metadata — from two phases of providers, then
//! renders it into the system prompt handed to the coding agent.
//!
//! Phase 1 (context providers) populate a [`BlueprintContext`] with
//! read/write access to the worker's external state (index, IPFS gateway,
//! checkpoint, measurement results). Phase 2 (invariant providers) consume
//! that context read-only and each emit a slice of the final invariant list.
//! This separation keeps invariant providers pure and unit-testable: feed a
//! `BlueprintContext` in, get a `Vec<Invariant>` out, no I/O.
//!
//! Invariants are ordered two different ways depending on consumer: the
//! stored `blueprint.invariants` list is sorted by *layer* (action, job,
//! protocol), while `build_prompt` groups the same invariants into three
//! *prompt sections* (immediate, mission, protocol) for rendering. The two
//! groupings share prefixes but are not identical — see `layer_of` and
//! `prompt_section_of`.

pub mod context_providers;
pub mod invariant_providers;

use mech_runtime::types::{Blueprint, Invariant, JobDefinition};
use mech_runtime::WorkerError;
use uuid::Uuid;

use crate::index_client::ChildJobRow;

pub use context_providers::{JobContextProvider, MeasurementContextProvider, ProgressCheckpointProvider};
pub use invariant_providers::*;

/// Everything the Blueprint Builder needs to know about the job it's
/// building a blueprint for, supplied by the caller (the request lifecycle
/// engine or the venture watcher's dispatch path).
#[derive(Debug, Clone)]
pub struct BlueprintInput {
    pub job_definition: JobDefinition,
    pub parent_job_definition_id: Option<Uuid>,
    pub is_rerun: bool,
    pub is_verification_task: bool,
    pub merge_conflicts_detected: bool,
    pub checkpoint_progress: Option<serde_json::Value>,
    pub unmeasured_mission_invariant_ids: Vec<String>,
}

/// Mutable scratch space populated by context providers and read by
/// invariant providers.
#[derive(Debug, Clone, Default)]
pub struct BlueprintContext {
    pub job_definition: Option<JobDefinition>,
    pub parent_job_definition_id: Option<Uuid>,
    pub children: Vec<ChildJobRow>,
    pub child_summaries: std::collections::HashMap<Uuid, serde_json::Value>,
    pub is_rerun: bool,
    pub is_verification_task: bool,
    pub merge_conflicts_detected: bool,
    pub checkpoint_progress: Option<serde_json::Value>,
    pub unmeasured_mission_invariant_ids: Vec<String>,
}

impl BlueprintContext {
    fn job_definition(&self) -> &JobDefinition {
        self.job_definition
            .as_ref()
            .expect("job_definition populated before invariant providers run")
    }

    pub fn completed_children_with_branch(&self) -> Vec<&ChildJobRow> {
        self.children
            .iter()
            .filter(|c| c.last_status == "COMPLETED" && c.branch.is_some())
            .collect()
    }

    pub fn completed_children_without_branch(&self) -> Vec<&ChildJobRow> {
        self.children
            .iter()
            .filter(|c| c.last_status == "COMPLETED" && c.branch.is_none())
            .collect()
    }

    pub fn any_child_failed(&self) -> bool {
        self.children.iter().any(|c| c.last_status == "FAILED")
    }

    pub fn has_active_children(&self) -> bool {
        self.children
            .iter()
            .any(|c| c.last_status != "COMPLETED" && c.last_status != "FAILED")
    }

    /// Count of this job's own mission invariants (the set `COORD-UNMEASURED`
    /// checks "all unmeasured" against).
    pub fn job_definition_mission_invariant_count(&self) -> usize {
        self.job_definition
            .as_ref()
            .map(|jd| {
                jd.blueprint
                    .invariants
                    .iter()
                    .filter(|inv| matches!(inv.prefix(), "JOB" | "GOAL" | "OUT" | "STRAT"))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
pub trait ContextProvider: Send + Sync {
    async fn populate(&self, input: &BlueprintInput, ctx: &mut BlueprintContext) -> Result<(), WorkerError>;
}

pub trait InvariantProvider: Send + Sync {
    fn provide(&self, ctx: &BlueprintContext) -> Vec<Invariant>;
}

/// The layer an invariant's prefix sorts into for the stored
/// `blueprint.invariants` list: action-level invariants first, then
/// job/goal invariants, then everything else (system, output, strategy,
/// recovery, learning, tooling, cycle protocol invariants).
fn layer_of(prefix: &str) -> u8 {
    match prefix {
        "COORD" | "STATE" | "QUAL" => 0,
        "JOB" | "GOAL" => 1,
        _ => 2,
    }
}

/// The prompt section an invariant's prefix renders under. Distinct from
/// `layer_of`: `RECOV` renders immediately but sorts into the protocol
/// layer, and `STATE` sorts into the action layer but isn't called out by
/// name in any prompt section, so it falls into the protocol catch-all here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PromptSection {
    Immediate,
    Mission,
    Protocol,
}

fn prompt_section_of(prefix: &str) -> PromptSection {
    match prefix {
        "COORD" | "QUAL" | "RECOV" => PromptSection::Immediate,
        "JOB" | "GOAL" | "OUT" | "STRAT" => PromptSection::Mission,
        _ => PromptSection::Protocol,
    }
}

pub struct BlueprintBuilder {
    context_providers: Vec<Box<dyn ContextProvider>>,
    invariant_providers: Vec<Box<dyn InvariantProvider>>,
}

impl BlueprintBuilder {
    pub fn new() -> Self {
        Self {
            context_providers: Vec::new(),
            invariant_providers: Vec::new(),
        }
    }

    pub fn with_context_provider(mut self, provider: Box<dyn ContextProvider>) -> Self {
        self.context_providers.push(provider);
        self
    }

    pub fn with_invariant_provider(mut self, provider: Box<dyn InvariantProvider>) -> Self {
        self.invariant_providers.push(provider);
        self
    }

    /// The standard phase-2 invariant provider set: one passthrough provider
    /// per prefix the job definition's own invariants may already carry,
    /// plus the dynamic coordination provider.
    pub fn with_standard_invariant_providers(self) -> Self {
        self.with_invariant_provider(Box::new(SystemInvariantProvider))
            .with_invariant_provider(Box::new(OutputInvariantProvider))
            .with_invariant_provider(Box::new(StrategyInvariantProvider))
            .with_invariant_provider(Box::new(RecoveryInvariantProvider))
            .with_invariant_provider(Box::new(GoalInvariantProvider))
            .with_invariant_provider(Box::new(LearningInvariantProvider))
            .with_invariant_provider(Box::new(CoordinationInvariantProvider))
            .with_invariant_provider(Box::new(StateInvariantProvider))
            .with_invariant_provider(Box::new(ToolingInvariantProvider))
            .with_invariant_provider(Box::new(QualityInvariantProvider))
            .with_invariant_provider(Box::new(CycleInvariantProvider))
    }

    pub async fn build(&self, input: BlueprintInput) -> Result<Blueprint, WorkerError> {
        let mut ctx = BlueprintContext {
            job_definition: Some(input.job_definition.clone()),
            parent_job_definition_id: input.parent_job_definition_id,
            is_rerun: input.is_rerun,
            is_verification_task: input.is_verification_task,
            merge_conflicts_detected: input.merge_conflicts_detected,
            checkpoint_progress: input.checkpoint_progress.clone(),
            unmeasured_mission_invariant_ids: input.unmeasured_mission_invariant_ids.clone(),
            ..Default::default()
        };

        for provider in &self.context_providers {
            provider.populate(&input, &mut ctx).await?;
        }

        let mut invariants: Vec<Invariant> = self
            .invariant_providers
            .iter()
            .flat_map(|p| p.provide(&ctx))
            .collect();
        invariants.sort_by_key(|inv| layer_of(inv.prefix()));

        Ok(Blueprint {
            invariants,
            template_meta: ctx.job_definition().blueprint.template_meta.clone(),
        })
    }

    /// Render `blueprint`'s invariants into prose, grouped by prompt section.
    pub fn build_prompt(&self, blueprint: &Blueprint, mission_brief: &str) -> String {
        let mut immediate = Vec::new();
        let mut mission = Vec::new();
        let mut protocol = Vec::new();

        for inv in &blueprint.invariants {
            let line = render_invariant_line(inv);
            match prompt_section_of(inv.prefix()) {
                PromptSection::Immediate => immediate.push(line),
                PromptSection::Mission => mission.push(line),
                PromptSection::Protocol => protocol.push(line),
            }
        }

        let mut sections = Vec::new();
        if !immediate.is_empty() {
            sections.push(format!("## Immediate\n\n{}", immediate.join("\n")));
        }
        sections.push(format!("## Mission\n\n{mission_brief}\n\n{}", mission.join("\n")));
        if !protocol.is_empty() {
            sections.push(format!("## Protocol\n\n{}", protocol.join("\n")));
        }

        sections.join("\n\n")
    }
}

impl Default for BlueprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn render_invariant_line(inv: &Invariant) -> String {
    match inv {
        Invariant::Boolean { id, condition, .. } => format!("- [{id}] {condition}"),
        Invariant::Floor { id, metric, min } => format!("- [{id}] {metric} >= {min}"),
        Invariant::Ceiling { id, metric, max } => format!("- [{id}] {metric} <= {max}"),
        Invariant::Range { id, metric, min, max } => format!("- [{id}] {min} <= {metric} <= {max}"),
    }
}

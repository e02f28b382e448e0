//! Phase-2 invariant providers. Most are passthroughs: the job definition's
//! own blueprint already carries invariants authored for that job, tagged by
//! ID prefix, and each of these providers just filters for its prefix so the
//! builder can re-assemble and re-order them. The coordination provider is
//! the one genuinely dynamic provider — it synthesizes invariants from the
//! state of the job's children rather than passing anything through.

use mech_runtime::types::Invariant;

use super::{BlueprintContext, InvariantProvider};

fn passthrough(ctx: &BlueprintContext, prefix: &str) -> Vec<Invariant> {
    ctx.job_definition
        .as_ref()
        .map(|jd| {
            jd.blueprint
                .invariants
                .iter()
                .filter(|inv| inv.prefix() == prefix)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

macro_rules! passthrough_provider {
    ($name:ident, $prefix:literal) => {
        pub struct $name;
        impl InvariantProvider for $name {
            fn provide(&self, ctx: &BlueprintContext) -> Vec<Invariant> {
                passthrough(ctx, $prefix)
            }
        }
    };
}

passthrough_provider!(SystemInvariantProvider, "SYS");
passthrough_provider!(OutputInvariantProvider, "OUT");
passthrough_provider!(StrategyInvariantProvider, "STRAT");
passthrough_provider!(RecoveryInvariantProvider, "RECOV");
passthrough_provider!(GoalInvariantProvider, "GOAL");
passthrough_provider!(LearningInvariantProvider, "LEARN");
passthrough_provider!(StateInvariantProvider, "STATE");
passthrough_provider!(ToolingInvariantProvider, "TOOL");
passthrough_provider!(QualityInvariantProvider, "QUAL");
passthrough_provider!(CycleInvariantProvider, "CYCLE");

fn boolean(id: &str, condition: &str, assessment: &str) -> Invariant {
    Invariant::Boolean {
        id: id.to_string(),
        condition: condition.to_string(),
        assessment: assessment.to_string(),
        examples: None,
    }
}

/// The one dynamic invariant provider: picks exactly the coordination
/// invariants that apply given the current state of this job's children.
pub struct CoordinationInvariantProvider;

impl InvariantProvider for CoordinationInvariantProvider {
    fn provide(&self, ctx: &BlueprintContext) -> Vec<Invariant> {
        let mut invariants = Vec::new();

        if ctx.any_child_failed() {
            invariants.push(boolean(
                "COORD-FAILED-CHILDREN",
                "at least one child job has failed and must be triaged before new work starts",
                "inspect failed child job reports and either retry or redirect the affected branch",
            ));
        } else if !ctx.is_verification_task {
            invariants.push(boolean(
                "COORD-PARENT-ROLE",
                "this job coordinates child jobs rather than doing the work directly",
                "delegate implementation work to child jobs and synthesize their results",
            ));
        }

        if ctx.merge_conflicts_detected {
            invariants.push(boolean(
                "COORD-MERGE-CONFLICTS",
                "one or more dependency branches conflict and must be reconciled before merge",
                "resolve the conflicting branches before integrating further child output",
            ));
        }

        let with_branch = ctx.completed_children_with_branch();
        if !with_branch.is_empty() {
            invariants.push(boolean(
                "COORD-BRANCH-REVIEW",
                "completed child branches exist that have not yet been reviewed and integrated",
                "review each unintegrated branch and merge or request changes",
            ));
        }

        let without_branch = ctx.completed_children_without_branch();
        if !without_branch.is_empty() {
            invariants.push(boolean(
                "COORD-ARTIFACT-CHILDREN",
                "completed children delivered artifacts without a code branch to integrate",
                "fold each child's artifact output into the parent's situation summary",
            ));
        }

        let all_unmeasured = !ctx.unmeasured_mission_invariant_ids.is_empty()
            && ctx.unmeasured_mission_invariant_ids.len() == ctx.job_definition_mission_invariant_count();
        let suppress_unmeasured = all_unmeasured && ctx.has_active_children();
        if ctx.is_rerun && !ctx.unmeasured_mission_invariant_ids.is_empty() && !suppress_unmeasured {
            invariants.push(boolean(
                "COORD-UNMEASURED",
                "this is a re-run and some mission invariants were never measured last attempt",
                "prioritize measuring the previously-unmeasured mission invariants this cycle",
            ));
        }

        invariants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_client::ChildJobRow;
    use uuid::Uuid;

    fn child(status: &str, branch: Option<&str>) -> ChildJobRow {
        ChildJobRow {
            id: Uuid::new_v4(),
            name: "child".to_string(),
            last_status: status.to_string(),
            branch: branch.map(|b| b.to_string()),
        }
    }

    #[test]
    fn failed_children_take_priority_over_parent_role() {
        let mut ctx = BlueprintContext::default();
        ctx.children = vec![child("FAILED", None)];
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(ids.contains(&"COORD-FAILED-CHILDREN"));
        assert!(!ids.contains(&"COORD-PARENT-ROLE"));
    }

    #[test]
    fn parent_role_applies_when_no_failures_and_not_verification() {
        let ctx = BlueprintContext::default();
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(ids.contains(&"COORD-PARENT-ROLE"));
    }

    #[test]
    fn verification_tasks_never_get_parent_role() {
        let mut ctx = BlueprintContext::default();
        ctx.is_verification_task = true;
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(!ids.contains(&"COORD-PARENT-ROLE"));
    }

    #[test]
    fn branch_and_artifact_children_are_distinguished() {
        let mut ctx = BlueprintContext::default();
        ctx.children = vec![child("COMPLETED", Some("feature/x")), child("COMPLETED", None)];
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(ids.contains(&"COORD-BRANCH-REVIEW"));
        assert!(ids.contains(&"COORD-ARTIFACT-CHILDREN"));
    }

    fn job_definition_with_mission_invariants(ids: &[&str]) -> mech_runtime::types::JobDefinition {
        mech_runtime::types::JobDefinition {
            job_definition_id: Uuid::new_v4(),
            name: "test".to_string(),
            enabled_tools: std::collections::HashSet::new(),
            blueprint: mech_runtime::types::Blueprint {
                invariants: ids
                    .iter()
                    .map(|id| {
                        Invariant::Boolean {
                            id: id.to_string(),
                            condition: String::new(),
                            assessment: String::new(),
                            examples: None,
                        }
                    })
                    .collect(),
                template_meta: None,
            },
            code_metadata: None,
            source_job_definition_id: None,
        }
    }

    #[test]
    fn unmeasured_is_suppressed_when_all_unmeasured_and_children_still_active() {
        let mut ctx = BlueprintContext::default();
        ctx.job_definition = Some(job_definition_with_mission_invariants(&["JOB-A", "GOAL-A"]));
        ctx.is_rerun = true;
        ctx.unmeasured_mission_invariant_ids = vec!["JOB-A".to_string(), "GOAL-A".to_string()];
        ctx.children = vec![child("RUNNING", None)];
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(!ids.contains(&"COORD-UNMEASURED"));
    }

    #[test]
    fn unmeasured_fires_on_rerun_with_no_active_children() {
        let mut ctx = BlueprintContext::default();
        ctx.job_definition = Some(job_definition_with_mission_invariants(&["JOB-A", "GOAL-A"]));
        ctx.is_rerun = true;
        ctx.unmeasured_mission_invariant_ids = vec!["JOB-A".to_string(), "GOAL-A".to_string()];
        let invariants = CoordinationInvariantProvider.provide(&ctx);
        let ids: Vec<&str> = invariants.iter().map(|i| i.id()).collect();
        assert!(ids.contains(&"COORD-UNMEASURED"));
    }
}

//! IPFS Payload Builder (§4.5): assembles the canonical [`IpfsJobPayload`]
//! pushed to the gateway and referenced on-chain, starting from a built
//! [`Blueprint`] and the request's additional context.
//!
//! Two Open Questions from the spec are resolved here (see `DESIGN.md`):
//! inherited env is validated against an explicit allow-list rather than
//! passed through uninspected, and `ventureId`/`templateId` are always
//! propagated when present; and an agent-initiated payload that carries
//! `workspaceRepo` without an explicit human-origin flag is rejected rather
//! than silently granting it a writable workspace.

use std::collections::HashSet;

use uuid::Uuid;

use mech_runtime::types::{
    AdditionalContext, Blueprint, CodeMetadata, IpfsJobPayload, Lineage,
};
use mech_runtime::WorkerError;

/// Universal tools available to every job regardless of template, mirroring
/// the always-on toolset every coding agent profile carries.
pub const UNIVERSAL_TOOLS: &[&str] = &["read_file", "write_file", "list_directory", "run_shell", "web_search"];

/// Additional tools injected only for coding jobs (jobs that carry code
/// metadata / a branch to work on).
pub const CODING_TOOLS: &[&str] = &["git_diff", "git_commit", "git_push", "run_tests"];

/// Models the Control API denylists outright regardless of a template's
/// `allowedModels`.
const MODEL_DENYLIST: &[&str] = &["gpt-3.5-turbo", "text-davinci-003"];

#[derive(Debug, Clone)]
pub struct PayloadInput {
    pub job_definition_id: Uuid,
    pub job_name: String,
    pub enabled_tools: HashSet<String>,
    pub blueprint: Blueprint,
    pub is_coding_job: bool,
    pub model: Option<String>,
    pub allowed_models: Option<Vec<String>>,
    pub additional_context: AdditionalContext,
    pub inherited_env: std::collections::HashMap<String, String>,
    pub inherited_env_allowlist: HashSet<String>,
    pub venture_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub lineage: Lineage,
    pub code_metadata: Option<CodeMetadata>,
    pub base_branch: Option<String>,
    pub default_branch: String,
    pub is_agent_initiated: bool,
    pub allow_human_workspace_repo: bool,
    pub source_request_id: Option<alloy::primitives::B256>,
    pub source_job_definition_id: Option<Uuid>,
    pub dependencies: Vec<Uuid>,
    pub input_spec: Option<serde_json::Value>,
    pub output_spec: Option<serde_json::Value>,
    pub cyclic: bool,
}

/// Normalize a model name to its family for allow-list comparison, e.g.
/// `"gemini-2.5-pro-exp"` and `"gemini-2.5-pro"` both normalize to
/// `"gemini-2.5-pro"` by stripping a trailing `-exp`/`-preview` suffix.
fn normalize_model_family(model: &str) -> String {
    model
        .trim_end_matches("-exp")
        .trim_end_matches("-preview")
        .to_string()
}

fn validate_model(model: &str, allowed_models: &Option<Vec<String>>) -> Result<(), WorkerError> {
    let family = normalize_model_family(model);
    if MODEL_DENYLIST.contains(&family.as_str()) {
        return Err(WorkerError::ValidationError(format!(
            "model {model} is denylisted"
        )));
    }
    if let Some(allowed) = allowed_models {
        let families: Vec<String> = allowed.iter().map(|m| normalize_model_family(m)).collect();
        if !families.contains(&family) {
            return Err(WorkerError::ValidationError(format!(
                "model {model} is not in the allowed set for this template"
            )));
        }
    }
    Ok(())
}

/// Validate that every inherited env var key is present in the allow-list.
/// Resolves Open Question 1: the stricter variant, rejecting env keys the
/// template doesn't explicitly name rather than passing them through.
fn assert_valid_inherited_env(
    inherited_env: &std::collections::HashMap<String, String>,
    allowlist: &HashSet<String>,
) -> Result<(), WorkerError> {
    for key in inherited_env.keys() {
        if !allowlist.contains(key) {
            return Err(WorkerError::ValidationError(format!(
                "env var {key} is not in the job's allowed env map"
            )));
        }
    }
    Ok(())
}

/// Resolves Open Question 2: an agent-initiated payload carrying
/// `workspaceRepo` is rejected unless the caller has explicitly marked this
/// dispatch as human-originated.
fn assert_workspace_repo_boundary(
    additional_context: &AdditionalContext,
    is_agent_initiated: bool,
    allow_human_workspace_repo: bool,
) -> Result<(), WorkerError> {
    if additional_context.workspace_repo.is_some() && is_agent_initiated && !allow_human_workspace_repo {
        return Err(WorkerError::ValidationError(
            "agent-initiated payloads may not carry workspaceRepo without explicit human origin".into(),
        ));
    }
    Ok(())
}

fn resolve_branch_metadata(input: &PayloadInput) -> (Option<CodeMetadata>, Option<String>, Option<String>) {
    if !input.is_coding_job {
        return (None, None, None);
    }
    if let Some(existing) = &input.code_metadata {
        return (
            Some(existing.clone()),
            Some(existing.branch_name.clone()),
            Some(existing.base_branch.clone()),
        );
    }

    let base_branch = input
        .base_branch
        .clone()
        .or_else(|| input.lineage.base_branch.clone())
        .unwrap_or_else(|| input.default_branch.clone());
    let branch_name = format!("job/{}", input.job_definition_id);
    (None, Some(branch_name), Some(base_branch))
}

fn tools_for(input: &PayloadInput) -> Vec<serde_json::Value> {
    let mut tools: Vec<&str> = UNIVERSAL_TOOLS.to_vec();
    if input.is_coding_job {
        tools.extend_from_slice(CODING_TOOLS);
    }
    tools.into_iter().map(|t| serde_json::Value::String(t.to_string())).collect()
}

/// The template's `enabled_tools` plus the universal toolset (and the coding
/// meta-tools for coding jobs) — `enabledTools` must always be a superset of
/// what every job carries regardless of template, the same guarantee
/// `tools_for` gives the `tools` list.
fn enabled_tools_for(input: &PayloadInput) -> HashSet<String> {
    let mut tools = input.enabled_tools.clone();
    tools.extend(UNIVERSAL_TOOLS.iter().map(|t| t.to_string()));
    if input.is_coding_job {
        tools.extend(CODING_TOOLS.iter().map(|t| t.to_string()));
    }
    tools
}

/// Build the canonical job payload. Fails closed on model-policy and
/// env/workspace boundary violations rather than silently dropping fields.
pub fn build_payload(input: PayloadInput) -> Result<IpfsJobPayload, WorkerError> {
    if let Some(model) = &input.model {
        validate_model(model, &input.allowed_models)?;
    }
    assert_valid_inherited_env(&input.inherited_env, &input.inherited_env_allowlist)?;
    assert_workspace_repo_boundary(
        &input.additional_context,
        input.is_agent_initiated,
        input.allow_human_workspace_repo,
    )?;

    let mut additional_context = input.additional_context.clone();
    additional_context.env.extend(input.inherited_env.clone());

    let (code_metadata, branch_name, base_branch) = resolve_branch_metadata(&input);
    let tools = tools_for(&input);

    Ok(IpfsJobPayload {
        network_id: "jinn".to_string(),
        blueprint: input.blueprint,
        job_name: input.job_name,
        job_definition_id: input.job_definition_id,
        enabled_tools: enabled_tools_for(&input),
        tools,
        allowed_models: input.allowed_models,
        model: input.model,
        nonce: Uuid::new_v4(),
        additional_context,
        workstream_id: None,
        venture_id: input.venture_id,
        template_id: input.template_id,
        lineage: input.lineage,
        code_metadata,
        branch_name,
        base_branch,
        execution_policy: None,
        source_request_id: input.source_request_id,
        source_job_definition_id: input.source_job_definition_id,
        dependencies: input.dependencies,
        input_spec: input.input_spec,
        output_spec: input.output_spec,
        cyclic: input.cyclic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_runtime::types::Blueprint;

    fn base_input() -> PayloadInput {
        PayloadInput {
            job_definition_id: Uuid::new_v4(),
            job_name: "job".to_string(),
            enabled_tools: HashSet::new(),
            blueprint: Blueprint::default(),
            is_coding_job: false,
            model: None,
            allowed_models: None,
            additional_context: AdditionalContext::default(),
            inherited_env: Default::default(),
            inherited_env_allowlist: HashSet::new(),
            venture_id: None,
            template_id: None,
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
        }
    }

    #[test]
    fn universal_tools_are_always_present() {
        let payload = build_payload(base_input()).unwrap();
        let names: Vec<String> = payload
            .tools
            .iter()
            .map(|t| t.as_str().unwrap().to_string())
            .collect();
        for tool in UNIVERSAL_TOOLS {
            assert!(names.contains(&tool.to_string()));
        }
    }

    #[test]
    fn universal_tools_are_always_present_in_enabled_tools() {
        let mut input = base_input();
        input.enabled_tools.insert("custom_tool".to_string());
        let payload = build_payload(input).unwrap();
        for tool in UNIVERSAL_TOOLS {
            assert!(payload.enabled_tools.contains(*tool));
        }
        assert!(payload.enabled_tools.contains("custom_tool"));
    }

    #[test]
    fn coding_jobs_get_process_branch_tooling_in_enabled_tools() {
        let mut input = base_input();
        input.is_coding_job = true;
        let payload = build_payload(input).unwrap();
        for tool in CODING_TOOLS {
            assert!(payload.enabled_tools.contains(*tool));
        }
    }

    #[test]
    fn coding_jobs_get_process_branch_tooling() {
        let mut input = base_input();
        input.is_coding_job = true;
        let payload = build_payload(input).unwrap();
        let names: Vec<String> = payload
            .tools
            .iter()
            .map(|t| t.as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"git_commit".to_string()));
    }

    #[test]
    fn denylisted_model_is_rejected() {
        let mut input = base_input();
        input.model = Some("gpt-3.5-turbo".to_string());
        let err = build_payload(input).unwrap_err();
        assert!(matches!(err, WorkerError::ValidationError(_)));
    }

    #[test]
    fn model_outside_allowed_set_is_rejected() {
        let mut input = base_input();
        input.model = Some("claude-3-opus".to_string());
        input.allowed_models = Some(vec!["gemini-2.5-pro".to_string()]);
        let err = build_payload(input).unwrap_err();
        assert!(matches!(err, WorkerError::ValidationError(_)));
    }

    #[test]
    fn model_family_normalization_accepts_exp_suffix() {
        let mut input = base_input();
        input.model = Some("gemini-2.5-pro-exp".to_string());
        input.allowed_models = Some(vec!["gemini-2.5-pro".to_string()]);
        assert!(build_payload(input).is_ok());
    }

    #[test]
    fn inherited_env_outside_allowlist_is_rejected() {
        let mut input = base_input();
        input.inherited_env.insert("SECRET_KEY".to_string(), "x".to_string());
        let err = build_payload(input).unwrap_err();
        assert!(matches!(err, WorkerError::ValidationError(_)));
    }

    #[test]
    fn inherited_env_within_allowlist_is_merged_into_additional_context() {
        let mut input = base_input();
        input.inherited_env.insert("API_BASE".to_string(), "https://x".to_string());
        input.inherited_env_allowlist.insert("API_BASE".to_string());
        let payload = build_payload(input).unwrap();
        assert_eq!(payload.additional_context.env.get("API_BASE").unwrap(), "https://x");
    }

    #[test]
    fn agent_initiated_workspace_repo_without_human_flag_is_rejected() {
        let mut input = base_input();
        input.is_agent_initiated = true;
        input.additional_context.workspace_repo = Some("org/repo".to_string());
        let err = build_payload(input).unwrap_err();
        assert!(matches!(err, WorkerError::ValidationError(_)));
    }

    #[test]
    fn human_initiated_workspace_repo_is_allowed() {
        let mut input = base_input();
        input.is_agent_initiated = true;
        input.allow_human_workspace_repo = true;
        input.additional_context.workspace_repo = Some("org/repo".to_string());
        assert!(build_payload(input).is_ok());
    }

    #[test]
    fn venture_and_template_ids_always_propagate_when_present() {
        let mut input = base_input();
        input.venture_id = Some(Uuid::new_v4());
        input.template_id = Some(Uuid::new_v4());
        let payload = build_payload(input.clone()).unwrap();
        assert_eq!(payload.venture_id, input.venture_id);
        assert_eq!(payload.template_id, input.template_id);
    }

    #[test]
    fn coding_job_without_existing_code_metadata_creates_a_new_branch() {
        let mut input = base_input();
        input.is_coding_job = true;
        input.base_branch = Some("develop".to_string());
        let payload = build_payload(input).unwrap();
        assert_eq!(payload.base_branch, Some("develop".to_string()));
        assert!(payload.branch_name.unwrap().starts_with("job/"));
    }

    #[test]
    fn coding_job_with_existing_code_metadata_reuses_it() {
        let mut input = base_input();
        input.is_coding_job = true;
        input.code_metadata = Some(CodeMetadata {
            repo_url: "https://example.com/repo.git".to_string(),
            branch_name: "feature/existing".to_string(),
            base_branch: "main".to_string(),
        });
        let payload = build_payload(input).unwrap();
        assert_eq!(payload.branch_name, Some("feature/existing".to_string()));
    }
}

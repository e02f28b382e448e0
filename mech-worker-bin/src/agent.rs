//! Agent subprocess launcher (§1 external collaborator): spawns the
//! language-model agent as a child process, threads request context through
//! to it via `JINN_*` environment variables plus the signing proxy's
//! localhost URL and bearer secret, and parses its structured JSON output
//! off stdout once it exits.
//!
//! The agent binary itself is out of scope here — this module only owns the
//! process boundary: what it's told and what it's expected to hand back.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;

use mech_runtime::WorkerError;

/// Snapshot of the job context to thread through to the child process as
/// `JINN_*` env vars, derived from the job once at spawn time rather than
/// carried as ambient global state.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub request_id: String,
    pub job_definition_id: String,
    pub workstream_id: Option<String>,
    pub venture_id: Option<String>,
    pub parent_request_id: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub completed_children: Vec<String>,
    pub child_work_reviewed: bool,
    pub required_tools: Vec<String>,
    pub available_tools: Vec<String>,
    pub blueprint_invariant_ids: Vec<String>,
    pub allowed_models: Option<Vec<String>>,
    pub default_model: Option<String>,
    pub inherited_env: HashMap<String, String>,
}

impl JobContext {
    fn into_env_vars(self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("JINN_REQUEST_ID".to_string(), self.request_id),
            ("JINN_JOB_DEFINITION_ID".to_string(), self.job_definition_id),
            (
                "JINN_CHILD_WORK_REVIEWED".to_string(),
                self.child_work_reviewed.to_string(),
            ),
            (
                "JINN_REQUIRED_TOOLS".to_string(),
                self.required_tools.join(","),
            ),
            (
                "JINN_AVAILABLE_TOOLS".to_string(),
                self.available_tools.join(","),
            ),
            (
                "JINN_BLUEPRINT_INVARIANT_IDS".to_string(),
                self.blueprint_invariant_ids.join(","),
            ),
            (
                "JINN_COMPLETED_CHILDREN".to_string(),
                self.completed_children.join(","),
            ),
        ];
        if let Some(workstream_id) = self.workstream_id {
            vars.push(("JINN_WORKSTREAM_ID".to_string(), workstream_id));
        }
        if let Some(venture_id) = self.venture_id {
            vars.push(("JINN_VENTURE_ID".to_string(), venture_id));
        }
        if let Some(parent_request_id) = self.parent_request_id {
            vars.push(("JINN_PARENT_REQUEST_ID".to_string(), parent_request_id));
        }
        if let Some(branch_name) = self.branch_name {
            vars.push(("JINN_BRANCH_NAME".to_string(), branch_name));
        }
        if let Some(base_branch) = self.base_branch {
            vars.push(("JINN_BASE_BRANCH".to_string(), base_branch));
        }
        if let Some(allowed_models) = self.allowed_models {
            vars.push(("JINN_ALLOWED_MODELS".to_string(), allowed_models.join(",")));
        }
        if let Some(default_model) = self.default_model {
            vars.push(("JINN_DEFAULT_MODEL".to_string(), default_model));
        }
        if let Ok(inherited) = serde_json::to_string(&self.inherited_env) {
            vars.push(("JINN_INHERITED_ENV".to_string(), inherited));
        }
        vars
    }
}

/// The agent's structured result, read from its stdout after it exits.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentResult {
    pub status: String,
    pub result: serde_json::Value,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub token_count: u64,
}

pub struct AgentLauncher {
    pub binary_path: String,
}

impl AgentLauncher {
    pub fn new(binary_path: String) -> Self {
        Self { binary_path }
    }

    /// Spawn the agent, wait for it to exit, and parse its structured
    /// output. `signing_proxy_url`/`signing_proxy_secret` let the agent
    /// reach the Signing Proxy for anything requiring the Agent EOA.
    pub async fn run(
        &self,
        prompt: &str,
        context: JobContext,
        signing_proxy_url: &str,
        signing_proxy_secret: &str,
    ) -> Result<AgentResult, WorkerError> {
        let mut command = Command::new(&self.binary_path);
        command
            .arg("--prompt")
            .arg(prompt)
            .env("SIGNING_PROXY_URL", signing_proxy_url)
            .env("SIGNING_PROXY_SECRET", signing_proxy_secret)
            .envs(context.into_env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = command
            .output()
            .await
            .map_err(|e| WorkerError::AgentFailure(format!("failed to spawn agent: {e}")))?;

        if !output.status.success() {
            return Err(WorkerError::AgentFailure(format!(
                "agent exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            WorkerError::AgentFailure(format!("failed to parse agent output: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_context_always_carries_ids_and_tool_lists() {
        let ctx = JobContext {
            request_id: "req-1".to_string(),
            job_definition_id: "job-1".to_string(),
            ..Default::default()
        };
        let vars = ctx.into_env_vars();
        let map: HashMap<_, _> = vars.into_iter().collect();
        assert_eq!(map.get("JINN_REQUEST_ID").unwrap(), "req-1");
        assert_eq!(map.get("JINN_JOB_DEFINITION_ID").unwrap(), "job-1");
        assert_eq!(map.get("JINN_CHILD_WORK_REVIEWED").unwrap(), "false");
    }

    #[test]
    fn job_context_omits_absent_optional_fields() {
        let ctx = JobContext::default();
        let vars = ctx.into_env_vars();
        assert!(!vars.iter().any(|(k, _)| k == "JINN_VENTURE_ID"));
        assert!(!vars.iter().any(|(k, _)| k == "JINN_BRANCH_NAME"));
    }

    #[tokio::test]
    async fn nonexistent_binary_surfaces_as_agent_failure() {
        let launcher = AgentLauncher::new("/nonexistent/path/to/agent".to_string());
        let err = launcher
            .run("do work", JobContext::default(), "http://127.0.0.1:0", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AgentFailure(_)));
    }
}

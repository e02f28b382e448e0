//! Process configuration: all tunables the worker reads from the
//! environment at startup, gathered in one place so `main.rs` doesn't
//! sprinkle `std::env::var` calls across its wiring.

use std::path::PathBuf;
use std::time::Duration;

use mech_runtime::WorkerError;

fn require_env(key: &str) -> Result<String, WorkerError> {
    std::env::var(key).map_err(|_| WorkerError::ConfigError(format!("{key} is required")))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub operate_password: String,
    pub profile_base_path: PathBuf,
    pub rpc_url: String,
    pub chain_id: u64,
    pub control_api_url: String,
    pub ledger_index_graphql_url: String,
    pub ipfs_gateway_url: String,
    pub credential_bridge_url: String,
    pub worker_staking_contract: String,
    pub worker_staking_refresh: Duration,
    pub gemini_oauth_credentials: Option<String>,
    pub gemini_api_key: Option<String>,
    pub middleware_path: PathBuf,
    pub local_queue_db_path: String,
    pub allowlist_config_path: PathBuf,
    pub agent_binary_path: String,
    pub venture_templates_path: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        let chain_id: u64 = require_env("CHAIN_ID")?
            .parse()
            .map_err(|e| WorkerError::ConfigError(format!("invalid CHAIN_ID: {e}")))?;

        let refresh_ms: u64 = env_or("WORKER_STAKING_REFRESH_MS", "300000")
            .parse()
            .map_err(|e| WorkerError::ConfigError(format!("invalid WORKER_STAKING_REFRESH_MS: {e}")))?;

        Ok(Self {
            operate_password: require_env("OPERATE_PASSWORD")?,
            profile_base_path: PathBuf::from(env_or("OPERATE_BASE_PATH", ".")),
            rpc_url: require_env("RPC_URL")?,
            chain_id,
            control_api_url: require_env("CONTROL_API_URL")?,
            ledger_index_graphql_url: require_env("PONDER_GRAPHQL_URL")?,
            ipfs_gateway_url: require_env("IPFS_GATEWAY_URL")?,
            credential_bridge_url: require_env("X402_GATEWAY_URL")?,
            worker_staking_contract: require_env("WORKER_STAKING_CONTRACT")?,
            worker_staking_refresh: Duration::from_millis(refresh_ms),
            gemini_oauth_credentials: std::env::var("GEMINI_OAUTH_CREDENTIALS").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            middleware_path: PathBuf::from(env_or("MIDDLEWARE_PATH", "middleware")),
            local_queue_db_path: env_or("LOCAL_QUEUE_DB_PATH", "mech-worker.sqlite3"),
            allowlist_config_path: PathBuf::from(require_env("ALLOWLIST_CONFIG_PATH")?),
            agent_binary_path: env_or("AGENT_BINARY_PATH", "gemini"),
            venture_templates_path: PathBuf::from(env_or("VENTURE_TEMPLATES_PATH", "templates.json")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "OPERATE_PASSWORD",
            "OPERATE_BASE_PATH",
            "RPC_URL",
            "CHAIN_ID",
            "CONTROL_API_URL",
            "PONDER_GRAPHQL_URL",
            "IPFS_GATEWAY_URL",
            "X402_GATEWAY_URL",
            "WORKER_STAKING_CONTRACT",
            "WORKER_STAKING_REFRESH_MS",
            "GEMINI_OAUTH_CREDENTIALS",
            "GEMINI_API_KEY",
            "MIDDLEWARE_PATH",
            "LOCAL_QUEUE_DB_PATH",
            "ALLOWLIST_CONFIG_PATH",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_required_var_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = WorkerConfig::from_env().unwrap_err();
        assert!(matches!(err, WorkerError::ConfigError(_)));
    }

    #[test]
    fn staking_refresh_defaults_to_five_minutes() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var("OPERATE_PASSWORD", "pw");
            std::env::set_var("RPC_URL", "http://localhost:8545");
            std::env::set_var("CHAIN_ID", "1");
            std::env::set_var("CONTROL_API_URL", "http://localhost:1");
            std::env::set_var("PONDER_GRAPHQL_URL", "http://localhost:2");
            std::env::set_var("IPFS_GATEWAY_URL", "http://localhost:3");
            std::env::set_var("X402_GATEWAY_URL", "http://localhost:4");
            std::env::set_var("WORKER_STAKING_CONTRACT", "0x0000000000000000000000000000000000000000");
            std::env::set_var("ALLOWLIST_CONFIG_PATH", "allowlist.json");
        }
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.worker_staking_refresh, Duration::from_secs(300));
        clear_all();
    }
}

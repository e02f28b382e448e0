use thiserror::Error;

/// Domain errors for the worker's chain/runtime layer.
///
/// Variants map onto the error *kinds* from the design (configuration,
/// validation, transient network, duplicate/already-done, on-chain revert)
/// rather than a single opaque string, so callers can branch on kind
/// without string-matching.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Profile error: {0}")]
    ProfileError(String),

    #[error("Allowlist violation: {0}")]
    AllowlistViolation(String),

    #[error("Chain not supported: chain_id={0}")]
    ChainNotSupported(u64),

    #[error("Chain mismatch: worker={worker}, request={request}")]
    ChainMismatch { worker: u64, request: u64 },

    #[error("Execution strategy mismatch: {0}")]
    ExecutionStrategyMismatch(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Already claimed")]
    AlreadyClaimed,

    #[error("Already delivered")]
    AlreadyDelivered,

    #[error("Duplicate payload hash")]
    DuplicatePayloadHash,

    #[error("On-chain revert: {0}")]
    OnChainRevert(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("IPFS error: {0}")]
    IpfsError(String),

    #[error("Safe transaction error: {0}")]
    SafeError(String),

    #[error("Staking filter error: {0}")]
    StakingError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Agent failure: {0}")]
    AgentFailure(String),

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl WorkerError {
    /// Allowlist-domain error code, matching the strings callers branch on
    /// (see `allowlist::validate`). `None` for errors outside that domain.
    pub fn allowlist_code(&self) -> Option<&'static str> {
        match self {
            WorkerError::ChainNotSupported(_) => Some("CHAIN_NOT_SUPPORTED"),
            WorkerError::ChainMismatch { .. } => Some("CHAIN_MISMATCH"),
            WorkerError::AllowlistViolation(_) => Some("ALLOWLIST_VIOLATION"),
            WorkerError::ExecutionStrategyMismatch(_) => Some("EXECUTION_STRATEGY_MISMATCH"),
            WorkerError::InvalidPayload(_) => Some("INVALID_PAYLOAD"),
            WorkerError::ValidationError(_) => Some("VALIDATION_ERROR"),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            WorkerError::Timeout(e.to_string())
        } else {
            WorkerError::HttpError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::SerializationError(e.to_string())
    }
}

impl From<sqlx::Error> for WorkerError {
    fn from(e: sqlx::Error) -> Self {
        WorkerError::QueueError(e.to_string())
    }
}

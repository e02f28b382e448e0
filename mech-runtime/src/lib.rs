pub mod allowlist;
pub mod chain;
pub mod checkpoint;
pub mod contracts;
pub mod error;
pub mod ipfs;
pub mod profile;
pub mod safe_tx;
pub mod staking_filter;
pub mod txqueue;
pub mod types;

pub use error::WorkerError;
pub use types::*;

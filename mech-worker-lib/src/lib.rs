//! Worker-side modules for the mech request marketplace: Blueprint Builder,
//! Control API / Credential Bridge / ledger-index clients, ERC-8128 request
//! signing, operator registration, venture watcher, IPFS payload assembly,
//! and the request lifecycle engine's pure stages.
//!
//! This crate is a library of independently testable building blocks —
//! `mech-worker-bin` wires them into the worker's actual event loop.

pub mod blueprint;
pub mod control_api;
pub mod credential_bridge;
pub mod credentials;
pub mod erc8128;
pub mod index_client;
pub mod ipfs_payload;
pub mod lifecycle;
pub mod registration;
pub mod venture_watcher;

pub use erc8128::{Erc8128Signer, SignedHeaders};

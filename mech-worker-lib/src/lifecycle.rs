//! Request Lifecycle Engine (§4.10): the pure, testable stages of the
//! worker's main loop, separated from the extractors and clients that drive
//! them — candidate selection, model policy, result-field promotion, delivery
//! payload assembly, and the idle/error sleep-duration decision. The loop
//! itself (claim → build blueprint → build payload → dispatch → await →
//! promote → deliver) lives in `mech-worker-bin`, wired against these pure
//! functions the way `provision_core` is separated from its Tangle handler.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::{Address, B256};

use crate::index_client::RequestRow;

const IDLE_SLEEP: Duration = Duration::from_secs(5);
const PARTIAL_WORK_SLEEP: Duration = Duration::from_secs(2);
const CRITICAL_ERROR_SLEEP: Duration = Duration::from_secs(30);

/// What happened on a single main-loop tick, driving how long to sleep
/// before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing to do: no undelivered requests, no due venture ticks.
    NoWork,
    /// Did some work but more is pending (e.g. one of several candidates
    /// was processed).
    PartialWork,
    /// A critical error occurred (e.g. index or signing proxy unreachable).
    CriticalError,
}

pub fn sleep_for(outcome: WorkOutcome) -> Duration {
    match outcome {
        WorkOutcome::NoWork => IDLE_SLEEP,
        WorkOutcome::PartialWork => PARTIAL_WORK_SLEEP,
        WorkOutcome::CriticalError => CRITICAL_ERROR_SLEEP,
    }
}

/// Select undelivered requests this worker's mechs should act on, in
/// block-timestamp order, skipping any already-claimed in this process.
pub fn select_candidate_requests<'a>(
    requests: &'a [RequestRow],
    mechs: &[Address],
    in_flight: &std::collections::HashSet<B256>,
) -> Vec<&'a RequestRow> {
    let mut candidates: Vec<&RequestRow> = requests
        .iter()
        .filter(|r| !r.delivered && mechs.contains(&r.mech) && !in_flight.contains(&r.id))
        .collect();
    candidates.sort_by_key(|r| r.block_timestamp);
    candidates
}

/// Normalize a model string to its family the same way the IPFS payload
/// builder does, for the worker's own model-policy gate (checked before
/// even attempting to build a payload, so a disallowed model fails fast).
pub fn model_is_allowed(model: &str, allowed_models: &Option<Vec<String>>, denylist: &[&str]) -> bool {
    let family = model.trim_end_matches("-exp").trim_end_matches("-preview");
    if denylist.contains(&family) {
        return false;
    }
    match allowed_models {
        Some(allowed) => allowed
            .iter()
            .any(|m| m.trim_end_matches("-exp").trim_end_matches("-preview") == family),
        None => true,
    }
}

/// Promote only the fields named in `output_spec` (a JSON object whose keys
/// are the allowed result fields) from the agent's raw output object. A
/// missing `output_spec` promotes the raw output unchanged.
pub fn promote_result_fields(
    raw_output: &serde_json::Value,
    output_spec: &Option<serde_json::Value>,
) -> serde_json::Value {
    let Some(spec) = output_spec else {
        return raw_output.clone();
    };
    let Some(spec_obj) = spec.as_object() else {
        return raw_output.clone();
    };
    let Some(raw_obj) = raw_output.as_object() else {
        return raw_output.clone();
    };

    let mut promoted = serde_json::Map::new();
    for key in spec_obj.keys() {
        if let Some(value) = raw_obj.get(key) {
            promoted.insert(key.clone(), value.clone());
        }
    }
    serde_json::Value::Object(promoted)
}

/// Assemble the delivery payload pinned to IPFS and referenced in the
/// on-chain `deliver` call: the promoted result plus lineage metadata the
/// index needs to resolve this delivery back to its request.
pub fn assemble_delivery_payload(
    request_id: B256,
    promoted_result: serde_json::Value,
    summary: Option<String>,
) -> serde_json::Value {
    let mut payload = HashMap::new();
    payload.insert("requestId".to_string(), serde_json::json!(format!("{request_id}")));
    payload.insert("result".to_string(), promoted_result);
    if let Some(summary) = summary {
        payload.insert("summary".to_string(), serde_json::Value::String(summary));
    }
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

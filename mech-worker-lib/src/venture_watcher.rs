//! Venture Watcher (§4.9): evaluates each venture's cron schedule entries
//! every tick, dispatches the template job definition for any entry whose
//! most recent past occurrence hasn't been dispatched yet, and guards against
//! double dispatch with an in-memory dedup map, a second-layer index check,
//! and a final claim against the Control API.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use mech_runtime::types::{ScheduleEntry, Venture};
use mech_runtime::WorkerError;

use crate::control_api::ControlApiClient;
use crate::index_client::IndexClient;

/// How far in the past a schedule entry's most recent occurrence can be and
/// still count as "due" (spec §4.9 step 1) — `lastTick` is the most recent
/// past occurrence unconditionally; it's only dropped once it's more than
/// this far behind `now`.
const SCHEDULE_GRACE: chrono::Duration = chrono::Duration::hours(24);

/// Margin added below `now - grace` when searching for the last occurrence,
/// so a tick that lands exactly on the grace boundary isn't missed to the
/// cron iterator's exclusive lower bound.
const SEARCH_MARGIN: chrono::Duration = chrono::Duration::seconds(1);

/// In-memory dedup entries older than this are evicted; the index and the
/// Control API claim remain the source of truth beyond that window.
const DEDUP_TTL: chrono::Duration = chrono::Duration::hours(24);

#[async_trait::async_trait]
pub trait TemplateDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        venture_id: Uuid,
        template_id: Uuid,
        scheduled_job_definition_id: Uuid,
    ) -> Result<(), WorkerError>;
}

/// The `cron` crate requires a 6-field expression (seconds first); the
/// spec's schedule entries use standard 5-field cron (no seconds). A
/// 5-field expression is widened to 6 fields by fixing seconds at 0.
fn normalize_cron_expr(expr: &str) -> std::borrow::Cow<'_, str> {
    if expr.split_whitespace().count() == 5 {
        std::borrow::Cow::Owned(format!("0 {expr}"))
    } else {
        std::borrow::Cow::Borrowed(expr)
    }
}

/// Compute the most recent past occurrence of `cron_expr` (≤ `now`),
/// dropping it only once it's more than `grace` behind `now`.
pub fn compute_last_tick(
    cron_expr: &str,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Result<Option<DateTime<Utc>>, WorkerError> {
    let schedule = Schedule::from_str(&normalize_cron_expr(cron_expr))
        .map_err(|e| WorkerError::ValidationError(format!("invalid cron expression: {e}")))?;
    let lower_bound = now - grace - SEARCH_MARGIN;
    let last_tick = schedule.after(&lower_bound).take_while(|t| *t <= now).last();
    Ok(last_tick.filter(|tick| now - *tick <= grace))
}

/// ISO-8601 with millisecond precision and a literal `Z` suffix, the exact
/// rendering spec §8's deterministic-id scenarios pin the tick to.
fn format_tick(tick: DateTime<Utc>) -> String {
    tick.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A deterministic UUID for the (venture, schedule entry, tick) triple,
/// derived from SHA-256 of `"venture:<id>:entry:<id>:tick:<iso>"` with
/// RFC-4122 version/variant bits forced, so re-running the watcher for the
/// same tick always recomputes the same id instead of minting a new one.
pub fn scheduled_job_definition_id(
    venture_id: Uuid,
    entry_id: Uuid,
    tick: DateTime<Utc>,
) -> Uuid {
    let input = format!(
        "venture:{venture_id}:entry:{entry_id}:tick:{}",
        format_tick(tick)
    );
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x50; // version 5
    bytes[8] = (bytes[8] & 0x3f) | 0x80; // RFC-4122 variant
    Uuid::from_bytes(bytes)
}

/// The cross-entry claim key passed to `claimVentureDispatch`: `"<lastTick
/// ISO>:<entryId>"` (spec §4.9 step 2) — the entry id disambiguates two
/// entries on the same venture that happen to share a tick.
pub fn schedule_tick_key(tick: DateTime<Utc>, entry_id: Uuid) -> String {
    format!("{}:{entry_id}", format_tick(tick))
}

pub struct VentureWatcher<D: TemplateDispatcher> {
    control_api: ControlApiClient,
    index: IndexClient,
    dispatcher: D,
    dispatched: HashMap<Uuid, DateTime<Utc>>,
}

impl<D: TemplateDispatcher> VentureWatcher<D> {
    pub fn new(control_api: ControlApiClient, index: IndexClient, dispatcher: D) -> Self {
        Self {
            control_api,
            index,
            dispatcher,
            dispatched: HashMap::new(),
        }
    }

    fn evict_stale(&mut self, now: DateTime<Utc>) {
        self.dispatched.retain(|_, at| now - *at < DEDUP_TTL);
    }

    /// Evaluate every schedule entry for `venture`, dispatching any entry due
    /// since the last tick that hasn't already been dispatched.
    pub async fn tick(&mut self, venture: &Venture, now: DateTime<Utc>) -> Result<(), WorkerError> {
        self.evict_stale(now);

        for entry in &venture.schedule_entries {
            if !entry.enabled {
                continue;
            }
            if let Err(e) = self.tick_entry(venture.id, entry, now).await {
                warn!(venture_id = %venture.id, entry_id = %entry.id, error = %e, "venture schedule entry tick failed");
            }
        }
        Ok(())
    }

    async fn tick_entry(
        &mut self,
        venture_id: Uuid,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let Some(tick) = compute_last_tick(&entry.cron, now, SCHEDULE_GRACE)? else {
            return Ok(());
        };

        let scheduled_id = scheduled_job_definition_id(venture_id, entry.id, tick);

        if self.dispatched.contains_key(&scheduled_id) {
            debug!(scheduled_id = %scheduled_id, "venture dispatch already recorded in-memory, skipping");
            return Ok(());
        }

        // Second dedup layer: the ledger index may already carry a request
        // for this job definition from a previous process that crashed
        // before recording it in-memory. A query failure here is treated as
        // "assume dispatched" to avoid double-spending on an index outage.
        match self.index.requests_for_job_definition(scheduled_id).await {
            Ok(rows) if !rows.is_empty() => {
                self.dispatched.insert(scheduled_id, now);
                return Ok(());
            }
            Err(e) => {
                warn!(scheduled_id = %scheduled_id, error = %e, "index dedup check failed, assuming already dispatched");
                return Ok(());
            }
            Ok(_) => {}
        }

        let tick_key = schedule_tick_key(tick, entry.id);
        let allowed = self
            .control_api
            .claim_venture_dispatch(venture_id, entry.template_id, &tick_key)
            .await?;
        if !allowed {
            self.dispatched.insert(scheduled_id, now);
            return Ok(());
        }

        // Record the claim before dispatching: a crash between claim and
        // dispatch leaves the claim in place, so a retry sees "already
        // claimed" rather than firing the template twice.
        self.dispatched.insert(scheduled_id, now);
        self.dispatcher
            .dispatch(venture_id, entry.template_id, scheduled_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn last_tick_returns_none_before_first_occurrence() {
        let now = DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // Fires at minute 0 of every hour; "now" is also on the hour so this
        // should return that exact minute.
        let tick = compute_last_tick("0 0 * * * *", now, SCHEDULE_GRACE).unwrap();
        assert_eq!(tick, Some(now));
    }

    #[test]
    fn hourly_cron_at_five_past_still_reports_the_hour_mark() {
        // spec §8 scenario 2: hourly cron, now=12:05, lastTick must be 12:00.
        let now = DateTime::parse_from_rfc3339("2025-01-01T12:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tick = compute_last_tick("0 * * * *", now, SCHEDULE_GRACE).unwrap();
        assert_eq!(tick, Some(expected));
    }

    #[test]
    fn last_tick_is_none_outside_grace_window() {
        // An explicit 5-minute grace (not the production 24h default) to
        // exercise the "now - lastTick > grace" drop directly.
        let now = DateTime::parse_from_rfc3339("2026-07-27T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tick = compute_last_tick("0 0 * * * *", now, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(tick, None);
    }

    #[test]
    fn last_tick_beyond_grace_is_dropped_even_though_it_occurred() {
        // Daily cron; the last midnight occurrence is real but 23.5h behind
        // `now`, past a 23h grace — must report not-due.
        let now = DateTime::parse_from_rfc3339("2025-01-02T23:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tick = compute_last_tick("0 0 * * *", now, chrono::Duration::hours(23)).unwrap();
        assert_eq!(tick, None);
    }

    #[test]
    fn five_field_cron_expression_is_widened_to_six_fields() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T12:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let six_field = compute_last_tick("0 0 * * * *", now, SCHEDULE_GRACE).unwrap();
        let five_field = compute_last_tick("0 * * * *", now, SCHEDULE_GRACE).unwrap();
        assert_eq!(five_field, Some(expected));
        assert_eq!(five_field, six_field);
    }

    #[test]
    fn scheduled_id_is_deterministic_and_version_5() {
        let venture_id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let entry_id = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();
        let tick = DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let a = scheduled_job_definition_id(venture_id, entry_id, tick);
        let b = scheduled_job_definition_id(venture_id, entry_id, tick);
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);

        let different_tick = tick + chrono::Duration::hours(1);
        let c = scheduled_job_definition_id(venture_id, entry_id, different_tick);
        assert_ne!(a, c);
    }

    struct RecordingDispatcher {
        calls: Mutex<Vec<Uuid>>,
        dispatch_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TemplateDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            _venture_id: Uuid,
            _template_id: Uuid,
            scheduled_job_definition_id: Uuid,
        ) -> Result<(), WorkerError> {
            self.dispatch_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(scheduled_job_definition_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_memory_dedup_prevents_double_dispatch_in_same_process() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "claimVentureDispatch": true }
            })))
            .mount(&server)
            .await;

        let index_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "data": { "requests": [] } })),
            )
            .mount(&index_server)
            .await;

        let control_api = ControlApiClient::new(
            server.uri().parse().unwrap(),
            crate::erc8128::Erc8128Signer::new(
                "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                    .parse()
                    .unwrap(),
            ),
        );
        let index = IndexClient::new(format!("{}/graphql", index_server.uri()).parse().unwrap());
        let dispatcher = RecordingDispatcher {
            calls: Mutex::new(vec![]),
            dispatch_count: AtomicUsize::new(0),
        };
        let mut watcher = VentureWatcher::new(control_api, index, dispatcher);

        let venture = Venture {
            id: Uuid::new_v4(),
            schedule_entries: vec![ScheduleEntry {
                id: Uuid::new_v4(),
                template_id: Uuid::new_v4(),
                cron: "0 0 * * * *".to_string(),
                enabled: true,
            }],
        };
        let now = DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        watcher.tick(&venture, now).await.unwrap();
        watcher.tick(&venture, now).await.unwrap();

        assert_eq!(watcher.dispatcher.dispatch_count.load(Ordering::SeqCst), 1);
    }
}

//! OAuth credential rotation for the model provider (§4.10 step 1).
//!
//! A worker holds a small pool of credentials. Each tick it refreshes any
//! expired access token, checks remaining quota via the Credential Bridge,
//! and selects the first credential with quota left. When the whole pool is
//! exhausted it backs off exponentially rather than spinning.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use mech_runtime::WorkerError;

const BACKOFF_BASE_SECS: u64 = 60;
const BACKOFF_MAX_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaStatus {
    pub exhausted: bool,
    pub access_token_expired: bool,
}

#[async_trait::async_trait]
pub trait QuotaIntrospector: Send + Sync {
    async fn introspect(&self, credential: &Credential) -> Result<QuotaStatus, WorkerError>;
    async fn refresh(&self, credential: &Credential) -> Result<Credential, WorkerError>;
}

/// Walk `pool` in order, refreshing expired tokens and skipping exhausted
/// credentials, returning the first usable one. Returns `None` (caller backs
/// off) when every credential in the pool is exhausted.
pub async fn select_active_credential(
    pool: &mut [Credential],
    introspector: &dyn QuotaIntrospector,
    now: DateTime<Utc>,
) -> Result<Option<Credential>, WorkerError> {
    for credential in pool.iter_mut() {
        if credential.is_expired(now) {
            *credential = introspector.refresh(credential).await?;
        }

        let status = introspector.introspect(credential).await?;
        if status.access_token_expired {
            *credential = introspector.refresh(credential).await?;
        }
        if !status.exhausted {
            return Ok(Some(credential.clone()));
        }
    }
    Ok(None)
}

/// Exponential backoff with jitter for the "every credential exhausted" case:
/// `base * 2^attempt`, capped at `BACKOFF_MAX_SECS`, jittered by ±20%.
pub fn exhaustion_backoff(attempt: u32) -> Duration {
    let raw = BACKOFF_BASE_SECS.saturating_mul(1u64 << attempt.min(16));
    let capped = raw.min(BACKOFF_MAX_SECS) as f64;
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (capped * (1.0 + jitter)).max(1.0);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeIntrospector {
        exhausted_ids: Vec<String>,
        refresh_calls: AtomicUsize,
        refreshed_ids: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl QuotaIntrospector for FakeIntrospector {
        async fn introspect(&self, credential: &Credential) -> Result<QuotaStatus, WorkerError> {
            Ok(QuotaStatus {
                exhausted: self.exhausted_ids.contains(&credential.id),
                access_token_expired: false,
            })
        }

        async fn refresh(&self, credential: &Credential) -> Result<Credential, WorkerError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refreshed_ids.lock().unwrap().push(credential.id.clone());
            Ok(Credential {
                id: credential.id.clone(),
                access_token: format!("{}-refreshed", credential.access_token),
                refresh_token: credential.refresh_token.clone(),
                expires_at: credential.expires_at + chrono::Duration::hours(1),
            })
        }
    }

    fn credential(id: &str, expires_in_secs: i64) -> Credential {
        Credential {
            id: id.to_string(),
            access_token: format!("{id}-token"),
            refresh_token: format!("{id}-refresh"),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[tokio::test]
    async fn selects_first_non_exhausted_credential() {
        let mut pool = vec![credential("a", 3600), credential("b", 3600)];
        let introspector = FakeIntrospector {
            exhausted_ids: vec!["a".into()],
            refresh_calls: AtomicUsize::new(0),
            refreshed_ids: Mutex::new(vec![]),
        };
        let selected = select_active_credential(&mut pool, &introspector, Utc::now())
            .await
            .unwrap();
        assert_eq!(selected.unwrap().id, "b");
    }

    #[tokio::test]
    async fn refreshes_expired_tokens_before_checking_quota() {
        let mut pool = vec![credential("a", -10)];
        let introspector = FakeIntrospector {
            exhausted_ids: vec![],
            refresh_calls: AtomicUsize::new(0),
            refreshed_ids: Mutex::new(vec![]),
        };
        let selected = select_active_credential(&mut pool, &introspector, Utc::now())
            .await
            .unwrap();
        assert!(selected.unwrap().access_token.ends_with("-refreshed"));
        assert_eq!(introspector.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_none_when_whole_pool_exhausted() {
        let mut pool = vec![credential("a", 3600), credential("b", 3600)];
        let introspector = FakeIntrospector {
            exhausted_ids: vec!["a".into(), "b".into()],
            refresh_calls: AtomicUsize::new(0),
            refreshed_ids: Mutex::new(vec![]),
        };
        let selected = select_active_credential(&mut pool, &introspector, Utc::now())
            .await
            .unwrap();
        assert!(selected.is_none());
    }

    #[test]
    fn backoff_grows_and_caps_with_jitter() {
        let first = exhaustion_backoff(0);
        assert!(first.as_secs_f64() >= 48.0 && first.as_secs_f64() <= 72.0);

        let saturated = exhaustion_backoff(10);
        assert!(saturated.as_secs_f64() <= BACKOFF_MAX_SECS as f64 * 1.2);
    }
}

//! Staking Filter: resolves the set of mech addresses whose services are
//! staked in this worker's pool, via two GraphQL queries against the
//! ledger index. A worker only delivers on behalf of mechs in this set.
//!
//! Grounded on the on-chain-first, fallback, TTL-cached shape of the
//! teacher's validator/staking endpoint discovery.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use rand::seq::SliceRandom;
use serde::Deserialize;
use url::Url;

use crate::error::WorkerError;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    mechs: Vec<Address>,
    fetched_at: Instant,
}

pub struct StakingFilter {
    graphql_url: Url,
    client: reqwest::Client,
    staking_contract: Address,
    cache: RwLock<Option<CacheEntry>>,
}

#[derive(Debug, Deserialize)]
struct StakedService {
    #[serde(rename = "serviceId")]
    service_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    owner: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    multisig: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StakedServicesResponse {
    data: StakedServicesData,
}

#[derive(Debug, Deserialize)]
struct StakedServicesData {
    #[serde(rename = "stakedServices")]
    staked_services: Vec<StakedService>,
}

#[derive(Debug, Deserialize)]
struct MechMapping {
    mech: String,
    #[serde(rename = "serviceId")]
    #[allow(dead_code)]
    service_id: String,
}

#[derive(Debug, Deserialize)]
struct MechMappingsResponse {
    data: MechMappingsData,
}

#[derive(Debug, Deserialize)]
struct MechMappingsData {
    #[serde(rename = "mechServiceMappings")]
    mech_service_mappings: Vec<MechMapping>,
}

impl StakingFilter {
    pub fn new(graphql_url: Url, staking_contract: Address) -> Self {
        Self {
            graphql_url,
            client: reqwest::Client::new(),
            staking_contract,
            cache: RwLock::new(None),
        }
    }

    async fn query_staked_service_ids(&self) -> Result<Vec<String>, WorkerError> {
        let query = r#"query($stakingContract: String!) {
            stakedServices(where: { stakingContract: $stakingContract, isStaked: true }, limit: 1000) {
                serviceId
                owner
                multisig
            }
        }"#;

        let body = serde_json::json!({
            "query": query,
            "variables": { "stakingContract": format!("{:#x}", self.staking_contract) },
        });

        let response: StakedServicesResponse = self
            .client
            .post(self.graphql_url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .data
            .staked_services
            .into_iter()
            .map(|s| s.service_id)
            .collect())
    }

    async fn query_mechs_for_services(&self, service_ids: &[String]) -> Result<Vec<Address>, WorkerError> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = r#"query($serviceIds: [String!]!) {
            mechServiceMappings(where: { serviceId_in: $serviceIds }) {
                mech
                serviceId
            }
        }"#;

        let body = serde_json::json!({
            "query": query,
            "variables": { "serviceIds": service_ids },
        });

        let response: MechMappingsResponse = self
            .client
            .post(self.graphql_url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut mechs: Vec<Address> = response
            .data
            .mech_service_mappings
            .into_iter()
            .filter_map(|m| m.mech.parse::<Address>().ok())
            .collect();
        mechs.sort();
        mechs.dedup();
        Ok(mechs)
    }

    /// Resolve the current staked-mech set, refreshing from the index if the
    /// cache is absent or stale. On query failure, a stale cache entry (if
    /// any) is returned rather than propagating the error.
    pub async fn resolve_staked_mechs(&self) -> Vec<Address> {
        if let Some(cached) = self.fresh_cache() {
            return cached;
        }

        match self.refresh().await {
            Ok(mechs) => mechs,
            Err(_) => self
                .cache
                .read()
                .unwrap()
                .as_ref()
                .map(|c| c.mechs.clone())
                .unwrap_or_default(),
        }
    }

    fn fresh_cache(&self) -> Option<Vec<Address>> {
        let cache = self.cache.read().unwrap();
        cache.as_ref().and_then(|entry| {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                Some(entry.mechs.clone())
            } else {
                None
            }
        })
    }

    async fn refresh(&self) -> Result<Vec<Address>, WorkerError> {
        let service_ids = self.query_staked_service_ids().await?;
        let mechs = self.query_mechs_for_services(&service_ids).await?;

        let mut cache = self.cache.write().unwrap();
        *cache = Some(CacheEntry {
            mechs: mechs.clone(),
            fetched_at: Instant::now(),
        });

        Ok(mechs)
    }

    /// Pick a random staked mech, or `fallback` if the resolved set is empty.
    pub async fn get_random_staked_mech(&self, fallback: Address) -> Address {
        let mechs = self.resolve_staked_mechs().await;
        let mut rng = rand::thread_rng();
        mechs.choose(&mut rng).copied().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from(bytes)
    }

    #[tokio::test]
    async fn falls_back_when_resolved_set_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "stakedServices": [] }
            })))
            .mount(&server)
            .await;

        let filter = StakingFilter::new(server.uri().parse().unwrap(), addr(1));
        let fallback = addr(99);
        let chosen = filter.get_random_staked_mech(fallback).await;
        assert_eq!(chosen, fallback);
    }

    #[tokio::test]
    async fn stale_cache_is_returned_on_query_failure() {
        let server = MockServer::start().await;
        server.reset().await;

        let filter = StakingFilter::new(server.uri().parse().unwrap(), addr(1));
        {
            let mut cache = filter.cache.write().unwrap();
            *cache = Some(CacheEntry {
                mechs: vec![addr(7)],
                fetched_at: Instant::now() - Duration::from_secs(10 * 60),
            });
        }

        // No mock registered: any request 404s, refresh() fails, stale cache wins.
        let resolved = filter.resolve_staked_mechs().await;
        assert_eq!(resolved, vec![addr(7)]);
    }
}

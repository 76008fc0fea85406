use super::{BalanceAlgorithm, LoadBalancerConfig, ServiceInstance, ServiceDiscovery};
use anyhow::{bail, Result};
use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

struct AffinityEntry {
    instance_id: String,
    bound_at: Instant,
}

#[derive(Default)]
struct BalancerState {
    connection_counts: HashMap<String, u64>,
    session_affinity: HashMap<String, AffinityEntry>,
}

/// Snapshot of the cluster served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub instances: Vec<ServiceInstance>,
    pub load_balancing_config: LoadBalancerConfig,
    pub connection_counts: HashMap<String, u64>,
}

/// Picks one healthy peer per request, optionally pinned by session key.
pub struct LoadBalancer {
    discovery: Arc<ServiceDiscovery>,
    client: reqwest::Client,
    config: RwLock<LoadBalancerConfig>,
    round_robin_index: AtomicUsize,
    inner: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(discovery: Arc<ServiceDiscovery>, config: LoadBalancerConfig) -> Self {
        Self {
            discovery,
            client: reqwest::Client::new(),
            config: RwLock::new(config),
            round_robin_index: AtomicUsize::new(0),
            inner: Mutex::new(BalancerState::default()),
        }
    }

    pub async fn get_config(&self) -> LoadBalancerConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: LoadBalancerConfig) {
        info!("Load balancing configuration updated: {:?}", config);
        *self.config.write().await = config;
    }

    /// Pick the target instance for one request.
    pub async fn get_target_instance(&self, session_id: Option<&str>) -> Option<ServiceInstance> {
        let healthy = self.discovery.healthy_instances().await;
        if healthy.is_empty() {
            warn!("No healthy instances available");
            return None;
        }

        let config = self.config.read().await.clone();
        let mut state = self.inner.lock().await;

        // session affinity wins while the bound instance stays healthy
        if let Some(session_id) = session_id.filter(|_| config.sticky_sessions) {
            if let Some(entry) = state.session_affinity.get(session_id) {
                match healthy.iter().find(|i| i.id == entry.instance_id) {
                    Some(instance) => return Some(instance.clone()),
                    None => {
                        state.session_affinity.remove(session_id);
                    }
                }
            }
        }

        let instance = match config.algorithm {
            BalanceAlgorithm::RoundRobin => self.round_robin(&healthy),
            BalanceAlgorithm::WeightedRoundRobin => self.weighted_round_robin(&healthy),
            BalanceAlgorithm::LeastConnections => self.least_connections(&healthy, &state),
        };

        if let Some(session_id) = session_id.filter(|_| config.sticky_sessions) {
            state.session_affinity.insert(
                session_id.to_string(),
                AffinityEntry {
                    instance_id: instance.id.clone(),
                    bound_at: Instant::now(),
                },
            );
        }
        Some(instance)
    }

    fn round_robin(&self, healthy: &[ServiceInstance]) -> ServiceInstance {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        healthy[index % healthy.len()].clone()
    }

    /// Weight each instance by 1 − load_score; a fully loaded set falls back
    /// to plain round robin.
    fn weighted_round_robin(&self, healthy: &[ServiceInstance]) -> ServiceInstance {
        let weights: Vec<f64> = healthy.iter().map(|i| 1.0 - i.load_score).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return self.round_robin(healthy);
        }

        let mut draw = rand::rng().random_range(0.0..total);
        for (instance, weight) in healthy.iter().zip(&weights) {
            if draw < *weight {
                return instance.clone();
            }
            draw -= weight;
        }
        healthy[healthy.len() - 1].clone()
    }

    fn least_connections(
        &self,
        healthy: &[ServiceInstance],
        state: &BalancerState,
    ) -> ServiceInstance {
        // healthy is sorted by id, so the first minimum wins ties
        healthy
            .iter()
            .min_by_key(|i| state.connection_counts.get(&i.id).copied().unwrap_or(0))
            .cloned()
            .expect("non-empty healthy set")
    }

    /// Proxy one HTTP request to a selected instance. The connection count
    /// is held for the duration of the call, error included.
    pub async fn proxy_request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
        session_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let Some(instance) = self.get_target_instance(session_id).await else {
            bail!("No healthy instances available");
        };
        let timeout = {
            let config = self.config.read().await;
            Duration::from_secs(config.timeout_s)
        };

        {
            let mut state = self.inner.lock().await;
            *state.connection_counts.entry(instance.id.clone()).or_insert(0) += 1;
        }

        let url = format!("{}{}", instance.base_url(), path);
        let mut request = self
            .client
            .request(method.parse()?, &url)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let result = request.send().await;

        {
            let mut state = self.inner.lock().await;
            if let Some(count) = state.connection_counts.get_mut(&instance.id) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(result?)
    }

    pub async fn cluster_snapshot(&self) -> ClusterSnapshot {
        let instances = self.discovery.discover_instances().await;
        let healthy = instances
            .iter()
            .filter(|i| i.status == super::InstanceStatus::Healthy)
            .count();
        let state = self.inner.lock().await;
        ClusterSnapshot {
            total_instances: instances.len(),
            healthy_instances: healthy,
            unhealthy_instances: instances.len() - healthy,
            instances,
            load_balancing_config: self.config.read().await.clone(),
            connection_counts: state.connection_counts.clone(),
        }
    }

    /// Drop affinity entries older than the configured timeout. Returns how
    /// many were removed.
    pub async fn purge_expired_affinity(&self) -> usize {
        let ttl = {
            let config = self.config.read().await;
            Duration::from_secs(config.session_affinity_timeout_s)
        };
        let mut state = self.inner.lock().await;
        let before = state.session_affinity.len();
        state
            .session_affinity
            .retain(|_, entry| entry.bound_at.elapsed() < ttl);
        let removed = before - state.session_affinity.len();
        if removed > 0 {
            info!("Cleaned up {} expired session affinity entries", removed);
        }
        removed
    }

    #[cfg(test)]
    async fn bound_instance(&self, session_id: &str) -> Option<String> {
        let state = self.inner.lock().await;
        state
            .session_affinity
            .get(session_id)
            .map(|e| e.instance_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InstanceStatus, StaticBackend};
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance(id: &str, load_score: f64) -> ServiceInstance {
        let (host, port) = id.rsplit_once(':').unwrap();
        ServiceInstance {
            id: id.to_string(),
            host: host.to_string(),
            port: port.parse().unwrap(),
            status: InstanceStatus::Healthy,
            last_heartbeat: Utc::now(),
            load_score,
            capabilities: vec!["api".to_string()],
            metadata: HashMap::new(),
        }
    }

    async fn balancer_with(
        instances: Vec<ServiceInstance>,
        config: LoadBalancerConfig,
    ) -> LoadBalancer {
        let discovery = Arc::new(ServiceDiscovery::new(
            Arc::new(StaticBackend::parse("").unwrap()),
            Duration::from_secs(1000),
        ));
        discovery.set_instances(instances).await;
        LoadBalancer::new(discovery, config)
    }

    fn rr_config() -> LoadBalancerConfig {
        LoadBalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_fairly() {
        let lb = balancer_with(
            vec![
                instance("i1:8000", 0.0),
                instance("i2:8000", 0.0),
                instance("i3:8000", 0.0),
            ],
            rr_config(),
        )
        .await;

        let mut picks = vec![];
        for _ in 0..9 {
            picks.push(lb.get_target_instance(None).await.unwrap().id);
        }
        assert_eq!(
            picks,
            vec![
                "i1:8000", "i2:8000", "i3:8000", "i1:8000", "i2:8000", "i3:8000", "i1:8000",
                "i2:8000", "i3:8000"
            ]
        );
    }

    #[tokio::test]
    async fn sticky_session_pins_instance() {
        let config = LoadBalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            sticky_sessions: true,
            ..Default::default()
        };
        let lb = balancer_with(
            vec![instance("i1:8000", 0.0), instance("i2:8000", 0.0)],
            config,
        )
        .await;

        let first = lb.get_target_instance(Some("session")).await.unwrap();
        for _ in 0..5 {
            let next = lb.get_target_instance(Some("session")).await.unwrap();
            assert_eq!(next.id, first.id);
        }
    }

    #[tokio::test]
    async fn sticky_session_rebinds_when_instance_leaves() {
        let config = LoadBalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            sticky_sessions: true,
            ..Default::default()
        };
        let discovery = Arc::new(ServiceDiscovery::new(
            Arc::new(StaticBackend::parse("").unwrap()),
            Duration::from_secs(1000),
        ));
        discovery
            .set_instances(vec![instance("i1:8000", 0.0), instance("i2:8000", 0.0)])
            .await;
        let lb = LoadBalancer::new(discovery.clone(), config);

        // i1 sorts first so round robin binds the session to it
        let first = lb.get_target_instance(Some("s")).await.unwrap();
        assert_eq!(first.id, "i1:8000");
        assert_eq!(lb.get_target_instance(Some("s")).await.unwrap().id, "i1:8000");

        // i1 disappears, the session moves and the binding follows
        discovery.set_instances(vec![instance("i2:8000", 0.0)]).await;
        let moved = lb.get_target_instance(Some("s")).await.unwrap();
        assert_eq!(moved.id, "i2:8000");
        assert_eq!(lb.bound_instance("s").await.unwrap(), "i2:8000");
    }

    #[tokio::test]
    async fn weighted_falls_back_when_fully_loaded() {
        let config = LoadBalancerConfig {
            algorithm: BalanceAlgorithm::WeightedRoundRobin,
            ..Default::default()
        };
        let lb = balancer_with(
            vec![instance("i1:8000", 1.0), instance("i2:8000", 1.0)],
            config,
        )
        .await;

        // Σ weights = 0 falls back to round robin
        assert_eq!(lb.get_target_instance(None).await.unwrap().id, "i1:8000");
        assert_eq!(lb.get_target_instance(None).await.unwrap().id, "i2:8000");
    }

    #[tokio::test]
    async fn weighted_prefers_idle_instances() {
        let config = LoadBalancerConfig {
            algorithm: BalanceAlgorithm::WeightedRoundRobin,
            ..Default::default()
        };
        let lb = balancer_with(
            vec![instance("busy:8000", 1.0), instance("idle:8000", 0.0)],
            config,
        )
        .await;

        // the fully loaded instance has zero weight and is never drawn
        for _ in 0..20 {
            assert_eq!(lb.get_target_instance(None).await.unwrap().id, "idle:8000");
        }
    }

    #[tokio::test]
    async fn no_healthy_instances_yields_none() {
        let lb = balancer_with(vec![], rr_config()).await;
        assert!(lb.get_target_instance(None).await.is_none());
        assert!(lb.proxy_request("GET", "/x", None, None).await.is_err());
    }

    #[tokio::test]
    async fn proxy_reaches_selected_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let addr = server.address();
        let lb = balancer_with(
            vec![instance(&format!("{}:{}", addr.ip(), addr.port()), 0.0)],
            rr_config(),
        )
        .await;

        let response = lb
            .proxy_request("GET", "/api/v1/ping", None, None)
            .await
            .unwrap();
        assert!(response.status().is_success());

        // counts return to zero once the request completes
        let snapshot = lb.cluster_snapshot().await;
        assert_eq!(snapshot.connection_counts.values().sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn affinity_purge_honours_timeout() {
        let config = LoadBalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            sticky_sessions: true,
            session_affinity_timeout_s: 0,
            ..Default::default()
        };
        let lb = balancer_with(vec![instance("i1:8000", 0.0)], config).await;
        lb.get_target_instance(Some("old")).await.unwrap();
        assert_eq!(lb.purge_expired_affinity().await, 1);
        assert!(lb.bound_instance("old").await.is_none());
    }
}

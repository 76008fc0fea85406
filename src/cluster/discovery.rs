use super::{InstanceStatus, ServiceInstance};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READY_PATH: &str = "/api/v1/health/ready";

/// A peer endpoint before it has been probed.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Source of peer endpoints and, when available, the deployment's desired
/// replica count.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Desired replica count, None when the backend does not track one.
    async fn replicas(&self) -> Result<Option<u32>>;

    /// Patch the desired replica count. False when the backend cannot scale.
    async fn set_replicas(&self, replicas: u32) -> Result<bool>;
}

/// Endpoints from an orchestrator's deployment API.
pub struct OrchestratorBackend {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    service: String,
    deployment: String,
}

impl OrchestratorBackend {
    pub fn new(api_url: &str, namespace: &str, service: &str, deployment: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
            deployment: deployment.to_string(),
        }
    }

    fn scale_url(&self) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            self.api_url, self.namespace, self.deployment
        )
    }
}

#[derive(Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Deserialize)]
struct EndpointAddress {
    ip: String,
}

#[derive(Deserialize)]
struct EndpointPort {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

#[async_trait]
impl ClusterBackend for OrchestratorBackend {
    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let url = format!(
            "{}/api/v1/namespaces/{}/endpoints/{}",
            self.api_url, self.namespace, self.service
        );
        let obj: EndpointsObject = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut endpoints = vec![];
        for subset in obj.subsets {
            for address in &subset.addresses {
                for port in &subset.ports {
                    if port.name.as_deref() == Some("http") {
                        endpoints.push(Endpoint {
                            host: address.ip.clone(),
                            port: port.port,
                            metadata: HashMap::from([(
                                "namespace".to_string(),
                                self.namespace.clone().into(),
                            )]),
                        });
                    }
                }
            }
        }
        Ok(endpoints)
    }

    async fn replicas(&self) -> Result<Option<u32>> {
        let scale: serde_json::Value = self
            .client
            .get(self.scale_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(scale
            .pointer("/spec/replicas")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32))
    }

    async fn set_replicas(&self, replicas: u32) -> Result<bool> {
        let body = serde_json::json!({ "spec": { "replicas": replicas } });
        let response = self
            .client
            .patch(self.scale_url())
            .header("content-type", "application/merge-patch+json")
            .json(&body)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("Failed to scale deployment: {}", response.status());
            return Ok(false);
        }
        info!("Scaled deployment to {} replicas", replicas);
        Ok(true)
    }
}

/// Fixed host list for development and single-host deployments. Cannot
/// scale.
pub struct StaticBackend {
    endpoints: Vec<Endpoint>,
}

impl StaticBackend {
    /// Parse a comma-separated "host:port,host:port" list.
    pub fn parse(hosts: &str) -> Result<Self> {
        let mut endpoints = vec![];
        for entry in hosts.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (host, port) = entry
                .rsplit_once(':')
                .with_context(|| format!("Invalid host entry '{}'", entry))?;
            endpoints.push(Endpoint {
                host: host.to_string(),
                port: port
                    .parse()
                    .with_context(|| format!("Invalid port in '{}'", entry))?,
                metadata: HashMap::from([("static".to_string(), true.into())]),
            });
        }
        Ok(Self { endpoints })
    }
}

#[async_trait]
impl ClusterBackend for StaticBackend {
    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }

    async fn replicas(&self) -> Result<Option<u32>> {
        Ok(None)
    }

    async fn set_replicas(&self, _replicas: u32) -> Result<bool> {
        warn!("Static cluster backend cannot scale the deployment");
        Ok(false)
    }
}

#[derive(Default)]
struct DiscoveryState {
    instances: HashMap<String, ServiceInstance>,
    last_refresh: Option<Instant>,
}

/// Cached peer discovery with readiness probing.
pub struct ServiceDiscovery {
    backend: Arc<dyn ClusterBackend>,
    client: reqwest::Client,
    refresh_interval: Duration,
    inner: Mutex<DiscoveryState>,
}

impl ServiceDiscovery {
    pub fn new(backend: Arc<dyn ClusterBackend>, refresh_interval: Duration) -> Self {
        Self {
            backend,
            client: reqwest::Client::new(),
            refresh_interval,
            inner: Mutex::new(DiscoveryState::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    /// All known instances, refreshing when the cache has gone stale.
    pub async fn discover_instances(&self) -> Vec<ServiceInstance> {
        let mut state = self.inner.lock().await;
        let fresh = state
            .last_refresh
            .map(|t| t.elapsed() < self.refresh_interval)
            .unwrap_or(false);
        if !fresh {
            self.refresh_locked(&mut state).await;
        }
        sorted_instances(&state.instances)
    }

    /// Refresh regardless of cache age.
    pub async fn refresh(&self) -> Vec<ServiceInstance> {
        let mut state = self.inner.lock().await;
        self.refresh_locked(&mut state).await;
        sorted_instances(&state.instances)
    }

    pub async fn healthy_instances(&self) -> Vec<ServiceInstance> {
        self.discover_instances()
            .await
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .collect()
    }

    async fn refresh_locked(&self, state: &mut DiscoveryState) {
        let endpoints = match self.backend.endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                return;
            }
        };

        let probes = join_all(
            endpoints
                .iter()
                .map(|e| self.probe_instance(&e.host, e.port)),
        )
        .await;

        let mut instances = HashMap::new();
        for (endpoint, (status, load_score)) in endpoints.into_iter().zip(probes) {
            let id = format!("{}:{}", endpoint.host, endpoint.port);
            instances.insert(
                id.clone(),
                ServiceInstance {
                    id,
                    host: endpoint.host,
                    port: endpoint.port,
                    status,
                    last_heartbeat: Utc::now(),
                    load_score,
                    capabilities: vec!["vm_management".to_string(), "api".to_string()],
                    metadata: endpoint.metadata,
                },
            );
        }
        info!("Discovered {} service instances", instances.len());
        state.instances = instances;
        state.last_refresh = Some(Instant::now());
    }

    /// Readiness probe; the load score is derived from the reported
    /// cpu/memory percentages.
    async fn probe_instance(&self, host: &str, port: u16) -> (InstanceStatus, f64) {
        let url = format!("http://{}:{}{}", host, port, READY_PATH);
        let response = match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Health check failed for {}:{}: {}", host, port, e);
                return (InstanceStatus::Unhealthy, 0.0);
            }
        };
        if !response.status().is_success() {
            return (InstanceStatus::Unhealthy, 0.0);
        }
        let load_score = match response.json::<serde_json::Value>().await {
            Ok(body) => {
                let cpu = body
                    .pointer("/metrics/cpu_usage_percent")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let mem = body
                    .pointer("/metrics/memory_usage_percent")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                cpu.max(mem) / 100.0
            }
            Err(_) => 0.0,
        };
        (InstanceStatus::Healthy, load_score)
    }

    /// Seed the cache directly, bypassing probing.
    #[cfg(test)]
    pub(crate) async fn set_instances(&self, instances: Vec<ServiceInstance>) {
        let mut state = self.inner.lock().await;
        state.instances = instances.into_iter().map(|i| (i.id.clone(), i)).collect();
        state.last_refresh = Some(Instant::now());
    }
}

fn sorted_instances(instances: &HashMap<String, ServiceInstance>) -> Vec<ServiceInstance> {
    let mut list: Vec<ServiceInstance> = instances.values().cloned().collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ready_server(cpu: f64, mem: f64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(READY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ready",
                "metrics": { "cpu_usage_percent": cpu, "memory_usage_percent": mem }
            })))
            .mount(&server)
            .await;
        server
    }

    fn static_discovery(hosts: &str) -> ServiceDiscovery {
        ServiceDiscovery::new(
            Arc::new(StaticBackend::parse(hosts).unwrap()),
            Duration::from_secs(1000),
        )
    }

    #[tokio::test]
    async fn probes_mark_responders_healthy() {
        let server = ready_server(40.0, 80.0).await;
        let addr = server.address();
        let discovery = static_discovery(&format!("{}:{}", addr.ip(), addr.port()));

        let instances = discovery.discover_instances().await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Healthy);
        // load score is max(cpu, mem) / 100
        assert!((instances[0].load_score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_2xx_marks_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(READY_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let addr = server.address();
        let discovery = static_discovery(&format!("{}:{}", addr.ip(), addr.port()));

        let instances = discovery.discover_instances().await;
        assert_eq!(instances[0].status, InstanceStatus::Unhealthy);
        assert!(discovery.healthy_instances().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_unhealthy() {
        // nothing listens on this port
        let discovery = static_discovery("127.0.0.1:1");
        let instances = discovery.discover_instances().await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn cache_serves_until_refresh_forced() {
        let server = ready_server(10.0, 10.0).await;
        let addr = server.address();
        let discovery = static_discovery(&format!("{}:{}", addr.ip(), addr.port()));

        let first = discovery.discover_instances().await;
        assert_eq!(first[0].status, InstanceStatus::Healthy);

        // the instance stops responding, but the cache still says healthy
        server.reset().await;
        let cached = discovery.discover_instances().await;
        assert_eq!(cached[0].status, InstanceStatus::Healthy);

        // a forced refresh re-probes
        let refreshed = discovery.refresh().await;
        assert_eq!(refreshed[0].status, InstanceStatus::Unhealthy);
    }

    #[test]
    fn static_backend_parsing() {
        let backend = StaticBackend::parse("host-a:8000, host-b:9000").unwrap();
        assert_eq!(backend.endpoints.len(), 2);
        assert_eq!(backend.endpoints[0].host, "host-a");
        assert_eq!(backend.endpoints[1].port, 9000);
        assert!(StaticBackend::parse("no-port").is_err());
    }

    #[tokio::test]
    async fn static_backend_cannot_scale() {
        let backend = StaticBackend::parse("localhost:8000").unwrap();
        assert!(!backend.set_replicas(5).await.unwrap());
        assert_eq!(backend.replicas().await.unwrap(), None);
    }

    #[tokio::test]
    async fn orchestrator_backend_parses_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/sandbox/endpoints/api-headless"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subsets": [{
                    "addresses": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}],
                    "ports": [{"name": "http", "port": 8000}, {"name": "metrics", "port": 9090}]
                }]
            })))
            .mount(&server)
            .await;

        let backend =
            OrchestratorBackend::new(&server.uri(), "sandbox", "api-headless", "api");
        let endpoints = backend.endpoints().await.unwrap();
        // only the http port counts
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|e| e.port == 8000));
    }

    #[tokio::test]
    async fn orchestrator_backend_scales_deployment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/sandbox/deployments/api/scale"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "spec": { "replicas": 3 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/sandbox/deployments/api/scale"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let backend = OrchestratorBackend::new(&server.uri(), "sandbox", "api-headless", "api");
        assert_eq!(backend.replicas().await.unwrap(), Some(3));
        assert!(backend.set_replicas(4).await.unwrap());
    }
}

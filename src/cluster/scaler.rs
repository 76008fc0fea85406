use super::ServiceDiscovery;
use crate::settings::ScalerSettings;
use anyhow::Result;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const METRICS_PATH: &str = "/api/v1/health/metrics";
const METRICS_TIMEOUT: Duration = Duration::from_secs(5);

/// Scale up when usage exceeds this share of the target.
pub const SCALE_UP_THRESHOLD: f64 = 0.8;
/// Scale down when usage falls below this share of the target.
pub const SCALE_DOWN_THRESHOLD: f64 = 0.5;

/// Cluster-wide averages sampled from the healthy instances.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub request_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    None,
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingThresholds {
    pub cpu_target: f64,
    pub memory_target: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

/// One auto-scaling decision. `applied` records whether the backend
/// accepted the replica patch; rejection is not an error.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingOutcome {
    pub action: ScalingAction,
    pub applied: bool,
    pub current_replicas: u32,
    pub new_replicas: u32,
    pub metrics: ClusterMetrics,
    pub thresholds: ScalingThresholds,
}

/// Replica-count autoscaler driven by averaged cluster metrics.
pub struct HorizontalScaler {
    discovery: Arc<ServiceDiscovery>,
    client: reqwest::Client,
    config: ScalerSettings,
}

impl HorizontalScaler {
    pub fn new(discovery: Arc<ServiceDiscovery>, config: ScalerSettings) -> Self {
        Self {
            discovery,
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ScalerSettings {
        &self.config
    }

    /// Average cpu/memory percent and summed request rate across the
    /// healthy instances. Instances that fail to answer contribute nothing.
    pub async fn current_metrics(&self) -> ClusterMetrics {
        let instances = self.discovery.healthy_instances().await;
        if instances.is_empty() {
            return ClusterMetrics::default();
        }

        let samples = join_all(instances.iter().map(|i| {
            let url = format!("{}{}", i.base_url(), METRICS_PATH);
            let client = self.client.clone();
            let id = i.id.clone();
            async move {
                let result: Result<serde_json::Value> = async {
                    Ok(client
                        .get(&url)
                        .timeout(METRICS_TIMEOUT)
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await?)
                }
                .await;
                match result {
                    Ok(body) => Some(body),
                    Err(e) => {
                        debug!("Failed to get metrics from {}: {}", id, e);
                        None
                    }
                }
            }
        }))
        .await;

        let mut total_cpu = 0.0;
        let mut total_memory = 0.0;
        let mut total_requests = 0.0;
        for body in samples.into_iter().flatten() {
            total_cpu += body
                .get("cpu_usage_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            total_memory += body
                .get("memory_usage_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            total_requests += body
                .get("requests_per_second")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
        }

        let count = instances.len() as f64;
        ClusterMetrics {
            cpu_usage: total_cpu / count,
            memory_usage: total_memory / count,
            request_rate: total_requests,
        }
    }

    /// Desired replica count from the backend, falling back to the healthy
    /// instance count when the backend does not track one.
    pub async fn current_replicas(&self) -> u32 {
        match self.discovery.backend().replicas().await {
            Ok(Some(replicas)) => replicas,
            Ok(None) => self.discovery.healthy_instances().await.len() as u32,
            Err(e) => {
                warn!("Failed to get deployment replica count: {}", e);
                0
            }
        }
    }

    pub fn should_scale_up(&self, metrics: &ClusterMetrics, current_replicas: u32) -> bool {
        let cpu_exceeded = metrics.cpu_usage > self.config.target_cpu_percent * SCALE_UP_THRESHOLD;
        let memory_exceeded =
            metrics.memory_usage > self.config.target_memory_percent * SCALE_UP_THRESHOLD;
        (cpu_exceeded || memory_exceeded) && current_replicas < self.config.max_replicas
    }

    pub fn should_scale_down(&self, metrics: &ClusterMetrics, current_replicas: u32) -> bool {
        let cpu_low = metrics.cpu_usage < self.config.target_cpu_percent * SCALE_DOWN_THRESHOLD;
        let memory_low =
            metrics.memory_usage < self.config.target_memory_percent * SCALE_DOWN_THRESHOLD;
        cpu_low && memory_low && current_replicas > self.config.min_replicas
    }

    /// Patch the deployment to the target count. False when the backend
    /// cannot scale.
    pub async fn scale_to(&self, target_replicas: u32) -> bool {
        match self.discovery.backend().set_replicas(target_replicas).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Failed to scale deployment: {}", e);
                false
            }
        }
    }

    /// Sample the cluster and apply one hysteresis step.
    pub async fn auto_scale(&self) -> ScalingOutcome {
        let metrics = self.current_metrics().await;
        let current_replicas = self.current_replicas().await;

        let (action, new_replicas) = if self.should_scale_up(&metrics, current_replicas) {
            (
                ScalingAction::ScaleUp,
                (current_replicas + 1).min(self.config.max_replicas),
            )
        } else if self.should_scale_down(&metrics, current_replicas) {
            (
                ScalingAction::ScaleDown,
                (current_replicas - 1).max(self.config.min_replicas),
            )
        } else {
            (ScalingAction::None, current_replicas)
        };

        let applied = match action {
            ScalingAction::None => false,
            _ => self.scale_to(new_replicas).await,
        };
        if action != ScalingAction::None {
            info!(
                "Auto-scaling action {:?}: replicas {} -> {} (applied: {})",
                action, current_replicas, new_replicas, applied
            );
        }

        ScalingOutcome {
            action,
            applied,
            current_replicas,
            new_replicas,
            metrics,
            thresholds: ScalingThresholds {
                cpu_target: self.config.target_cpu_percent,
                memory_target: self.config.target_memory_percent,
                scale_up_threshold: SCALE_UP_THRESHOLD,
                scale_down_threshold: SCALE_DOWN_THRESHOLD,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::discovery::ClusterBackend;
    use crate::mocks::MockClusterBackend;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_health(server: &MockServer, cpu: f64, memory: f64) {
        Mock::given(method("GET"))
            .and(path("/api/v1/health/ready"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ready",
                "metrics": { "cpu_usage_percent": cpu, "memory_usage_percent": memory }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(METRICS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cpu_usage_percent": cpu,
                "memory_usage_percent": memory,
                "requests_per_second": 5.0,
            })))
            .mount(server)
            .await;
    }

    fn scaler(backend: Arc<MockClusterBackend>) -> HorizontalScaler {
        let discovery = Arc::new(ServiceDiscovery::new(backend, Duration::from_millis(0)));
        HorizontalScaler::new(
            discovery,
            ScalerSettings {
                min_replicas: 2,
                max_replicas: 10,
                target_cpu_percent: 70.0,
                target_memory_percent: 80.0,
            },
        )
    }

    #[tokio::test]
    async fn scale_up_then_settle_then_down() {
        let server = MockServer::start().await;
        let addr = server.address();
        let backend = Arc::new(MockClusterBackend::new(
            vec![(addr.ip().to_string(), addr.port())],
            Some(3),
        ));
        let scaler = scaler(backend.clone());

        // avg cpu 60 > 70 * 0.8 = 56 -> scale up to 4
        mount_health(&server, 60.0, 10.0).await;
        let outcome = scaler.auto_scale().await;
        assert_eq!(outcome.action, ScalingAction::ScaleUp);
        assert_eq!(outcome.current_replicas, 3);
        assert_eq!(outcome.new_replicas, 4);
        assert!(outcome.applied);
        assert_eq!(backend.current_replicas().await, Some(4));

        // cpu 40 is neither above 56 nor below 35 -> no action
        server.reset().await;
        mount_health(&server, 40.0, 10.0).await;
        let outcome = scaler.auto_scale().await;
        assert_eq!(outcome.action, ScalingAction::None);
        assert_eq!(outcome.new_replicas, 4);

        // cpu 30 < 35 and mem 30 < 40 -> scale down to 3
        server.reset().await;
        mount_health(&server, 30.0, 30.0).await;
        let outcome = scaler.auto_scale().await;
        assert_eq!(outcome.action, ScalingAction::ScaleDown);
        assert_eq!(outcome.new_replicas, 3);
        assert_eq!(backend.current_replicas().await, Some(3));
    }

    #[tokio::test]
    async fn replica_limits_block_scaling() {
        let server = MockServer::start().await;
        let addr = server.address();
        let backend = Arc::new(MockClusterBackend::new(
            vec![(addr.ip().to_string(), addr.port())],
            Some(10),
        ));
        let scaler = scaler(backend.clone());

        // hot cluster already at max replicas
        mount_health(&server, 90.0, 90.0).await;
        let outcome = scaler.auto_scale().await;
        assert_eq!(outcome.action, ScalingAction::None);

        // cold cluster already at min replicas
        backend.set_replicas(2).await.unwrap();
        server.reset().await;
        mount_health(&server, 5.0, 5.0).await;
        let outcome = scaler.auto_scale().await;
        assert_eq!(outcome.action, ScalingAction::None);
        assert_eq!(outcome.new_replicas, 2);
    }

    #[tokio::test]
    async fn metrics_average_over_healthy_instances() {
        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        mount_health(&server_a, 40.0, 20.0).await;
        mount_health(&server_b, 60.0, 40.0).await;

        let backend = Arc::new(MockClusterBackend::new(
            vec![
                (server_a.address().ip().to_string(), server_a.address().port()),
                (server_b.address().ip().to_string(), server_b.address().port()),
            ],
            Some(2),
        ));
        let scaler = scaler(backend);

        let metrics = scaler.current_metrics().await;
        assert!((metrics.cpu_usage - 50.0).abs() < 1e-9);
        assert!((metrics.memory_usage - 30.0).abs() < 1e-9);
        assert!((metrics.request_rate - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_cluster_reports_zero_metrics() {
        let backend = Arc::new(MockClusterBackend::new(vec![], None));
        let scaler = scaler(backend);
        let metrics = scaler.current_metrics().await;
        assert_eq!(metrics.cpu_usage, 0.0);
        assert_eq!(metrics.request_rate, 0.0);
    }
}

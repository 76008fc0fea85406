use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod balancer;
pub mod discovery;
pub mod scaler;

pub use balancer::*;
pub use discovery::*;
pub use scaler::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

/// One peer replica of this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// "host:port"
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// 0.0 to 1.0, higher means more loaded
    pub load_score: f64,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceInstance {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

/// Runtime-tunable load balancing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub algorithm: BalanceAlgorithm,
    pub health_check_interval_s: u64,
    pub max_retries: u32,
    pub timeout_s: u64,
    pub sticky_sessions: bool,
    pub session_affinity_timeout_s: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalanceAlgorithm::WeightedRoundRobin,
            health_check_interval_s: 30,
            max_retries: 3,
            timeout_s: 10,
            sticky_sessions: false,
            session_affinity_timeout_s: 3600,
        }
    }
}

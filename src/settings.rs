use crate::cluster::{BalanceAlgorithm, LoadBalancerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Listen address for http server
    pub listen: Option<String>,

    /// Directory for runtime state (VNC sessions, password files)
    pub data_dir: Option<PathBuf>,

    /// Directory VM disk/kernel images live in
    pub images_dir: Option<PathBuf>,

    /// Hypervisor binary and socket locations
    pub hypervisor: HypervisorConfig,

    /// Bridge / subnet / port-forward configuration
    pub network: NetworkConfig,

    /// Per-VM limits, quotas and optimization switches
    pub resources: ResourceConfig,

    /// VNC display pool configuration
    pub vnc: VncConfig,

    /// Peer discovery, load balancing and replica scaling
    pub cluster: ClusterConfig,

    /// Background task intervals
    pub worker: WorkerConfig,
}

impl Settings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("images"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HypervisorConfig {
    /// Cloud Hypervisor binary
    pub binary_path: PathBuf,
    /// Where per-VM API sockets are created
    pub api_socket_dir: PathBuf,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/cloud-hypervisor"),
            api_socket_dir: PathBuf::from("/tmp/ch-sockets"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkConfig {
    /// Name of the bridge all TAPs attach to
    pub bridge_name: String,
    /// Subnet VMs draw their addresses from
    pub subnet: String,
    /// First host port handed out for forwards
    pub port_range_start: u16,
    /// Last host port handed out for forwards
    pub port_range_end: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "chbr0".to_string(),
            subnet: "192.168.200.0/24".to_string(),
            port_range_start: 10_000,
            port_range_end: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceConfig {
    /// Hard cap on concurrently allocated VMs
    pub max_vms: u32,
    /// Per-VM vCPU ceiling
    pub max_vcpus_per_vm: u32,
    /// Per-VM memory ceiling (MB)
    pub max_memory_per_vm_mb: u64,
    /// Per-VM disk ceiling (GB)
    pub max_disk_per_vm_gb: u64,
    /// Record usage snapshots in the history ring
    pub monitoring_enabled: bool,
    /// Produce right-sizing recommendations
    pub optimization_enabled: bool,
    /// Apply critical/high recommendations automatically
    pub scaling_enabled: bool,
    /// Number of usage snapshots retained
    pub usage_history_size: usize,
    pub default_quota: QuotaConfig,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_vms: 50,
            max_vcpus_per_vm: 8,
            max_memory_per_vm_mb: 8192,
            max_disk_per_vm_gb: 100,
            monitoring_enabled: true,
            optimization_enabled: true,
            scaling_enabled: true,
            usage_history_size: 1000,
            default_quota: QuotaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaConfig {
    pub max_vcpus: u32,
    pub max_memory_mb: u64,
    pub max_disk_gb: u64,
    pub max_vms: u32,
    pub priority: u8,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_vcpus: 4,
            max_memory_mb: 2048,
            max_disk_gb: 20,
            max_vms: 5,
            priority: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VncConfig {
    /// TCP port of display 0
    pub base_port: u16,
    /// First display number handed to guest sessions
    pub display_base: u16,
    /// Maximum concurrent sessions
    pub max_sessions: u16,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            base_port: 5900,
            display_base: 10,
            max_sessions: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterConfig {
    /// Where peer instances are found
    pub backend: ClusterBackendConfig,
    /// Seconds before cached discovery results go stale
    pub discovery_interval_s: u64,
    pub load_balancer: LoadBalancerSettings,
    pub scaler: ScalerSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackendConfig::default(),
            discovery_interval_s: 30,
            load_balancer: LoadBalancerSettings::default(),
            scaler: ScalerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterBackendConfig {
    /// Deployment-API discovery (headless service endpoints)
    #[serde(rename_all = "kebab-case")]
    Orchestrator {
        api_url: String,
        namespace: String,
        service: String,
        deployment: String,
    },
    /// Fixed comma-separated host:port list
    Static { hosts: String },
}

impl Default for ClusterBackendConfig {
    fn default() -> Self {
        Self::Static {
            hosts: "localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoadBalancerSettings {
    pub algorithm: BalanceAlgorithm,
    pub health_check_interval_s: u64,
    pub max_retries: u32,
    pub timeout_s: u64,
    pub sticky_sessions: bool,
    pub session_affinity_timeout_s: u64,
}

impl Default for LoadBalancerSettings {
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

impl From<&LoadBalancerSettings> for LoadBalancerConfig {
    fn from(val: &LoadBalancerSettings) -> Self {
        LoadBalancerConfig {
            algorithm: val.algorithm.clone(),
            health_check_interval_s: val.health_check_interval_s,
            max_retries: val.max_retries,
            timeout_s: val.timeout_s,
            sticky_sessions: val.sticky_sessions,
            session_affinity_timeout_s: val.session_affinity_timeout_s,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScalerSettings {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_percent: f64,
    pub target_memory_percent: f64,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            min_replicas: 3,
            max_replicas: 10,
            target_cpu_percent: 70.0,
            target_memory_percent: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    pub auto_scale_interval_s: u64,
    pub health_check_interval_s: u64,
    pub metrics_interval_s: u64,
    pub cleanup_interval_s: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            auto_scale_interval_s: 60,
            health_check_interval_s: 30,
            metrics_interval_s: 15,
            cleanup_interval_s: 3600,
        }
    }
}

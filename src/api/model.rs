use crate::cluster::{
    ClusterMetrics, LoadBalancerConfig, ScalingAction, ScalingThresholds, ServiceInstance,
};
use crate::images::OsType;
use crate::network::VmNetworkInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---- resources -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResourceAllocationRequest {
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_disk_gb() -> u64 {
    10
}

fn default_priority() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UsageUpdateRequest {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
}

/// Absent fields leave the current value unchanged.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    pub max_vcpus: u32,
    pub max_memory_mb: u64,
    pub max_disk_gb: u64,
    pub max_vms: u32,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn default_user_id() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
pub struct AutoScaleResourcesResponse {
    pub message: String,
    pub scaled_vms: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// ---- network -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PortForwardRequest {
    pub guest_port: u16,
    /// Accepted for wire compatibility; allocation always picks the port.
    #[serde(default)]
    pub host_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PortForwardRemoveRequest {
    pub guest_port: u16,
}

#[derive(Debug, Serialize)]
pub struct PortForwardResponse {
    pub vm_name: String,
    pub guest_port: u16,
    pub host_port: u16,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct InterfaceListResponse {
    pub interfaces: Vec<VmNetworkInfo>,
}

// ---- images --------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterImageRequest {
    pub name: String,
    pub path: String,
    pub os_type: OsType,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWindowsImageRequest {
    pub name: String,
    #[serde(default = "default_windows_size_gb")]
    pub size_gb: u64,
    #[serde(default = "default_windows_format")]
    pub format: String,
}

fn default_windows_size_gb() -> u64 {
    20
}

fn default_windows_format() -> String {
    "qcow2".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateLinuxRootfsRequest {
    pub name: String,
    #[serde(default = "default_rootfs_size_mb")]
    pub size_mb: u64,
    #[serde(default = "default_rootfs_format")]
    pub format: String,
}

fn default_rootfs_size_mb() -> u64 {
    512
}

fn default_rootfs_format() -> String {
    "ext4".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    pub os_type: Option<OsType>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveImageQuery {
    #[serde(default)]
    pub delete_file: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageVerifyResponse {
    pub name: String,
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageCreateResponse {
    pub name: String,
    pub path: String,
    pub message: String,
}

// ---- vnc -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VncStartRequest {
    pub vm_name: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Accepted for wire compatibility with older clients.
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub color_depth: Option<u32>,
    #[serde(default)]
    pub performance_mode: Option<String>,
    /// OS family from the VM template; defaults to linux.
    #[serde(default)]
    pub os_type: Option<OsType>,
    /// Hypervisor console port for windows VMs.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct VncStopRequest {
    pub vm_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotRequest {
    pub vm_name: String,
    #[serde(default = "default_screenshot_format")]
    pub format: String,
}

fn default_screenshot_format() -> String {
    "png".to_string()
}

#[derive(Debug, Serialize)]
pub struct ScreenshotResponse {
    pub vm_name: String,
    pub format: String,
    /// base64-encoded image
    pub image_data: String,
}

#[derive(Debug, Deserialize)]
pub struct MouseClickRequest {
    pub vm_name: String,
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_mouse_button")]
    pub button: u8,
}

fn default_mouse_button() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct KeyCombinationRequest {
    pub vm_name: String,
    pub keys: String,
}

#[derive(Debug, Deserialize)]
pub struct TypeTextRequest {
    pub vm_name: String,
    pub text: String,
}

// ---- cluster -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleAction {
    Up,
    Down,
    Set,
}

#[derive(Debug, Deserialize)]
pub struct ScalingActionRequest {
    pub action: ScaleAction,
    #[serde(default = "default_scale_step")]
    pub replicas: u32,
}

fn default_scale_step() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct ScaleResponse {
    pub message: String,
    pub target_replicas: u32,
    pub action: ScaleAction,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::Up => "up",
            ScaleAction::Down => "down",
            ScaleAction::Set => "set",
        }
    }
}

impl Serialize for ScaleAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct ScalingConfigInfo {
    pub current_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_percent: f64,
    pub target_memory_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct ClusterStatusResponse {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub instances: Vec<ServiceInstance>,
    pub load_balancing_config: LoadBalancerConfig,
    pub connection_counts: HashMap<String, u64>,
    pub scaling_config: ScalingConfigInfo,
    pub metrics: ClusterMetrics,
}

#[derive(Debug, Serialize)]
pub struct ScalingRecommendation {
    pub should_scale_up: bool,
    pub should_scale_down: bool,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ScalingMetricsResponse {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub request_rate: f64,
    pub current_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_percent: f64,
    pub target_memory_percent: f64,
    pub scaling_recommendation: ScalingRecommendation,
}

#[derive(Debug, Serialize)]
pub struct ClusterAutoScaleResponse {
    pub message: String,
    pub action_taken: ScalingAction,
    pub current_replicas: u32,
    pub new_replicas: u32,
    pub metrics: ClusterMetrics,
    pub thresholds: ScalingThresholds,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryRefreshResponse {
    pub message: String,
    pub discovered_instances: usize,
    pub healthy_instances: usize,
    pub instances: Vec<ServiceInstance>,
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthResponse {
    pub status: String,
    pub healthy_instances: usize,
    pub current_replicas: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ---- health --------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthMetrics {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Serialize)]
pub struct HealthMetricsResponse {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub requests_per_second: f64,
}

use crate::settings::{QuotaConfig, ResourceConfig};
use crate::MB;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bounds for one principal's allocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceQuota {
    pub max_vcpus: u32,
    pub max_memory_mb: u64,
    pub max_disk_gb: u64,
    pub max_vms: u32,
    pub priority: u8,
}

impl From<&QuotaConfig> for ResourceQuota {
    fn from(val: &QuotaConfig) -> Self {
        Self {
            max_vcpus: val.max_vcpus,
            max_memory_mb: val.max_memory_mb,
            max_disk_gb: val.max_disk_gb,
            max_vms: val.max_vms,
            priority: val.priority,
        }
    }
}

/// Accounting record for one live VM's claim on host resources.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAllocation {
    pub vm_name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub priority: u8,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub allocated_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time host usage including allocated sums.
#[derive(Debug, Clone, Serialize)]
pub struct SystemUsage {
    pub total_vcpus: u32,
    pub available_vcpus: u32,
    pub used_vcpus: u32,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub used_memory_mb: u64,
    pub total_disk_gb: u64,
    pub available_disk_gb: u64,
    pub used_disk_gb: u64,
    pub active_vms: u32,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub load_average: [f64; 3],
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// Right-sizing proposal for one VM, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRecommendation {
    pub vm_name: String,
    pub recommended_vcpus: u32,
    pub recommended_memory_mb: u64,
    pub current_vcpus: u32,
    pub current_memory_mb: u64,
    pub reason: String,
    pub urgency: Urgency,
    pub estimated_savings_percent: f64,
}

/// Structured dump served by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceMetrics {
    pub system_usage: SystemUsage,
    pub allocations: Vec<ResourceAllocation>,
    pub quotas: HashMap<String, ResourceQuota>,
    pub optimization_enabled: bool,
    pub scaling_enabled: bool,
    pub monitoring_enabled: bool,
}

/// Raw physical reading of the host, before allocation accounting.
#[derive(Debug, Clone)]
pub struct HostSample {
    pub total_vcpus: u32,
    pub cpu_usage_percent: f64,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub total_disk_gb: u64,
    pub available_disk_gb: u64,
    pub load_average: [f64; 3],
}

/// Samples physical host state; swapped for a fixed fake in tests.
#[async_trait]
pub trait SystemSampler: Send + Sync {
    async fn sample(&self) -> Result<HostSample>;
}

/// Sampler backed by the running host.
#[derive(Debug, Default)]
pub struct SysinfoSampler;

#[async_trait]
impl SystemSampler for SysinfoSampler {
    async fn sample(&self) -> Result<HostSample> {
        // CPU percent needs two refreshes a short interval apart, so the
        // whole reading runs off the async threads.
        let sample = tokio::task::spawn_blocking(|| {
            use sysinfo::{Disks, System};

            let mut sys = System::new();
            sys.refresh_cpu_usage();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let disks = Disks::new_with_refreshed_list();
            let (disk_total, disk_avail) = disks
                .list()
                .iter()
                .find(|d| d.mount_point() == Path::new("/"))
                .map(|d| (d.total_space(), d.available_space()))
                .unwrap_or_default();

            let load = System::load_average();
            HostSample {
                total_vcpus: sys.cpus().len() as u32,
                cpu_usage_percent: sys.global_cpu_info().cpu_usage() as f64,
                total_memory_mb: sys.total_memory() / MB,
                available_memory_mb: sys.available_memory() / MB,
                total_disk_gb: disk_total / (MB * 1024),
                available_disk_gb: disk_avail / (MB * 1024),
                load_average: [load.one, load.five, load.fifteen],
            }
        })
        .await?;
        Ok(sample)
    }
}

// Utilization thresholds driving recommendations
const CPU_UNDERUTILIZATION: f64 = 10.0;
const MEMORY_UNDERUTILIZATION: f64 = 20.0;
const CPU_OVERUTILIZATION: f64 = 90.0;
const MEMORY_OVERUTILIZATION: f64 = 85.0;
const RESOURCE_PRESSURE: f64 = 80.0;

const MIN_VCPUS: u32 = 1;
const MIN_MEMORY_MB: u64 = 512;

#[derive(Default)]
struct ResourceState {
    allocations: HashMap<String, ResourceAllocation>,
    quotas: HashMap<String, ResourceQuota>,
    history: VecDeque<SystemUsage>,
}

/// Per-VM resource accounting with quota enforcement.
///
/// Admission is the only place the allocated sums grow, and the state mutex
/// is held across the availability check so `Σ allocated` never exceeds the
/// host totals.
pub struct ResourceManager {
    sampler: Arc<dyn SystemSampler>,
    limits: ResourceQuota,
    default_quota: ResourceQuota,
    history_size: usize,
    monitoring_enabled: bool,
    optimization_enabled: bool,
    scaling_enabled: bool,
    inner: Mutex<ResourceState>,
}

impl ResourceManager {
    pub fn new(config: &ResourceConfig, sampler: Arc<dyn SystemSampler>) -> Self {
        let limits = ResourceQuota {
            max_vcpus: config.max_vcpus_per_vm,
            max_memory_mb: config.max_memory_per_vm_mb,
            max_disk_gb: config.max_disk_per_vm_gb,
            max_vms: config.max_vms,
            priority: 1,
        };
        info!(
            "ResourceManager initialized with system limits: {:?}",
            limits
        );
        Self {
            sampler,
            limits,
            default_quota: (&config.default_quota).into(),
            history_size: config.usage_history_size,
            monitoring_enabled: config.monitoring_enabled,
            optimization_enabled: config.optimization_enabled,
            scaling_enabled: config.scaling_enabled,
            inner: Mutex::new(ResourceState::default()),
        }
    }

    /// Current host usage with allocation sums folded in.
    pub async fn get_system_resources(&self) -> Result<SystemUsage> {
        let mut state = self.inner.lock().await;
        self.sample_usage(&mut state).await
    }

    /// Admit a new VM. Returns false when the request cannot be granted.
    pub async fn allocate(
        &self,
        vm_name: &str,
        vcpus: u32,
        memory_mb: u64,
        disk_gb: u64,
        priority: u8,
        user_quota: Option<&ResourceQuota>,
    ) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let usage = self.sample_usage(&mut state).await?;

        if state.allocations.contains_key(vm_name) {
            warn!("VM {} already has a resource allocation", vm_name);
            return Ok(false);
        }

        let quota = user_quota.unwrap_or(&self.default_quota);
        if !fits_quota(vcpus, memory_mb, disk_gb, quota) {
            warn!("Resource request exceeds quota limits for VM {}", vm_name);
            return Ok(false);
        }
        if !fits_quota(vcpus, memory_mb, disk_gb, &self.limits) {
            warn!("Resource request exceeds system limits for VM {}", vm_name);
            return Ok(false);
        }
        if !is_available(&usage, vcpus, memory_mb, disk_gb) {
            warn!("Insufficient system resources for VM {}", vm_name);
            return Ok(false);
        }
        if state.allocations.len() as u32 >= self.limits.max_vms {
            warn!("Maximum VM limit reached: {}", self.limits.max_vms);
            return Ok(false);
        }

        let now = Utc::now();
        state.allocations.insert(
            vm_name.to_string(),
            ResourceAllocation {
                vm_name: vm_name.to_string(),
                vcpus,
                memory_mb,
                disk_gb,
                priority,
                cpu_usage_percent: 0.0,
                memory_usage_percent: 0.0,
                allocated_at: now,
                last_updated: now,
            },
        );
        info!(
            "Allocated resources for VM {}: {} vCPUs, {} MB RAM, {} GB disk",
            vm_name, vcpus, memory_mb, disk_gb
        );
        Ok(true)
    }

    /// Release a VM's allocation. False when none exists.
    pub async fn deallocate(&self, vm_name: &str) -> bool {
        let mut state = self.inner.lock().await;
        match state.allocations.remove(vm_name) {
            Some(a) => {
                info!(
                    "Deallocated resources for VM {}: {} vCPUs, {} MB RAM, {} GB disk",
                    vm_name, a.vcpus, a.memory_mb, a.disk_gb
                );
                true
            }
            None => {
                warn!("No resource allocation found for VM {}", vm_name);
                false
            }
        }
    }

    /// Record observed guest usage percentages.
    pub async fn update_usage(
        &self,
        vm_name: &str,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
    ) -> bool {
        let mut state = self.inner.lock().await;
        match state.allocations.get_mut(vm_name) {
            Some(a) => {
                a.cpu_usage_percent = cpu_usage_percent;
                a.memory_usage_percent = memory_usage_percent;
                a.last_updated = Utc::now();
                true
            }
            None => {
                warn!("No allocation found for VM {}", vm_name);
                false
            }
        }
    }

    /// Resize a VM's allocation.
    ///
    /// Shrinking always applies; growing re-runs the availability check with
    /// the VM's current claim released. On failure the prior allocation is
    /// untouched.
    pub async fn resize(
        &self,
        vm_name: &str,
        new_vcpus: Option<u32>,
        new_memory_mb: Option<u64>,
    ) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let Some(current) = state.allocations.get(vm_name).cloned() else {
            warn!("No allocation found for VM {}", vm_name);
            return Ok(false);
        };

        let target_vcpus = new_vcpus.unwrap_or(current.vcpus);
        let target_memory = new_memory_mb.unwrap_or(current.memory_mb);

        if !fits_quota(target_vcpus, target_memory, current.disk_gb, &self.limits) {
            warn!(
                "New resource requirements exceed system limits for VM {}",
                vm_name
            );
            return Ok(false);
        }

        if target_vcpus > current.vcpus || target_memory > current.memory_mb {
            // Check availability with this VM's claim released
            let removed = state.allocations.remove(vm_name);
            let usage = self.sample_usage(&mut state).await?;
            if let Some(removed) = removed {
                state.allocations.insert(vm_name.to_string(), removed);
            }
            if !is_available(&usage, target_vcpus, target_memory, current.disk_gb) {
                warn!("Insufficient resources for VM {} resize", vm_name);
                return Ok(false);
            }
        }

        if let Some(a) = state.allocations.get_mut(vm_name) {
            a.vcpus = target_vcpus;
            a.memory_mb = target_memory;
            a.last_updated = Utc::now();
        }
        info!(
            "Resized VM {} resources: {} vCPUs, {} MB RAM",
            vm_name, target_vcpus, target_memory
        );
        Ok(true)
    }

    /// Right-sizing proposals, strongest first. Empty when optimization is
    /// disabled.
    pub async fn get_recommendations(&self) -> Result<Vec<ResourceRecommendation>> {
        if !self.optimization_enabled {
            return Ok(vec![]);
        }
        let mut state = self.inner.lock().await;
        let usage = self.sample_usage(&mut state).await?;

        let mut recommendations: Vec<ResourceRecommendation> = state
            .allocations
            .values()
            .filter_map(|a| self.analyze_allocation(a, &usage))
            .collect();

        recommendations.sort_by(|a, b| {
            b.urgency.cmp(&a.urgency).then(
                b.estimated_savings_percent
                    .partial_cmp(&a.estimated_savings_percent)
                    .unwrap_or(Ordering::Equal),
            )
        });
        Ok(recommendations)
    }

    /// Apply critical/high recommendations, returning the resized VM names.
    pub async fn auto_scale(&self) -> Result<Vec<String>> {
        if !self.scaling_enabled {
            return Ok(vec![]);
        }
        let mut scaled = vec![];
        for rec in self.get_recommendations().await? {
            if rec.urgency >= Urgency::High
                && self
                    .resize(
                        &rec.vm_name,
                        Some(rec.recommended_vcpus),
                        Some(rec.recommended_memory_mb),
                    )
                    .await?
            {
                info!("Auto-scaled VM {}: {}", rec.vm_name, rec.reason);
                scaled.push(rec.vm_name);
            }
        }
        Ok(scaled)
    }

    pub async fn get_allocation(&self, vm_name: &str) -> Option<ResourceAllocation> {
        let state = self.inner.lock().await;
        state.allocations.get(vm_name).cloned()
    }

    pub async fn list_allocations(&self) -> Vec<ResourceAllocation> {
        let state = self.inner.lock().await;
        state.allocations.values().cloned().collect()
    }

    pub async fn set_quota(&self, user_id: &str, quota: ResourceQuota) {
        let mut state = self.inner.lock().await;
        info!("Set quota for user {}: {:?}", user_id, quota);
        state.quotas.insert(user_id.to_string(), quota);
    }

    /// The user's quota, or the default when none is set.
    pub async fn get_quota(&self, user_id: &str) -> ResourceQuota {
        let state = self.inner.lock().await;
        state
            .quotas
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_quota.clone())
    }

    pub async fn export_metrics(&self) -> Result<ResourceMetrics> {
        let mut state = self.inner.lock().await;
        let usage = self.sample_usage(&mut state).await?;
        Ok(ResourceMetrics {
            system_usage: usage,
            allocations: state.allocations.values().cloned().collect(),
            quotas: state.quotas.clone(),
            optimization_enabled: self.optimization_enabled,
            scaling_enabled: self.scaling_enabled,
            monitoring_enabled: self.monitoring_enabled,
        })
    }

    pub async fn usage_history(&self) -> Vec<SystemUsage> {
        let state = self.inner.lock().await;
        state.history.iter().cloned().collect()
    }

    async fn sample_usage(&self, state: &mut ResourceState) -> Result<SystemUsage> {
        let sample = self.sampler.sample().await?;

        let allocated_vcpus: u32 = state.allocations.values().map(|a| a.vcpus).sum();
        let allocated_memory: u64 = state.allocations.values().map(|a| a.memory_mb).sum();
        let allocated_disk: u64 = state.allocations.values().map(|a| a.disk_gb).sum();

        let used_memory = sample.total_memory_mb - sample.available_memory_mb;
        let used_disk = sample.total_disk_gb - sample.available_disk_gb;

        let usage = SystemUsage {
            total_vcpus: sample.total_vcpus,
            available_vcpus: sample.total_vcpus.saturating_sub(allocated_vcpus),
            used_vcpus: allocated_vcpus,
            total_memory_mb: sample.total_memory_mb,
            available_memory_mb: sample.available_memory_mb.saturating_sub(allocated_memory),
            used_memory_mb: used_memory + allocated_memory,
            total_disk_gb: sample.total_disk_gb,
            available_disk_gb: sample.available_disk_gb.saturating_sub(allocated_disk),
            used_disk_gb: used_disk + allocated_disk,
            active_vms: state.allocations.len() as u32,
            cpu_usage_percent: sample.cpu_usage_percent,
            memory_usage_percent: percent(used_memory, sample.total_memory_mb),
            disk_usage_percent: percent(used_disk, sample.total_disk_gb),
            load_average: sample.load_average,
            timestamp: Utc::now(),
        };

        if self.monitoring_enabled {
            state.history.push_back(usage.clone());
            while state.history.len() > self.history_size {
                state.history.pop_front();
            }
        }
        Ok(usage)
    }

    fn analyze_allocation(
        &self,
        allocation: &ResourceAllocation,
        usage: &SystemUsage,
    ) -> Option<ResourceRecommendation> {
        let cpu = allocation.cpu_usage_percent;
        let mem = allocation.memory_usage_percent;

        let cpu_under = cpu < CPU_UNDERUTILIZATION;
        let mem_under = mem < MEMORY_UNDERUTILIZATION;
        let cpu_over = cpu > CPU_OVERUTILIZATION;
        let mem_over = mem > MEMORY_OVERUTILIZATION;

        let pressure =
            percent(usage.used_vcpus as u64, usage.total_vcpus as u64) > RESOURCE_PRESSURE;

        if cpu_under && mem_under && pressure {
            let new_vcpus = allocation.vcpus.saturating_sub(1).max(MIN_VCPUS);
            let new_memory = ((allocation.memory_mb as f64 * 0.8) as u64).max(MIN_MEMORY_MB);
            let savings = if allocation.vcpus == 0 {
                0.0
            } else {
                allocation.vcpus.saturating_sub(new_vcpus) as f64 / allocation.vcpus as f64 * 100.0
            };
            Some(ResourceRecommendation {
                vm_name: allocation.vm_name.clone(),
                recommended_vcpus: new_vcpus,
                recommended_memory_mb: new_memory,
                current_vcpus: allocation.vcpus,
                current_memory_mb: allocation.memory_mb,
                reason: format!(
                    "VM underutilized (CPU: {:.1}%, RAM: {:.1}%) during system pressure",
                    cpu, mem
                ),
                urgency: if pressure {
                    Urgency::High
                } else {
                    Urgency::Medium
                },
                estimated_savings_percent: savings,
            })
        } else if cpu_over || mem_over {
            let new_vcpus = if cpu_over {
                (allocation.vcpus + 1).min(self.limits.max_vcpus)
            } else {
                allocation.vcpus
            };
            let new_memory = if mem_over {
                ((allocation.memory_mb as f64 * 1.2) as u64).min(self.limits.max_memory_mb)
            } else {
                allocation.memory_mb
            };
            Some(ResourceRecommendation {
                vm_name: allocation.vm_name.clone(),
                recommended_vcpus: new_vcpus,
                recommended_memory_mb: new_memory,
                current_vcpus: allocation.vcpus,
                current_memory_mb: allocation.memory_mb,
                reason: format!("VM overutilized (CPU: {:.1}%, RAM: {:.1}%)", cpu, mem),
                urgency: if cpu_over && mem_over {
                    Urgency::Critical
                } else {
                    Urgency::High
                },
                estimated_savings_percent: 0.0,
            })
        } else {
            None
        }
    }
}

fn fits_quota(vcpus: u32, memory_mb: u64, disk_gb: u64, quota: &ResourceQuota) -> bool {
    vcpus <= quota.max_vcpus && memory_mb <= quota.max_memory_mb && disk_gb <= quota.max_disk_gb
}

fn is_available(usage: &SystemUsage, vcpus: u32, memory_mb: u64, disk_gb: u64) -> bool {
    vcpus <= usage.available_vcpus
        && memory_mb <= usage.available_memory_mb
        && disk_gb <= usage.available_disk_gb
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSampler;

    fn manager() -> ResourceManager {
        manager_with(ResourceConfig::default())
    }

    fn manager_with(config: ResourceConfig) -> ResourceManager {
        ResourceManager::new(&config, Arc::new(MockSampler::default()))
    }

    fn wide_quota() -> ResourceQuota {
        ResourceQuota {
            max_vcpus: 8,
            max_memory_mb: 8192,
            max_disk_gb: 100,
            max_vms: 50,
            priority: 1,
        }
    }

    #[tokio::test]
    async fn allocation_against_quota() -> Result<()> {
        let rm = manager();
        let quota = ResourceQuota {
            max_vcpus: 4,
            max_memory_mb: 2048,
            max_disk_gb: 20,
            max_vms: 5,
            priority: 1,
        };

        // one vcpu over quota
        assert!(!rm.allocate("A", 5, 1024, 10, 1, Some(&quota)).await?);
        // exactly at the quota boundary
        assert!(rm.allocate("A", 4, 2048, 20, 1, Some(&quota)).await?);
        // duplicate name
        assert!(!rm.allocate("A", 1, 512, 10, 1, Some(&quota)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn allocated_sums_never_exceed_host() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();

        assert!(rm.allocate("a", 4, 2048, 20, 1, Some(&quota)).await?);
        assert!(rm.allocate("b", 3, 2048, 20, 1, Some(&quota)).await?);
        // host has 8 vcpus, only 1 left
        assert!(!rm.allocate("c", 2, 512, 10, 1, Some(&quota)).await?);
        assert!(rm.allocate("c", 1, 512, 10, 1, Some(&quota)).await?);

        let usage = rm.get_system_resources().await?;
        assert!(usage.used_vcpus <= usage.total_vcpus);
        assert_eq!(usage.used_vcpus, 8);
        assert_eq!(usage.available_vcpus, 0);

        assert!(rm.deallocate("b").await);
        let usage = rm.get_system_resources().await?;
        assert_eq!(usage.used_vcpus, 5);
        Ok(())
    }

    #[tokio::test]
    async fn vm_count_limit_enforced() -> Result<()> {
        let config = ResourceConfig {
            max_vms: 2,
            ..Default::default()
        };
        let rm = manager_with(config);
        let quota = wide_quota();

        assert!(rm.allocate("a", 1, 512, 5, 1, Some(&quota)).await?);
        assert!(rm.allocate("b", 1, 512, 5, 1, Some(&quota)).await?);
        assert!(!rm.allocate("c", 1, 512, 5, 1, Some(&quota)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn resize_frees_own_allocation_first() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        assert!(rm.allocate("vm", 4, 2048, 10, 1, Some(&quota)).await?);

        // grow within host capacity once the VM's own claim is released
        assert!(rm.resize("vm", Some(6), Some(4096)).await?);
        let a = rm.get_allocation("vm").await.unwrap();
        assert_eq!(a.vcpus, 6);
        assert_eq!(a.memory_mb, 4096);

        // over the per-VM limit, prior allocation untouched
        assert!(!rm.resize("vm", Some(10), None).await?);
        let a = rm.get_allocation("vm").await.unwrap();
        assert_eq!(a.vcpus, 6);
        assert_eq!(a.memory_mb, 4096);
        Ok(())
    }

    #[tokio::test]
    async fn resize_shrink_always_applies() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        assert!(rm.allocate("vm", 4, 2048, 10, 1, Some(&quota)).await?);
        assert!(rm.resize("vm", Some(2), Some(1024)).await?);
        let a = rm.get_allocation("vm").await.unwrap();
        assert_eq!(a.vcpus, 2);
        assert_eq!(a.memory_mb, 1024);
        Ok(())
    }

    #[tokio::test]
    async fn recommendations_under_pressure() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        // 7/8 vcpus allocated puts the host over the 80% pressure mark
        assert!(rm.allocate("idle", 4, 2048, 10, 1, Some(&quota)).await?);
        assert!(rm.allocate("busy", 3, 2048, 10, 1, Some(&quota)).await?);

        assert!(rm.update_usage("idle", 5.0, 10.0).await);
        assert!(rm.update_usage("busy", 95.0, 90.0).await);

        let recs = rm.get_recommendations().await?;
        assert_eq!(recs.len(), 2);

        // both over-utilized dimensions sort first as critical
        assert_eq!(recs[0].vm_name, "busy");
        assert_eq!(recs[0].urgency, Urgency::Critical);
        assert_eq!(recs[0].recommended_vcpus, 4);
        assert_eq!(recs[0].recommended_memory_mb, 2457);

        assert_eq!(recs[1].vm_name, "idle");
        assert_eq!(recs[1].urgency, Urgency::High);
        assert_eq!(recs[1].recommended_vcpus, 3);
        assert_eq!(recs[1].recommended_memory_mb, 1638);
        assert!(recs[1].estimated_savings_percent > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn scale_down_never_goes_below_one_vcpu() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        // 8/8 vcpus allocated keeps the host under pressure
        assert!(rm.allocate("tiny", 1, 1024, 10, 1, Some(&quota)).await?);
        assert!(rm.allocate("big", 7, 2048, 10, 1, Some(&quota)).await?);
        assert!(rm.update_usage("tiny", 5.0, 10.0).await);
        assert!(rm.update_usage("big", 50.0, 50.0).await);

        let recs = rm.get_recommendations().await?;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].vm_name, "tiny");
        // a single-vcpu VM stays at the floor with nothing to save
        assert_eq!(recs[0].recommended_vcpus, 1);
        assert_eq!(recs[0].estimated_savings_percent, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn no_recommendations_without_pressure() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        assert!(rm.allocate("idle", 2, 1024, 10, 1, Some(&quota)).await?);
        assert!(rm.update_usage("idle", 5.0, 10.0).await);

        // 2/8 vcpus allocated, no pressure, nothing to report
        let recs = rm.get_recommendations().await?;
        assert!(recs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn auto_scale_applies_high_urgency() -> Result<()> {
        let rm = manager();
        let quota = wide_quota();
        assert!(rm.allocate("busy", 2, 1024, 10, 1, Some(&quota)).await?);
        assert!(rm.update_usage("busy", 95.0, 50.0).await);

        let scaled = rm.auto_scale().await?;
        assert_eq!(scaled, vec!["busy".to_string()]);
        let a = rm.get_allocation("busy").await.unwrap();
        assert_eq!(a.vcpus, 3);
        Ok(())
    }

    #[tokio::test]
    async fn auto_scale_disabled_is_noop() -> Result<()> {
        let config = ResourceConfig {
            scaling_enabled: false,
            ..Default::default()
        };
        let rm = manager_with(config);
        let quota = wide_quota();
        assert!(rm.allocate("busy", 2, 1024, 10, 1, Some(&quota)).await?);
        assert!(rm.update_usage("busy", 95.0, 90.0).await);
        assert!(rm.auto_scale().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn usage_history_is_bounded() -> Result<()> {
        let config = ResourceConfig {
            usage_history_size: 3,
            ..Default::default()
        };
        let rm = manager_with(config);
        for _ in 0..5 {
            rm.get_system_resources().await?;
        }
        assert_eq!(rm.usage_history().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn quota_storage_roundtrip() {
        let rm = manager();
        // unknown user falls back to the default quota
        let q = rm.get_quota("nobody").await;
        assert_eq!(q.max_vcpus, 4);

        let premium = ResourceQuota {
            max_vcpus: 8,
            max_memory_mb: 8192,
            max_disk_gb: 100,
            max_vms: 20,
            priority: 5,
        };
        rm.set_quota("alice", premium.clone()).await;
        assert_eq!(rm.get_quota("alice").await, premium);
    }

    #[tokio::test]
    async fn export_metrics_includes_flags() -> Result<()> {
        let rm = manager();
        let metrics = rm.export_metrics().await?;
        assert!(metrics.optimization_enabled);
        assert!(metrics.scaling_enabled);
        assert!(metrics.monitoring_enabled);
        assert!(metrics.allocations.is_empty());
        Ok(())
    }
}

use crate::cluster::{HorizontalScaler, LoadBalancer, ScalingAction};
use crate::settings::WorkerConfig;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;

const TICK: Duration = Duration::from_secs(5);
const STALE_SOCKET_AGE: Duration = Duration::from_secs(3600);

/// Periodic driver for auto-scaling, health probing and janitorial
/// cleanup.
///
/// Each task runs as a tracked job; a tick never starts a second copy of a
/// task that is still in flight.
pub struct BackgroundWorker {
    balancer: Arc<LoadBalancer>,
    scaler: Arc<HorizontalScaler>,
    config: WorkerConfig,
    socket_dir: PathBuf,
    tasks: HashMap<&'static str, JoinHandle<()>>,
    last_run: HashMap<&'static str, Instant>,
}

impl BackgroundWorker {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        scaler: Arc<HorizontalScaler>,
        config: WorkerConfig,
        socket_dir: PathBuf,
    ) -> Self {
        Self {
            balancer,
            scaler,
            config,
            socket_dir,
            tasks: HashMap::new(),
            last_run: HashMap::new(),
        }
    }

    /// Run until the shutdown signal fires, then wait for in-flight work.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        info!("Background worker started successfully");
        let mut interval = interval(TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = shutdown.notified() => break,
            }
        }
        self.drain().await;
    }

    fn tick(&mut self) {
        if self.due("auto_scale", self.config.auto_scale_interval_s) {
            let scaler = self.scaler.clone();
            self.spawn("auto_scale", async move {
                debug!("Running auto-scaling task");
                let outcome = scaler.auto_scale().await;
                match serde_json::to_string(&outcome) {
                    Ok(json) if outcome.action != ScalingAction::None => {
                        info!("Scaling event: {}", json)
                    }
                    Ok(json) => debug!("No auto-scaling action needed: {}", json),
                    Err(e) => error!("Failed to serialize scaling outcome: {}", e),
                }
            });
        }

        if self.due("health_check", self.config.health_check_interval_s) {
            let balancer = self.balancer.clone();
            self.spawn("health_check", async move {
                debug!("Running health check task");
                let snapshot = balancer.cluster_snapshot().await;
                if snapshot.healthy_instances < snapshot.total_instances {
                    warn!(
                        "Some instances are unhealthy: {}/{} healthy",
                        snapshot.healthy_instances, snapshot.total_instances
                    );
                }
            });
        }

        if self.due("metrics", self.config.metrics_interval_s) {
            let balancer = self.balancer.clone();
            let scaler = self.scaler.clone();
            self.spawn("metrics", async move {
                debug!("Running metrics collection task");
                let snapshot = balancer.cluster_snapshot().await;
                let metrics = scaler.current_metrics().await;
                debug!(
                    "Collected cluster metrics: healthy_instances={} avg_cpu={:.1}%",
                    snapshot.healthy_instances, metrics.cpu_usage
                );
            });
        }

        if self.due("cleanup", self.config.cleanup_interval_s) {
            let balancer = self.balancer.clone();
            let socket_dir = self.socket_dir.clone();
            self.spawn("cleanup", async move {
                debug!("Running cleanup task");
                balancer.purge_expired_affinity().await;
                match cleanup_stale_sockets(&socket_dir, STALE_SOCKET_AGE).await {
                    Ok(removed) if removed > 0 => {
                        info!("Removed {} stale hypervisor socket files", removed)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Error cleaning up temp files: {}", e),
                }
            });
        }
    }

    /// A task is due when its interval elapsed and its previous run
    /// finished.
    fn due(&mut self, name: &'static str, interval_s: u64) -> bool {
        if let Some(handle) = self.tasks.get(name) {
            if !handle.is_finished() {
                return false;
            }
        }
        let due = self
            .last_run
            .get(name)
            .map(|t| t.elapsed() >= Duration::from_secs(interval_s))
            .unwrap_or(true);
        if due {
            self.last_run.insert(name, Instant::now());
        }
        due
    }

    fn spawn(&mut self, name: &'static str, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.insert(name, tokio::spawn(task));
    }

    async fn drain(&mut self) {
        info!("Shutting down background worker...");
        for (_, handle) in self.tasks.drain() {
            handle.abort();
            let _ = handle.await;
        }
        info!("Background worker shutdown complete");
    }
}

/// Delete hypervisor socket files older than `max_age`.
pub(crate) async fn cleanup_stale_sockets(dir: &Path, max_age: Duration) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("ch-") {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let stale = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if stale {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                debug!("Failed to remove socket file {:?}: {}", entry.path(), e);
            } else {
                debug!("Removed old socket file: {:?}", entry.path());
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LoadBalancerConfig, ServiceDiscovery, StaticBackend};
    use crate::settings::ScalerSettings;
    use tempfile::TempDir;

    fn worker() -> BackgroundWorker {
        let discovery = Arc::new(ServiceDiscovery::new(
            Arc::new(StaticBackend::parse("").unwrap()),
            Duration::from_secs(1000),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            discovery.clone(),
            LoadBalancerConfig::default(),
        ));
        let scaler = Arc::new(HorizontalScaler::new(
            discovery,
            ScalerSettings::default(),
        ));
        BackgroundWorker::new(
            balancer,
            scaler,
            WorkerConfig::default(),
            PathBuf::from("/tmp/ch-sockets"),
        )
    }

    #[tokio::test]
    async fn tick_spawns_each_task_once() {
        let mut worker = worker();
        worker.tick();
        assert_eq!(worker.tasks.len(), 4);

        // an immediate second tick re-spawns nothing
        let first_handles: Vec<&&str> = worker.tasks.keys().collect();
        assert_eq!(first_handles.len(), 4);
        worker.tick();
        assert_eq!(worker.tasks.len(), 4);

        worker.drain().await;
        assert!(worker.tasks.is_empty());
    }

    #[tokio::test]
    async fn stale_sockets_are_swept() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("ch-vm1.sock"), b"")?;
        std::fs::write(dir.path().join("keep.txt"), b"")?;

        // nothing is old enough yet
        let removed = cleanup_stale_sockets(dir.path(), Duration::from_secs(3600)).await?;
        assert_eq!(removed, 0);

        // with a zero threshold the socket file goes, the other stays
        let removed = cleanup_stale_sockets(dir.path(), Duration::ZERO).await?;
        assert_eq!(removed, 1);
        assert!(!dir.path().join("ch-vm1.sock").exists());
        assert!(dir.path().join("keep.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_socket_dir_is_not_an_error() -> Result<()> {
        let removed =
            cleanup_stale_sockets(Path::new("/nonexistent/dir"), Duration::ZERO).await?;
        assert_eq!(removed, 0);
        Ok(())
    }
}

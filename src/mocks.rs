#![allow(unused)]
use crate::cluster::{ClusterBackend, Endpoint};
use crate::exec::{CommandExecutor, CommandOutput, CommandRequest};
use crate::resources::{HostSample, SystemSampler};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Records every command and replies with canned outputs. Commands with no
/// matching response succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    commands: std::sync::Mutex<Vec<Vec<String>>>,
    responses: std::sync::Mutex<Vec<(Vec<String>, CommandOutput)>>,
}

impl MockExecutor {
    /// Respond with `output` to any command starting with `prefix`.
    pub fn respond(&self, prefix: &[&str], output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.iter().map(|s| s.to_string()).collect(), output));
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(req.argv.clone());
        let responses = self.responses.lock().unwrap();
        for (prefix, output) in responses.iter() {
            if req.argv.len() >= prefix.len() && req.argv[..prefix.len()] == prefix[..] {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::default())
    }
}

/// Fixed host reading: 8 vCPUs, 8 GiB memory, 100 GB disk.
pub struct MockSampler {
    pub sample: HostSample,
}

impl Default for MockSampler {
    fn default() -> Self {
        Self {
            sample: HostSample {
                total_vcpus: 8,
                cpu_usage_percent: 25.0,
                total_memory_mb: 8192,
                available_memory_mb: 8000,
                total_disk_gb: 100,
                available_disk_gb: 90,
                load_average: [0.5, 0.5, 0.5],
            },
        }
    }
}

#[async_trait]
impl SystemSampler for MockSampler {
    async fn sample(&self) -> Result<HostSample> {
        Ok(self.sample.clone())
    }
}

/// Cluster backend with settable endpoints and an in-memory replica count.
pub struct MockClusterBackend {
    endpoints: Mutex<Vec<(String, u16)>>,
    replicas: Mutex<Option<u32>>,
}

impl MockClusterBackend {
    pub fn new(endpoints: Vec<(String, u16)>, replicas: Option<u32>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints),
            replicas: Mutex::new(replicas),
        }
    }

    pub async fn set_endpoints(&self, endpoints: Vec<(String, u16)>) {
        *self.endpoints.lock().await = endpoints;
    }

    pub async fn current_replicas(&self) -> Option<u32> {
        *self.replicas.lock().await
    }
}

#[async_trait]
impl ClusterBackend for MockClusterBackend {
    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self
            .endpoints
            .lock()
            .await
            .iter()
            .map(|(host, port)| Endpoint {
                host: host.clone(),
                port: *port,
                metadata: HashMap::from([("mock".to_string(), true.into())]),
            })
            .collect())
    }

    async fn replicas(&self) -> Result<Option<u32>> {
        Ok(*self.replicas.lock().await)
    }

    async fn set_replicas(&self, replicas: u32) -> Result<bool> {
        *self.replicas.lock().await = Some(replicas);
        Ok(true)
    }
}

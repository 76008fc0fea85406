use crate::exec::{CommandExecutor, CommandRequest};
use crate::settings::NetworkConfig;
use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of attaching a VM to the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct TapInfo {
    pub tap_name: String,
    pub vm_ip: Ipv4Addr,
    pub bridge_name: String,
    pub subnet: String,
}

/// Read-through view of one VM's interface.
#[derive(Debug, Clone, Serialize)]
pub struct VmNetworkInfo {
    pub tap_name: String,
    pub vm_ip: Ipv4Addr,
    pub bridge_name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Default)]
struct NetState {
    allocated_ips: HashMap<String, Ipv4Addr>,
    tap_table: HashMap<String, String>,
    // (vm_name, guest_port) -> host_port
    port_forwards: HashMap<(String, u16), u16>,
    port_counter: u16,
}

/// Owns the bridge, the VM address pool and the DNAT forward table.
///
/// All side effects are shell commands issued through the executor; the
/// state mutex is held across them so two concurrent tap creations can
/// never be handed the same address.
pub struct NetworkManager {
    executor: Arc<dyn CommandExecutor>,
    bridge_name: String,
    subnet: Ipv4Network,
    port_range_start: u16,
    port_range_end: u16,
    inner: Mutex<NetState>,
}

impl NetworkManager {
    pub fn new(config: &NetworkConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let subnet: Ipv4Network = config
            .subnet
            .parse()
            .with_context(|| format!("Invalid subnet: {}", config.subnet))?;
        Ok(Self {
            executor,
            bridge_name: config.bridge_name.clone(),
            subnet,
            port_range_start: config.port_range_start,
            port_range_end: config.port_range_end,
            inner: Mutex::new(NetState {
                port_counter: config.port_range_start,
                ..Default::default()
            }),
        })
    }

    /// First host address of the subnet, held by the bridge itself.
    fn bridge_ip(&self) -> Result<Ipv4Addr> {
        match self.host_addresses().next() {
            Some(ip) => Ok(ip),
            None => bail!("Subnet {} has no host addresses", self.subnet),
        }
    }

    fn host_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let network = self.subnet.network();
        let broadcast = self.subnet.broadcast();
        self.subnet
            .iter()
            .filter(move |ip| *ip != network && *ip != broadcast)
    }

    /// Create and address the bridge. Idempotent when it already exists.
    pub async fn setup_bridge(&self) -> Result<()> {
        info!("Setting up bridge network '{}'", self.bridge_name);

        let probe = self
            .executor
            .run(&CommandRequest::new(["ip", "link", "show", &self.bridge_name]))
            .await?;
        if probe.success() {
            info!("Bridge '{}' already exists", self.bridge_name);
            return Ok(());
        }

        self.executor
            .run_checked(&CommandRequest::new([
                "ip",
                "link",
                "add",
                "name",
                &self.bridge_name,
                "type",
                "bridge",
            ]))
            .await?;

        let bridge_ip = self.bridge_ip()?;
        self.executor
            .run_checked(&CommandRequest::new([
                "ip",
                "addr",
                "add",
                &format!("{}/{}", bridge_ip, self.subnet.prefix()),
                "dev",
                &self.bridge_name,
            ]))
            .await?;
        self.executor
            .run_checked(&CommandRequest::new([
                "ip",
                "link",
                "set",
                "dev",
                &self.bridge_name,
                "up",
            ]))
            .await?;
        self.executor
            .run_checked(&CommandRequest::new([
                "sysctl",
                "-w",
                "net.ipv4.ip_forward=1",
            ]))
            .await?;
        self.install_nat_rules().await;

        info!("Bridge network '{}' setup complete", self.bridge_name);
        Ok(())
    }

    /// Remove NAT rules and delete the bridge if present.
    pub async fn teardown_bridge(&self) -> Result<()> {
        info!("Tearing down bridge network '{}'", self.bridge_name);
        self.remove_nat_rules().await;

        let probe = self
            .executor
            .run(&CommandRequest::new(["ip", "link", "show", &self.bridge_name]))
            .await?;
        if probe.success() {
            self.executor
                .run_checked(&CommandRequest::new([
                    "ip",
                    "link",
                    "set",
                    "dev",
                    &self.bridge_name,
                    "down",
                ]))
                .await?;
            self.executor
                .run_checked(&CommandRequest::new([
                    "ip",
                    "link",
                    "delete",
                    &self.bridge_name,
                ]))
                .await?;
        }
        Ok(())
    }

    /// Create a TAP for the VM, attach it to the bridge and allocate the
    /// lowest free address in the subnet.
    pub async fn create_tap(&self, vm_name: &str) -> Result<TapInfo> {
        let mut state = self.inner.lock().await;
        if state.allocated_ips.contains_key(vm_name) {
            bail!("VM '{}' already has a network interface", vm_name);
        }
        let tap_name = tap_name(vm_name);

        self.executor
            .run_checked(&CommandRequest::new([
                "ip", "tuntap", "add", "dev", &tap_name, "mode", "tap",
            ]))
            .await?;
        self.executor
            .run_checked(&CommandRequest::new([
                "ip",
                "link",
                "set",
                "dev",
                &tap_name,
                "master",
                &self.bridge_name,
            ]))
            .await?;
        self.executor
            .run_checked(&CommandRequest::new([
                "ip", "link", "set", "dev", &tap_name, "up",
            ]))
            .await?;

        let vm_ip = self.allocate_ip(&mut state, vm_name)?;
        state.tap_table.insert(vm_name.to_string(), tap_name.clone());

        info!(
            "Created TAP interface '{}' for VM '{}' with IP {}",
            tap_name, vm_name, vm_ip
        );
        Ok(TapInfo {
            tap_name,
            vm_ip,
            bridge_name: self.bridge_name.clone(),
            subnet: self.subnet.to_string(),
        })
    }

    /// Delete the VM's TAP and release its address and forwards.
    pub async fn delete_tap(&self, vm_name: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        let tap_name = tap_name(vm_name);

        let probe = self
            .executor
            .run(&CommandRequest::new(["ip", "link", "show", &tap_name]))
            .await?;
        if probe.success() {
            self.executor
                .run_checked(&CommandRequest::new(["ip", "link", "delete", &tap_name]))
                .await?;
        } else {
            warn!("TAP interface '{}' does not exist", tap_name);
        }

        state.allocated_ips.remove(vm_name);
        state.tap_table.remove(vm_name);
        state.port_forwards.retain(|(vm, _), _| vm != vm_name);

        info!("Deleted TAP interface '{}' for VM '{}'", tap_name, vm_name);
        Ok(())
    }

    /// Install a DNAT forward from the next free host port to the guest.
    pub async fn allocate_port_forward(&self, vm_name: &str, guest_port: u16) -> Result<u16> {
        let mut state = self.inner.lock().await;
        let Some(vm_ip) = state.allocated_ips.get(vm_name).copied() else {
            bail!("VM '{}' does not have an allocated IP address", vm_name);
        };
        let host_port = self.next_free_port(&mut state)?;

        self.executor
            .run_checked(&CommandRequest::new([
                "iptables",
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                "tcp",
                "--dport",
                &host_port.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{}:{}", vm_ip, guest_port),
            ]))
            .await?;
        self.executor
            .run_checked(&CommandRequest::new([
                "iptables",
                "-A",
                "FORWARD",
                "-p",
                "tcp",
                "-d",
                &vm_ip.to_string(),
                "--dport",
                &guest_port.to_string(),
                "-j",
                "ACCEPT",
            ]))
            .await?;

        state
            .port_forwards
            .insert((vm_name.to_string(), guest_port), host_port);
        info!("Port forward: host:{} -> {}:{}", host_port, vm_name, guest_port);
        Ok(host_port)
    }

    /// Remove the forward's rules and free its host port. Rule removal is
    /// best-effort.
    pub async fn remove_port_forward(&self, vm_name: &str, guest_port: u16) -> Result<()> {
        let mut state = self.inner.lock().await;
        let key = (vm_name.to_string(), guest_port);
        let Some(host_port) = state.port_forwards.get(&key).copied() else {
            warn!("No port forward found for {}:{}", vm_name, guest_port);
            return Ok(());
        };
        let vm_ip = state
            .allocated_ips
            .get(vm_name)
            .copied()
            .with_context(|| format!("VM '{}' has no allocated IP", vm_name))?;

        self.executor
            .run(&CommandRequest::new([
                "iptables",
                "-t",
                "nat",
                "-D",
                "PREROUTING",
                "-p",
                "tcp",
                "--dport",
                &host_port.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{}:{}", vm_ip, guest_port),
            ]))
            .await?;
        self.executor
            .run(&CommandRequest::new([
                "iptables",
                "-D",
                "FORWARD",
                "-p",
                "tcp",
                "-d",
                &vm_ip.to_string(),
                "--dport",
                &guest_port.to_string(),
                "-j",
                "ACCEPT",
            ]))
            .await?;

        state.port_forwards.remove(&key);
        info!(
            "Removed port forward: host:{} -> {}:{}",
            host_port, vm_name, guest_port
        );
        Ok(())
    }

    /// Interface facts plus kernel byte counters, or None for unknown VMs.
    pub async fn get_vm_network_info(&self, vm_name: &str) -> Result<Option<VmNetworkInfo>> {
        let vm_ip = {
            let state = self.inner.lock().await;
            match state.allocated_ips.get(vm_name).copied() {
                Some(ip) => ip,
                None => return Ok(None),
            }
        };
        let tap_name = tap_name(vm_name);

        Ok(Some(VmNetworkInfo {
            rx_bytes: self.read_interface_counter(&tap_name, "rx_bytes").await,
            tx_bytes: self.read_interface_counter(&tap_name, "tx_bytes").await,
            tap_name,
            vm_ip,
            bridge_name: self.bridge_name.clone(),
        }))
    }

    pub async fn list_network_interfaces(&self) -> Result<Vec<VmNetworkInfo>> {
        let vm_names: Vec<String> = {
            let state = self.inner.lock().await;
            state.allocated_ips.keys().cloned().collect()
        };
        let mut interfaces = Vec::with_capacity(vm_names.len());
        for vm_name in vm_names {
            if let Some(info) = self.get_vm_network_info(&vm_name).await? {
                interfaces.push(info);
            }
        }
        interfaces.sort_by(|a, b| a.tap_name.cmp(&b.tap_name));
        Ok(interfaces)
    }

    pub async fn port_forwards(&self, vm_name: &str) -> Vec<(u16, u16)> {
        let state = self.inner.lock().await;
        state
            .port_forwards
            .iter()
            .filter(|((vm, _), _)| vm == vm_name)
            .map(|((_, guest), host)| (*guest, *host))
            .collect()
    }

    async fn read_interface_counter(&self, tap_name: &str, counter: &str) -> u64 {
        let path = format!("/sys/class/net/{}/statistics/{}", tap_name, counter);
        match self.executor.run(&CommandRequest::new(["cat", &path])).await {
            Ok(out) if out.success() => out.stdout_utf8().trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn allocate_ip(&self, state: &mut NetState, vm_name: &str) -> Result<Ipv4Addr> {
        let used: HashSet<Ipv4Addr> = state.allocated_ips.values().copied().collect();
        // first host address belongs to the bridge
        for ip in self.host_addresses().skip(1) {
            if !used.contains(&ip) {
                state.allocated_ips.insert(vm_name.to_string(), ip);
                return Ok(ip);
            }
        }
        bail!("No available IP addresses in subnet {}", self.subnet)
    }

    fn next_free_port(&self, state: &mut NetState) -> Result<u16> {
        let span = (self.port_range_end - self.port_range_start) as u32 + 1;
        let used: HashSet<u16> = state.port_forwards.values().copied().collect();
        for _ in 0..span {
            let candidate = state.port_counter;
            state.port_counter = if candidate >= self.port_range_end {
                self.port_range_start
            } else {
                candidate + 1
            };
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        bail!(
            "No available ports in range {}-{}",
            self.port_range_start,
            self.port_range_end
        )
    }

    async fn install_nat_rules(&self) {
        let subnet = self.subnet.to_string();
        // best-effort, duplicates are harmless
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                &subnet,
                "!",
                "-d",
                &subnet,
                "-j",
                "MASQUERADE",
            ]))
            .await;
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-A",
                "FORWARD",
                "-i",
                &self.bridge_name,
                "-j",
                "ACCEPT",
            ]))
            .await;
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-A",
                "FORWARD",
                "-o",
                &self.bridge_name,
                "-j",
                "ACCEPT",
            ]))
            .await;
    }

    async fn remove_nat_rules(&self) {
        let subnet = self.subnet.to_string();
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-t",
                "nat",
                "-D",
                "POSTROUTING",
                "-s",
                &subnet,
                "!",
                "-d",
                &subnet,
                "-j",
                "MASQUERADE",
            ]))
            .await;
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-D",
                "FORWARD",
                "-i",
                &self.bridge_name,
                "-j",
                "ACCEPT",
            ]))
            .await;
        let _ = self
            .executor
            .run(&CommandRequest::new([
                "iptables",
                "-D",
                "FORWARD",
                "-o",
                &self.bridge_name,
                "-j",
                "ACCEPT",
            ]))
            .await;
    }
}

fn tap_name(vm_name: &str) -> String {
    format!("tap-{}", vm_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::mocks::MockExecutor;

    fn config() -> NetworkConfig {
        NetworkConfig::default()
    }

    fn manager(executor: Arc<MockExecutor>) -> NetworkManager {
        NetworkManager::new(&config(), executor).unwrap()
    }

    /// `ip link show` fails for unknown links so create paths run
    fn executor_without_links() -> Arc<MockExecutor> {
        let executor = Arc::new(MockExecutor::default());
        executor.respond(
            &["ip", "link", "show"],
            CommandOutput {
                status: 1,
                ..Default::default()
            },
        );
        executor
    }

    #[tokio::test]
    async fn tap_ips_are_unique_and_lowest_first() -> Result<()> {
        let executor = executor_without_links();
        let nm = manager(executor);

        let a = nm.create_tap("a").await?;
        let b = nm.create_tap("b").await?;
        // .1 is the bridge, VMs start at .2
        assert_eq!(a.vm_ip.to_string(), "192.168.200.2");
        assert_eq!(b.vm_ip.to_string(), "192.168.200.3");
        assert_eq!(a.tap_name, "tap-a");

        nm.delete_tap("a").await?;
        let c = nm.create_tap("c").await?;
        assert_eq!(c.vm_ip.to_string(), "192.168.200.2");
        Ok(())
    }

    #[tokio::test]
    async fn create_tap_twice_fails() -> Result<()> {
        let executor = executor_without_links();
        let nm = manager(executor);
        nm.create_tap("a").await?;
        assert!(nm.create_tap("a").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn ip_pool_exhaustion() -> Result<()> {
        let executor = executor_without_links();
        let config = NetworkConfig {
            // /30 has two host addresses and the bridge takes one
            subnet: "192.168.200.0/30".to_string(),
            ..Default::default()
        };
        let nm = NetworkManager::new(&config, executor)?;
        assert_eq!(nm.create_tap("a").await?.vm_ip.to_string(), "192.168.200.2");
        assert!(nm.create_tap("b").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn port_forward_range_exhaustion() -> Result<()> {
        let executor = executor_without_links();
        let config = NetworkConfig {
            port_range_start: 10_000,
            port_range_end: 10_002,
            ..Default::default()
        };
        let nm = NetworkManager::new(&config, executor)?;
        nm.create_tap("vm1").await?;
        nm.create_tap("vm2").await?;
        nm.create_tap("vm3").await?;

        assert_eq!(nm.allocate_port_forward("vm1", 22).await?, 10_000);
        assert_eq!(nm.allocate_port_forward("vm2", 22).await?, 10_001);
        assert_eq!(nm.allocate_port_forward("vm3", 22).await?, 10_002);
        assert!(nm.allocate_port_forward("vm1", 80).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn freed_host_ports_are_reused() -> Result<()> {
        let executor = executor_without_links();
        let config = NetworkConfig {
            port_range_start: 10_000,
            port_range_end: 10_001,
            ..Default::default()
        };
        let nm = NetworkManager::new(&config, executor)?;
        nm.create_tap("vm1").await?;

        assert_eq!(nm.allocate_port_forward("vm1", 22).await?, 10_000);
        assert_eq!(nm.allocate_port_forward("vm1", 80).await?, 10_001);
        nm.remove_port_forward("vm1", 22).await?;
        // counter wraps around and finds the gap
        assert_eq!(nm.allocate_port_forward("vm1", 443).await?, 10_000);
        Ok(())
    }

    #[tokio::test]
    async fn port_forward_requires_ip() {
        let executor = executor_without_links();
        let nm = manager(executor);
        assert!(nm.allocate_port_forward("ghost", 22).await.is_err());
    }

    #[tokio::test]
    async fn delete_tap_releases_forwards() -> Result<()> {
        let executor = executor_without_links();
        let nm = manager(executor);
        nm.create_tap("vm1").await?;
        nm.allocate_port_forward("vm1", 22).await?;
        nm.allocate_port_forward("vm1", 80).await?;
        assert_eq!(nm.port_forwards("vm1").await.len(), 2);

        nm.delete_tap("vm1").await?;
        assert!(nm.port_forwards("vm1").await.is_empty());
        assert!(nm.get_vm_network_info("vm1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn setup_bridge_is_idempotent() -> Result<()> {
        // default mock reports every link as existing
        let executor = Arc::new(MockExecutor::default());
        let nm = manager(executor.clone());
        nm.setup_bridge().await?;

        let commands = executor.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][..3], ["ip", "link", "show"]);
        Ok(())
    }

    #[tokio::test]
    async fn setup_bridge_issues_expected_commands() -> Result<()> {
        let executor = executor_without_links();
        let nm = manager(executor.clone());
        nm.setup_bridge().await?;

        let commands = executor.commands();
        let flat: Vec<String> = commands.iter().map(|c| c.join(" ")).collect();
        assert!(flat.contains(&"ip link add name chbr0 type bridge".to_string()));
        assert!(flat.contains(&"ip addr add 192.168.200.1/24 dev chbr0".to_string()));
        assert!(flat.contains(&"sysctl -w net.ipv4.ip_forward=1".to_string()));
        assert!(flat
            .iter()
            .any(|c| c.contains("POSTROUTING") && c.contains("MASQUERADE")));
        Ok(())
    }

    #[tokio::test]
    async fn dnat_rule_uses_vm_address() -> Result<()> {
        let executor = executor_without_links();
        let nm = manager(executor.clone());
        nm.create_tap("vm1").await?;
        let host_port = nm.allocate_port_forward("vm1", 22).await?;

        let flat: Vec<String> = executor.commands().iter().map(|c| c.join(" ")).collect();
        let expected = format!(
            "iptables -t nat -A PREROUTING -p tcp --dport {} -j DNAT --to-destination 192.168.200.2:22",
            host_port
        );
        assert!(flat.contains(&expected));
        Ok(())
    }
}

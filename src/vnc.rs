use crate::exec::{CommandExecutor, CommandRequest};
use crate::images::OsType;
use crate::settings::VncConfig;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Where the VNC endpoint lives: a server inside the guest display, or the
/// hypervisor's built-in console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VncType {
    Guest,
    Hypervisor,
}

/// Serializable view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct VncSessionInfo {
    pub vm_name: String,
    pub display: u16,
    pub port: u16,
    pub password: String,
    pub vnc_type: VncType,
    pub os_type: OsType,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_count: u32,
    pub status: String,
}

struct VncSession {
    vm_name: String,
    display: u16,
    port: u16,
    password: String,
    vnc_type: VncType,
    os_type: OsType,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    connection_count: u32,
    process: Option<Child>,
}

impl VncSession {
    fn info(&self) -> VncSessionInfo {
        VncSessionInfo {
            vm_name: self.vm_name.clone(),
            display: self.display,
            port: self.port,
            password: self.password.clone(),
            vnc_type: self.vnc_type,
            os_type: self.os_type,
            created_at: self.created_at,
            last_activity: self.last_activity,
            connection_count: self.connection_count,
            status: if self.process.is_some() || self.vnc_type == VncType::Hypervisor {
                "running".to_string()
            } else {
                "stopped".to_string()
            },
        }
    }
}

/// Per-start options carried in from the VM template.
#[derive(Debug, Clone, Default)]
pub struct VncOptions {
    pub password: Option<String>,
    /// speed / balanced / quality
    pub performance_mode: Option<String>,
    /// Hypervisor console port (`--console vnc=<port>`)
    pub port: Option<u16>,
}

/// VNC session registry and display/port pool.
///
/// Guest sessions own an x11vnc process; hypervisor sessions only record
/// the console port Cloud Hypervisor was started with.
pub struct VncManager {
    executor: Arc<dyn CommandExecutor>,
    data_dir: PathBuf,
    base_port: u16,
    display_base: u16,
    max_sessions: u16,
    inner: Mutex<HashMap<String, VncSession>>,
}

impl VncManager {
    pub fn new(
        config: &VncConfig,
        data_dir: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        let data_dir = data_dir.into().join("vnc");
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create VNC data dir {}", data_dir.display()))?;
        info!("VNC manager initialized");
        Ok(Self {
            executor,
            data_dir,
            base_port: config.base_port,
            display_base: config.display_base,
            max_sessions: config.max_sessions,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Start (or return the existing) session for a VM.
    pub async fn start(
        &self,
        vm_name: &str,
        os_type: OsType,
        options: VncOptions,
    ) -> Result<VncSessionInfo> {
        let mut sessions = self.inner.lock().await;
        if let Some(existing) = sessions.get(vm_name) {
            warn!("VNC session already exists for VM '{}'", vm_name);
            return Ok(existing.info());
        }

        let vnc_type = match os_type {
            OsType::Windows => VncType::Hypervisor,
            OsType::Linux => VncType::Guest,
        };
        let (display, port) = match vnc_type {
            VncType::Hypervisor => {
                // the hypervisor console owns the port, nothing to allocate
                let port = options.port.unwrap_or(self.base_port);
                (port.saturating_sub(self.base_port), port)
            }
            VncType::Guest => {
                let used: HashSet<u16> = sessions.values().map(|s| s.display).collect();
                let display = self.allocate_display(&used).await?;
                (display, self.base_port + display)
            }
        };
        let password = match &options.password {
            Some(p) => p.clone(),
            None => Alphanumeric.sample_string(&mut rand::rng(), 12),
        };

        info!(
            "Starting {:?} VNC server for {:?} VM '{}' on port {}",
            vnc_type, os_type, vm_name, port
        );

        let mut session = VncSession {
            vm_name: vm_name.to_string(),
            display,
            port,
            password,
            vnc_type,
            os_type,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            connection_count: 0,
            process: None,
        };

        if vnc_type == VncType::Guest {
            self.write_password_file(vm_name, &session.password).await?;
            match self.spawn_vnc_process(&session, &options).await {
                Ok(child) => session.process = Some(child),
                Err(e) => {
                    let _ = tokio::fs::remove_file(self.password_file(vm_name)).await;
                    return Err(e);
                }
            }
        }

        let info = session.info();
        self.save_session_file(&session).await?;
        sessions.insert(vm_name.to_string(), session);
        info!("VNC server started for VM '{}' - Port: {}", vm_name, port);
        Ok(info)
    }

    /// Stop a session. False when none exists.
    pub async fn stop(&self, vm_name: &str) -> Result<bool> {
        let mut sessions = self.inner.lock().await;
        let Some(mut session) = sessions.remove(vm_name) else {
            warn!("No VNC session found for VM '{}'", vm_name);
            return Ok(false);
        };
        info!(
            "Stopping VNC server for VM '{}' (display :{})",
            vm_name, session.display
        );
        self.stop_process(&mut session).await;

        let _ = tokio::fs::remove_file(self.session_file(vm_name)).await;
        let _ = tokio::fs::remove_file(self.password_file(vm_name)).await;
        info!("VNC server stopped for VM '{}'", vm_name);
        Ok(true)
    }

    /// Session info, reaping the entry when its tracked process died.
    pub async fn get_info(&self, vm_name: &str) -> Result<Option<VncSessionInfo>> {
        let mut sessions = self.inner.lock().await;
        self.reap_if_dead(&mut sessions, vm_name).await;
        Ok(sessions.get(vm_name).map(|s| s.info()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<VncSessionInfo>> {
        let mut sessions = self.inner.lock().await;
        let names: Vec<String> = sessions.keys().cloned().collect();
        for name in names {
            self.reap_if_dead(&mut sessions, &name).await;
        }
        let mut list: Vec<VncSessionInfo> = sessions.values().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        Ok(list)
    }

    /// Capture the session's screen as PNG (guest via xwd/convert,
    /// hypervisor via vncdo).
    pub async fn take_screenshot(&self, vm_name: &str) -> Result<Vec<u8>> {
        let mut sessions = self.inner.lock().await;
        let session = sessions
            .get_mut(vm_name)
            .with_context(|| format!("No VNC session found for VM '{}'", vm_name))?;

        let image = match session.vnc_type {
            VncType::Guest => {
                debug!(
                    "Taking screenshot of VM '{}' display :{}",
                    vm_name, session.display
                );
                let raw = self
                    .executor
                    .run_checked(&CommandRequest::new([
                        "xwd",
                        "-display",
                        &format!(":{}", session.display),
                        "-root",
                        "-silent",
                    ]))
                    .await
                    .context("Screenshot capture failed")?;
                let png = self
                    .executor
                    .run_checked(
                        &CommandRequest::new(["convert", "xwd:-", "png:-"])
                            .with_stdin(raw.stdout),
                    )
                    .await
                    .context("Screenshot conversion failed")?;
                png.stdout
            }
            VncType::Hypervisor => {
                let capture = self.data_dir.join(format!("{}-capture.png", vm_name));
                let capture_str = capture.display().to_string();
                self.executor
                    .run_checked(&CommandRequest::new([
                        "vncdo",
                        "-s",
                        &format!("localhost:{}", session.port),
                        "capture",
                        &capture_str,
                    ]))
                    .await
                    .context("Screenshot capture failed")?;
                let data = tokio::fs::read(&capture).await.unwrap_or_default();
                let _ = tokio::fs::remove_file(&capture).await;
                data
            }
        };
        session.last_activity = Utc::now();
        Ok(image)
    }

    /// Send a key combination (e.g. "ctrl+alt+t").
    pub async fn send_keys(&self, vm_name: &str, keys: &str) -> Result<()> {
        let mut sessions = self.inner.lock().await;
        let session = sessions
            .get_mut(vm_name)
            .with_context(|| format!("No VNC session found for VM '{}'", vm_name))?;

        match session.vnc_type {
            VncType::Guest => {
                self.executor
                    .run_checked(&CommandRequest::new([
                        "xdotool",
                        "key",
                        "--display",
                        &format!(":{}", session.display),
                        keys,
                    ]))
                    .await?;
            }
            VncType::Hypervisor => {
                self.executor
                    .run_checked(&CommandRequest::new([
                        "vncdo",
                        "-s",
                        &format!("localhost:{}", session.port),
                        "key",
                        keys,
                    ]))
                    .await?;
            }
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Click at the given coordinates (button 1=left, 2=middle, 3=right).
    pub async fn mouse_click(&self, vm_name: &str, x: i32, y: i32, button: u8) -> Result<()> {
        let mut sessions = self.inner.lock().await;
        let session = sessions
            .get_mut(vm_name)
            .with_context(|| format!("No VNC session found for VM '{}'", vm_name))?;

        match session.vnc_type {
            VncType::Guest => {
                self.executor
                    .run_checked(&CommandRequest::new([
                        "xdotool",
                        "--display",
                        &format!(":{}", session.display),
                        "mousemove",
                        &x.to_string(),
                        &y.to_string(),
                        "click",
                        &button.to_string(),
                    ]))
                    .await?;
            }
            VncType::Hypervisor => {
                let button_name = match button {
                    2 => "middle",
                    3 => "right",
                    _ => "left",
                };
                self.executor
                    .run_checked(&CommandRequest::new([
                        "vncdo",
                        "-s",
                        &format!("localhost:{}", session.port),
                        "move",
                        &x.to_string(),
                        &y.to_string(),
                        "click",
                        button_name,
                    ]))
                    .await?;
            }
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Type free text into a guest session. Hypervisor consoles only take
    /// key combinations, so text input there is rejected.
    pub async fn type_text(&self, vm_name: &str, text: &str) -> Result<()> {
        let mut sessions = self.inner.lock().await;
        let session = sessions
            .get_mut(vm_name)
            .with_context(|| format!("No VNC session found for VM '{}'", vm_name))?;

        match session.vnc_type {
            VncType::Guest => {
                self.executor
                    .run_checked(&CommandRequest::new([
                        "xdotool",
                        "--display",
                        &format!(":{}", session.display),
                        "type",
                        text,
                    ]))
                    .await?;
            }
            VncType::Hypervisor => {
                bail!(
                    "Text input is not supported for hypervisor VNC sessions (VM '{}')",
                    vm_name
                );
            }
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Stop every session, used during shutdown.
    pub async fn stop_all(&self) {
        info!("Cleaning up all VNC sessions");
        let names: Vec<String> = {
            let sessions = self.inner.lock().await;
            sessions.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!("Error cleaning up VNC session for '{}': {}", name, e);
            }
        }
    }

    /// Lowest free display whose port is actually bindable.
    async fn allocate_display(&self, used: &HashSet<u16>) -> Result<u16> {
        for display in self.display_base..self.display_base + self.max_sessions {
            if used.contains(&display) {
                continue;
            }
            let port = self.base_port + display;
            if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                return Ok(display);
            }
        }
        bail!("No available VNC displays")
    }

    async fn write_password_file(&self, vm_name: &str, password: &str) -> Result<()> {
        let out = self
            .executor
            .run_checked(
                &CommandRequest::new(["vncpasswd", "-f"])
                    .with_stdin(format!("{}\n{}\n", password, password)),
            )
            .await
            .context("Failed to create VNC password file")?;

        let passwd_file = self.password_file(vm_name);
        tokio::fs::write(&passwd_file, &out.stdout).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&passwd_file, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        debug!("VNC password file created for VM '{}'", vm_name);
        Ok(())
    }

    async fn spawn_vnc_process(&self, session: &VncSession, options: &VncOptions) -> Result<Child> {
        let passwd_file = self.password_file(&session.vm_name);
        let log_file = self.data_dir.join(format!("{}.log", session.vm_name));

        let mut cmd = Command::new("x11vnc");
        cmd.args([
            "-display",
            &format!(":{}", session.display),
            "-rfbport",
            &session.port.to_string(),
            "-passwd",
            &passwd_file.display().to_string(),
            "-forever",
            "-shared",
            "-noxdamage",
            "-noxfixes",
            "-noxrandr",
            "-wait",
            "5",
            "-defer",
            "5",
            "-logfile",
            &log_file.display().to_string(),
        ]);
        match options.performance_mode.as_deref() {
            Some("speed") => {
                cmd.args(["-nolookup", "-nosel", "-nocursor"]);
            }
            Some("quality") => {
                cmd.args(["-cursor", "arrow", "-cursorpos"]);
            }
            _ => {}
        }
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().context("Failed to start x11vnc")?;

        // give the server a moment and confirm it survived startup
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Some(status) = child.try_wait()? {
            bail!("VNC server failed to start (exit {})", status);
        }
        debug!("VNC server process started (PID: {:?})", child.id());
        Ok(child)
    }

    async fn stop_process(&self, session: &mut VncSession) {
        let Some(mut child) = session.process.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            let _ = self
                .executor
                .run(&CommandRequest::new(["kill", "-TERM", &pid.to_string()]))
                .await;
        }
        let graceful = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        match graceful {
            Ok(_) => debug!("VNC process terminated gracefully"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Error stopping VNC process: {}", e);
                } else {
                    debug!("VNC process force killed");
                }
            }
        }
    }

    async fn reap_if_dead(&self, sessions: &mut HashMap<String, VncSession>, vm_name: &str) {
        let dead = sessions
            .get_mut(vm_name)
            .and_then(|s| s.process.as_mut())
            .map(|p| matches!(p.try_wait(), Ok(Some(_))))
            .unwrap_or(false);
        if dead {
            warn!("VNC process for VM '{}' has terminated", vm_name);
            if let Some(mut session) = sessions.remove(vm_name) {
                self.stop_process(&mut session).await;
            }
            let _ = tokio::fs::remove_file(self.session_file(vm_name)).await;
            let _ = tokio::fs::remove_file(self.password_file(vm_name)).await;
        }
    }

    fn session_file(&self, vm_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", vm_name))
    }

    fn password_file(&self, vm_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.passwd", vm_name))
    }

    async fn save_session_file(&self, session: &VncSession) -> Result<()> {
        // the password lives only in the 0600 passwd file
        let data = serde_json::json!({
            "vm_name": session.vm_name,
            "display": session.display,
            "port": session.port,
            "vnc_type": session.vnc_type,
            "os_type": session.os_type,
            "created_at": session.created_at,
            "connection_count": session.connection_count,
            "last_activity": session.last_activity,
        });
        tokio::fs::write(
            self.session_file(&session.vm_name),
            serde_json::to_string_pretty(&data)?,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockExecutor;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, executor: Arc<MockExecutor>) -> VncManager {
        VncManager::new(&VncConfig::default(), dir.path(), executor).unwrap()
    }

    #[tokio::test]
    async fn hypervisor_session_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let vnc = manager(&dir, Arc::new(MockExecutor::default()));

        let info = vnc
            .start(
                "win-vm",
                OsType::Windows,
                VncOptions {
                    port: Some(5910),
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(info.vnc_type, VncType::Hypervisor);
        assert_eq!(info.port, 5910);
        assert_eq!(info.display, 10);
        assert_eq!(info.status, "running");
        assert_eq!(info.password.len(), 12);
        assert!(dir.path().join("vnc/win-vm.json").exists());

        let fetched = vnc.get_info("win-vm").await?.expect("session");
        assert_eq!(fetched.port, 5910);

        assert!(vnc.stop("win-vm").await?);
        assert!(vnc.get_info("win-vm").await?.is_none());
        assert!(!dir.path().join("vnc/win-vm.json").exists());
        assert!(!vnc.stop("win-vm").await?);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_start_returns_existing_session() -> Result<()> {
        let dir = TempDir::new()?;
        let vnc = manager(&dir, Arc::new(MockExecutor::default()));
        let options = VncOptions {
            port: Some(5905),
            password: Some("secret".to_string()),
            ..Default::default()
        };

        let first = vnc.start("vm", OsType::Windows, options.clone()).await?;
        let second = vnc.start("vm", OsType::Windows, options).await?;
        assert_eq!(first.port, second.port);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(vnc.list_sessions().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn display_pool_skips_used_displays() -> Result<()> {
        let dir = TempDir::new()?;
        let vnc = manager(&dir, Arc::new(MockExecutor::default()));

        let mut used = HashSet::new();
        let first = vnc.allocate_display(&used).await?;
        assert_eq!(first, 10);
        used.insert(first);
        let second = vnc.allocate_display(&used).await?;
        assert_eq!(second, 11);
        Ok(())
    }

    #[tokio::test]
    async fn display_pool_exhaustion() -> Result<()> {
        let dir = TempDir::new()?;
        let config = VncConfig {
            max_sessions: 2,
            ..Default::default()
        };
        let vnc = VncManager::new(&config, dir.path(), Arc::new(MockExecutor::default()))?;
        let used: HashSet<u16> = [10, 11].into_iter().collect();
        assert!(vnc.allocate_display(&used).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn hypervisor_input_goes_through_vncdo() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(MockExecutor::default());
        let vnc = manager(&dir, executor.clone());
        vnc.start(
            "win-vm",
            OsType::Windows,
            VncOptions {
                port: Some(5905),
                ..Default::default()
            },
        )
        .await?;

        vnc.send_keys("win-vm", "ctrl+alt+del").await?;
        vnc.mouse_click("win-vm", 100, 200, 3).await?;

        let flat: Vec<String> = executor.commands().iter().map(|c| c.join(" ")).collect();
        assert!(flat.contains(&"vncdo -s localhost:5905 key ctrl+alt+del".to_string()));
        assert!(flat.contains(&"vncdo -s localhost:5905 move 100 200 click right".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn hypervisor_type_text_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(MockExecutor::default());
        let vnc = manager(&dir, executor.clone());
        vnc.start(
            "win-vm",
            OsType::Windows,
            VncOptions {
                port: Some(5905),
                ..Default::default()
            },
        )
        .await?;

        assert!(vnc.type_text("win-vm", "hello").await.is_err());
        // nothing was dispatched to the automation tool
        let flat: Vec<String> = executor.commands().iter().map(|c| c.join(" ")).collect();
        assert!(!flat.iter().any(|c| c.contains("type")));
        Ok(())
    }

    #[tokio::test]
    async fn input_on_unknown_session_fails() {
        let dir = TempDir::new().unwrap();
        let vnc = manager(&dir, Arc::new(MockExecutor::default()));
        assert!(vnc.send_keys("ghost", "a").await.is_err());
        assert!(vnc.take_screenshot("ghost").await.is_err());
    }

    #[tokio::test]
    async fn input_updates_last_activity() -> Result<()> {
        let dir = TempDir::new()?;
        let vnc = manager(&dir, Arc::new(MockExecutor::default()));
        let info = vnc
            .start(
                "win-vm",
                OsType::Windows,
                VncOptions {
                    port: Some(5905),
                    ..Default::default()
                },
            )
            .await?;

        vnc.send_keys("win-vm", "a").await?;
        let after = vnc.get_info("win-vm").await?.unwrap();
        assert!(after.last_activity >= info.last_activity);
        Ok(())
    }
}

use crate::exec::{CommandExecutor, CommandRequest};
use crate::MB;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Guest OS family an image boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
}

/// One registered disk/kernel image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub path: PathBuf,
    pub os_type: OsType,
    pub size_bytes: u64,
    pub sha256_checksum: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

const WINDOWS_MIN_BYTES: u64 = 100 * MB;
const KERNEL_MIN_BYTES: u64 = MB;

/// Checksum-indexed image registry persisted as one JSON file.
pub struct ImageRegistry {
    executor: Arc<dyn CommandExecutor>,
    linux_dir: PathBuf,
    windows_dir: PathBuf,
    registry_path: PathBuf,
    inner: Mutex<HashMap<String, ImageRecord>>,
}

impl ImageRegistry {
    pub fn new(images_dir: impl Into<PathBuf>, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let images_dir = images_dir.into();
        let linux_dir = images_dir.join("linux");
        let windows_dir = images_dir.join("windows");
        for dir in [&images_dir, &linux_dir, &windows_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create image dir {}", dir.display()))?;
        }

        let registry_path = images_dir.join("image_registry.json");
        let registry = load_registry(&registry_path);
        Ok(Self {
            executor,
            linux_dir,
            windows_dir,
            registry_path,
            inner: Mutex::new(registry),
        })
    }

    /// Validate an image file for the given OS family.
    pub async fn validate(&self, path: &Path, os_type: OsType) -> Result<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Image file not found: {}", path.display()))?;
        if !meta.is_file() {
            bail!("Path is not a file: {}", path.display());
        }

        match os_type {
            OsType::Windows => {
                if meta.len() < WINDOWS_MIN_BYTES {
                    bail!(
                        "Windows image too small: {} bytes (minimum {})",
                        meta.len(),
                        WINDOWS_MIN_BYTES
                    );
                }
                let info = self
                    .executor
                    .run_checked(&CommandRequest::new([
                        "qemu-img",
                        "info",
                        &path.display().to_string(),
                    ]))
                    .await
                    .context("Invalid QEMU image")?;
                let stdout = info.stdout_utf8();
                if !stdout.contains("qcow2") && !stdout.contains("raw") {
                    bail!("Image must be in qcow2 or raw format");
                }
            }
            OsType::Linux => match path.extension().and_then(|e| e.to_str()) {
                Some("bin") => {
                    if meta.len() < KERNEL_MIN_BYTES {
                        bail!("Kernel image too small: {} bytes", meta.len());
                    }
                }
                Some("ext4") | Some("img") => {
                    let out = self
                        .executor
                        .run(&CommandRequest::new(["file", &path.display().to_string()]))
                        .await?;
                    if !out.stdout_utf8().to_lowercase().contains("filesystem") {
                        warn!(
                            "Rootfs {} might not be a valid filesystem",
                            path.display()
                        );
                    }
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Validate, checksum and persist a new image record.
    pub async fn register(
        &self,
        name: &str,
        path: &Path,
        os_type: OsType,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<ImageRecord> {
        info!("Registering image '{}' at {}", name, path.display());
        self.validate(path, os_type).await?;

        let size_bytes = tokio::fs::metadata(path).await?.len();
        let sha256_checksum = compute_checksum(path).await?;

        let record = ImageRecord {
            name: name.to_string(),
            path: path.to_path_buf(),
            os_type,
            size_bytes,
            sha256_checksum,
            created_at: Utc::now(),
            metadata,
        };

        let mut registry = self.inner.lock().await;
        registry.insert(name.to_string(), record.clone());
        self.save_registry(&registry).await?;

        info!("Image '{}' registered successfully", name);
        Ok(record)
    }

    pub async fn get(&self, name: &str) -> Option<ImageRecord> {
        let registry = self.inner.lock().await;
        registry.get(name).cloned()
    }

    /// All registered images, newest first, optionally filtered by OS.
    pub async fn list(&self, os_type: Option<OsType>) -> Vec<ImageRecord> {
        let registry = self.inner.lock().await;
        let mut images: Vec<ImageRecord> = registry
            .values()
            .filter(|i| os_type.map(|t| i.os_type == t).unwrap_or(true))
            .cloned()
            .collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    /// Drop an image from the registry, optionally deleting the file.
    pub async fn remove(&self, name: &str, delete_file: bool) -> Result<()> {
        let mut registry = self.inner.lock().await;
        let Some(record) = registry.remove(name) else {
            bail!("Image '{}' not found in registry", name);
        };
        if delete_file && record.path.exists() {
            tokio::fs::remove_file(&record.path).await?;
            info!("Deleted image file: {}", record.path.display());
        }
        self.save_registry(&registry).await?;
        info!("Image '{}' removed from registry", name);
        Ok(())
    }

    /// Create a blank Windows disk image and register it.
    pub async fn create_windows_image(
        &self,
        name: &str,
        size_gb: u64,
        format: &str,
    ) -> Result<PathBuf> {
        info!("Creating Windows image '{}' ({}GB)", name, size_gb);
        let path = self.windows_dir.join(format!("{}.{}", name, format));

        self.executor
            .run_checked(&CommandRequest::new([
                "qemu-img",
                "create",
                "-f",
                format,
                &path.display().to_string(),
                &format!("{}G", size_gb),
            ]))
            .await?;

        let metadata = HashMap::from([
            ("size_gb".to_string(), size_gb.into()),
            ("format".to_string(), format.into()),
            ("created_by".to_string(), "image_registry".into()),
        ]);
        self.register(name, &path, OsType::Windows, metadata).await?;
        Ok(path)
    }

    /// Allocate and format a Linux rootfs image, then register it.
    pub async fn create_linux_rootfs(
        &self,
        name: &str,
        size_mb: u64,
        format: &str,
    ) -> Result<PathBuf> {
        info!("Creating Linux rootfs '{}' ({}MB)", name, size_mb);
        let path = self.linux_dir.join(format!("{}.{}", name, format));

        self.executor
            .run_checked(&CommandRequest::new([
                "dd",
                "if=/dev/zero",
                &format!("of={}", path.display()),
                "bs=1M",
                &format!("count={}", size_mb),
            ]))
            .await?;
        if format == "ext4" {
            self.executor
                .run_checked(&CommandRequest::new([
                    "mkfs.ext4",
                    "-F",
                    &path.display().to_string(),
                ]))
                .await?;
        }

        let metadata = HashMap::from([
            ("size_mb".to_string(), size_mb.into()),
            ("format".to_string(), format.into()),
            ("type".to_string(), "rootfs".into()),
            ("created_by".to_string(), "image_registry".into()),
        ]);
        self.register(name, &path, OsType::Linux, metadata).await?;
        Ok(path)
    }

    /// Recompute the checksum and compare to the registered value.
    pub async fn verify_integrity(&self, name: &str) -> Result<bool> {
        let Some(record) = self.get(name).await else {
            bail!("Image '{}' not found", name);
        };
        if !record.path.exists() {
            warn!("Image file not found: {}", record.path.display());
            return Ok(false);
        }
        let current = compute_checksum(&record.path).await?;
        if current != record.sha256_checksum {
            warn!("Checksum mismatch for image '{}'", name);
            return Ok(false);
        }
        Ok(true)
    }

    /// Format/size facts for an image file; basic file facts when qemu-img
    /// cannot read it.
    pub async fn image_info(&self, path: &Path) -> Result<serde_json::Value> {
        let out = self
            .executor
            .run(&CommandRequest::new([
                "qemu-img",
                "info",
                "--output=json",
                &path.display().to_string(),
            ]))
            .await?;
        if out.success() {
            return Ok(serde_json::from_str(&out.stdout_utf8())?);
        }
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        Ok(serde_json::json!({
            "filename": path.display().to_string(),
            "format": "unknown",
            "virtual_size": size,
            "actual_size": size,
        }))
    }

    async fn save_registry(&self, registry: &HashMap<String, ImageRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(registry)?;
        tokio::fs::write(&self.registry_path, json).await?;
        debug!("Image registry saved");
        Ok(())
    }
}

fn load_registry(path: &Path) -> HashMap<String, ImageRecord> {
    if !path.exists() {
        return HashMap::new();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|data| {
            serde_json::from_str::<HashMap<String, ImageRecord>>(&data).map_err(Into::into)
        });
    match parsed {
        Ok(registry) => {
            info!("Loaded {} images from registry", registry.len());
            registry
        }
        Err(e) => {
            warn!("Failed to load image registry: {}", e);
            HashMap::new()
        }
    }
}

/// Streamed SHA-256 of a file, run off the async threads so a multi-GB
/// image never stalls the control plane.
pub async fn compute_checksum(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    debug!("Calculating checksum for {}", path.display());
    let checksum = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await??;
    debug!("Checksum calculated: {}...", &checksum[..16]);
    Ok(checksum)
}

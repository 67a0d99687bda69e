//! Adapter discovery
//!
//! Enumerates removable disks that might be an adapter. Discovery only
//! proposes candidates; identity is confirmed by the session on connect.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// A candidate device as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Block device path
    pub path: PathBuf,
    /// Human-readable label (volume or model name)
    pub label: String,
    pub removable: bool,
    /// Unbuffered device node, when the OS has a separate one (`/dev/rdiskN`)
    pub raw_path: Option<PathBuf>,
}

impl DeviceDescriptor {
    /// Descriptor for an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            removable: true,
            raw_path: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_raw_path(mut self, raw: impl Into<PathBuf>) -> Self {
        self.raw_path = Some(raw.into());
        self
    }

    /// Path to open for data transfer
    pub fn io_path(&self) -> &Path {
        self.raw_path.as_deref().unwrap_or(&self.path)
    }
}

/// Source of candidate devices
pub trait DeviceDiscovery: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Fixed list of descriptors
impl DeviceDiscovery for Vec<DeviceDescriptor> {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.clone())
    }
}

/// Enumerates removable disks through the operating system
#[derive(Debug, Clone)]
pub struct SystemDiscovery {
    sysfs: PathBuf,
}

impl Default for SystemDiscovery {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys/block"),
        }
    }
}

impl SystemDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan another sysfs block directory
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self { sysfs: root.into() }
    }

    fn scan_sysfs(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.sysfs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("sd") {
                continue;
            }
            let dir = entry.path();
            if read_attr(&dir.join("removable")).as_deref() != Some("1") {
                continue;
            }
            // Empty card readers report size 0
            if read_attr(&dir.join("size")).as_deref() == Some("0") {
                continue;
            }
            let label = read_attr(&dir.join("device/model")).unwrap_or_else(|| name.clone());
            log::debug!("candidate /dev/{} ({})", name, label);
            found.push(DeviceDescriptor::new(Path::new("/dev").join(&name)).with_label(label));
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

fn read_attr(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

impl DeviceDiscovery for SystemDiscovery {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        if cfg!(target_os = "linux") || self.sysfs != Path::new("/sys/block") {
            return self.scan_sysfs();
        }
        log::warn!("device enumeration is not available on this platform; pass a device path");
        Ok(Vec::new())
    }
}

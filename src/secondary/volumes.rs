//! Volume discovery
//!
//! The mirror must live on a different physical disk than the primary
//! database. On Linux the mounted volumes come from `/proc/self/mounts`, and
//! each partition is mapped to its parent disk through `/sys/class/block`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One mounted volume
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Volume {
    /// Physical disk the volume lives on (e.g. `sda`)
    pub disk: String,
    /// Block device name of the partition (e.g. `sda1`)
    pub device: String,
    pub mount_point: PathBuf,
}

/// Source of the currently mounted volumes
pub trait VolumeSource: Send + Sync {
    fn volumes(&self) -> io::Result<Vec<Volume>>;
}

/// Volumes from procfs and sysfs
#[derive(Debug, Clone)]
pub struct SysfsVolumeSource {
    mounts: PathBuf,
    sys_block: PathBuf,
}

impl Default for SysfsVolumeSource {
    fn default() -> Self {
        Self {
            mounts: PathBuf::from("/proc/self/mounts"),
            sys_block: PathBuf::from("/sys/class/block"),
        }
    }
}

impl SysfsVolumeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from alternative roots
    pub fn with_roots(mounts: impl Into<PathBuf>, sys_block: impl Into<PathBuf>) -> Self {
        Self {
            mounts: mounts.into(),
            sys_block: sys_block.into(),
        }
    }

    /// Parent disk of a partition; a whole disk maps to itself
    fn disk_of(&self, device: &str) -> String {
        let entry = self.sys_block.join(device);
        if entry.join("partition").exists() {
            if let Ok(target) = fs::canonicalize(&entry) {
                if let Some(parent) = target
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                {
                    return parent.to_string();
                }
            }
        }
        device.to_string()
    }
}

impl VolumeSource for SysfsVolumeSource {
    fn volumes(&self) -> io::Result<Vec<Volume>> {
        let content = fs::read_to_string(&self.mounts)?;
        let mut volumes: Vec<Volume> = parse_mounts(&content)
            .into_iter()
            .map(|(device, mount_point)| Volume {
                disk: self.disk_of(&device),
                device,
                mount_point,
            })
            .collect();
        volumes.sort();
        Ok(volumes)
    }
}

/// `(device name, mount point)` of every `/dev/*` mount
pub fn parse_mounts(content: &str) -> Vec<(String, PathBuf)> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let source = parts.next()?;
            let target = parts.next()?;
            let device = source.strip_prefix("/dev/")?;
            if device.is_empty() || device.contains('/') {
                return None;
            }
            Some((device.to_string(), PathBuf::from(unescape_mount(target))))
        })
        .collect()
}

/// Undo the octal escapes the kernel applies to mount paths
fn unescape_mount(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(code) = u8::from_str_radix(digits, 8) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Volume hosting `path`: the longest mount point that prefixes it
pub fn host_volume<'a>(volumes: &'a [Volume], path: &Path) -> Option<&'a Volume> {
    volumes
        .iter()
        .filter(|v| path.starts_with(&v.mount_point))
        .max_by_key(|v| v.mount_point.components().count())
}

/// First volume on a different disk than the one hosting `primary`
pub fn find_secondary<'a>(volumes: &'a [Volume], primary: &Path) -> Option<&'a Volume> {
    let host = host_volume(volumes, primary)?;
    volumes.iter().find(|v| v.disk != host.disk)
}

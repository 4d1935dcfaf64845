//! Secondary storage (mirror) subsystem
//!
//! Keeps an allow-listed set of database files mirrored on a second
//! physical medium and repairs one-sided damage at startup.

mod checksum;
mod errors;
mod manager;
mod volumes;

pub use checksum::{compute_checksum, file_checksum, files_match};
pub use errors::{SecondaryResult, SecondaryStorageError};
pub use manager::{MirrorPaths, MirrorStatus, SecondaryStorageManager};
pub use volumes::{find_secondary, host_volume, parse_mounts, SysfsVolumeSource, Volume, VolumeSource};

//! Storage driver interface and registry
//!
//! A driver exposes up to three capability sets. Each accessor returns a
//! [`Capability`]; drivers that lack a set return `Capability::NotSupported`
//! and callers turn that into [`Error::NotSupported`] with [`Capability::require`].

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Operation options, keyed by the `OPT_*` constants
pub type Opts = HashMap<String, String>;

/// Attribute map returned by info and list operations
pub type Info = HashMap<String, String>;

pub const OPT_MOUNT_POINT: &str = "MountPoint";
pub const OPT_SIZE: &str = "Size";
pub const OPT_VOLUME_NAME: &str = "VolumeName";
pub const OPT_VOLUME_UUID: &str = "VolumeUUID";
pub const OPT_VOLUME_DRIVER_ID: &str = "VolumeDriverID";
pub const OPT_VOLUME_CREATED_TIME: &str = "VolumeCreatedAt";
pub const OPT_SNAPSHOT_NAME: &str = "SnapshotName";
pub const OPT_SNAPSHOT_CREATED_TIME: &str = "SnapshotCreatedAt";
pub const OPT_BACKUP_URL: &str = "BackupURL";
pub const OPT_REFERENCE_ONLY: &str = "ReferenceOnly";
pub const OPT_PREPARE_FOR_VM: &str = "PrepareForVM";

/// Filesystem created on volumes the driver formats
pub const DEFAULT_FILESYSTEM: &str = "ext4";

pub trait VolumeOps: Send + Sync {
    /// `AlreadyExists` if `id` is taken
    fn create_volume(&self, id: &str, opts: &Opts) -> Result<()>;

    /// `Busy` while mounted, `HasChildren` while snapshots exist
    fn delete_volume(&self, id: &str, opts: &Opts) -> Result<()>;

    /// Mount and return the mount point; mounting twice returns the same path
    fn mount_volume(&self, id: &str, opts: &Opts) -> Result<String>;

    fn umount_volume(&self, id: &str) -> Result<()>;

    /// Current mount point, empty when not mounted
    fn mount_point(&self, id: &str) -> Result<String>;

    fn get_volume_info(&self, id: &str) -> Result<Info>;

    fn list_volumes(&self, opts: &Opts) -> Result<HashMap<String, Info>>;
}

pub trait SnapshotOps: Send + Sync {
    /// `AlreadyExists` if the volume already has snapshot `id`
    fn create_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;

    fn delete_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;

    fn get_snapshot_info(&self, id: &str, volume_id: &str) -> Result<Info>;

    fn list_snapshots(&self, opts: &Opts) -> Result<HashMap<String, Info>>;
}

pub trait BackupOps: Send + Sync {
    /// Back up snapshot `snapshot_id` to `dest_url`, returning the backup URL
    fn create_backup(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        dest_url: &str,
        opts: &Opts,
    ) -> Result<String>;

    fn delete_backup(&self, backup_url: &str) -> Result<()>;

    fn get_backup_info(&self, backup_url: &str) -> Result<Info>;

    fn list_backups(&self, dest_url: &str, opts: &Opts) -> Result<HashMap<String, Info>>;
}

/// Whether a driver provides a capability set
pub enum Capability<'a, T: ?Sized> {
    Supported(&'a T),
    NotSupported,
}

impl<'a, T: ?Sized> Capability<'a, T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported(_))
    }

    /// The ops, or `NotSupported` naming the driver and capability
    pub fn require(self, driver: &str, capability: &str) -> Result<&'a T> {
        match self {
            Capability::Supported(ops) => Ok(ops),
            Capability::NotSupported => Err(Error::not_supported(driver, capability)),
        }
    }
}

pub trait ConvoyDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Driver-level attributes (pool, defaults, ...)
    fn info(&self) -> Result<Info>;

    fn volume_ops(&self) -> Capability<'_, dyn VolumeOps>;

    fn snapshot_ops(&self) -> Capability<'_, dyn SnapshotOps> {
        Capability::NotSupported
    }

    fn backup_ops(&self) -> Capability<'_, dyn BackupOps> {
        Capability::NotSupported
    }

    /// Release kernel resources held by the driver
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn volumes(&self) -> Result<&dyn VolumeOps> {
        self.volume_ops().require(self.name(), "volume")
    }

    fn snapshots(&self) -> Result<&dyn SnapshotOps> {
        self.snapshot_ops().require(self.name(), "snapshot")
    }

    fn backups(&self) -> Result<&dyn BackupOps> {
        self.backup_ops().require(self.name(), "backup")
    }
}

/// Builds a driver whose state lives in `root`
pub type InitFn = fn(&Path, &Opts) -> Result<Box<dyn ConvoyDriver>>;

pub struct DriverEntry {
    pub name: &'static str,
    pub init: InitFn,
}

pub static DRIVERS: &[DriverEntry] = &[
    DriverEntry {
        name: crate::devmapper::DRIVER_NAME,
        init: crate::devmapper::init,
    },
    DriverEntry {
        name: crate::vfs::DRIVER_NAME,
        init: crate::vfs::init,
    },
    DriverEntry {
        name: crate::digitalocean::DRIVER_NAME,
        init: crate::digitalocean::init,
    },
    DriverEntry {
        name: crate::longhorn::DRIVER_NAME,
        init: crate::longhorn::init,
    },
];

pub fn is_registered(name: &str) -> bool {
    DRIVERS.iter().any(|d| d.name == name)
}

/// Initialise driver `name` in `<root>/<name>`
pub fn get_driver(name: &str, root: &Path, opts: &Opts) -> Result<Box<dyn ConvoyDriver>> {
    let entry = DRIVERS
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| Error::InvalidArgument(format!("driver {} is not supported", name)))?;

    let driver_root = root.join(name);
    std::fs::create_dir_all(&driver_root)?;
    log::info!("Initializing driver {} in {}", name, driver_root.display());
    (entry.init)(&driver_root, opts)
}

pub fn opt<'a>(opts: &'a Opts, key: &str) -> &'a str {
    opts.get(key).map(String::as_str).unwrap_or("")
}

pub fn opt_bool(opts: &Opts, key: &str) -> bool {
    opt(opts, key).eq_ignore_ascii_case("true")
}

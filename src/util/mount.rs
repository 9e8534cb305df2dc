//! Mounting volumes into the host mount namespace
//!
//! Kernel mounts go through a [`Mounter`] so drivers can be exercised without
//! privileges. [`SystemMounter`] shells out to `mount`/`umount`/`mkfs`,
//! entering the configured mount namespace with `nsenter` when one is set.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::execute;
use crate::error::{Error, Result};

static MOUNT_NAMESPACE_FD: RwLock<Option<String>> = RwLock::new(None);

/// Use the mount namespace behind `fd` (e.g. `/proc/1/ns/mnt`) for mount commands
pub fn init_mount_namespace(fd: &str) -> Result<()> {
    let value = if fd.is_empty() {
        None
    } else {
        if !Path::new(fd).exists() {
            return Err(Error::InvalidArgument(format!(
                "mount namespace fd {} does not exist",
                fd
            )));
        }
        Some(fd.to_string())
    };
    if let Ok(mut ns) = MOUNT_NAMESPACE_FD.write() {
        *ns = value;
    }
    Ok(())
}

fn mount_namespace() -> Option<String> {
    MOUNT_NAMESPACE_FD.read().ok().and_then(|ns| ns.clone())
}

/// Run a command inside the configured mount namespace
pub fn execute_in_namespace(binary: &str, args: &[&str]) -> Result<String> {
    match mount_namespace() {
        Some(fd) => {
            let ns_arg = format!("--mount={}", fd);
            let mut full: Vec<&str> = vec![ns_arg.as_str(), binary];
            full.extend_from_slice(args);
            execute("nsenter", &full)
        }
        None => execute(binary, args),
    }
}

/// Kernel mount operations
pub trait Mounter: Send + Sync {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool>;
    fn mount(&self, device: &str, mount_point: &Path, opts: &[String]) -> Result<()>;
    fn umount(&self, mount_point: &Path) -> Result<()>;
    /// Create a filesystem of type `fs_type` on `device`
    fn format(&self, device: &str, fs_type: &str) -> Result<()>;
}

/// Mounter backed by the host's `mount` tools
#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        let output = execute_in_namespace("mount", &[])?;
        let needle = format!(" on {} ", mount_point.display());
        Ok(output.lines().any(|line| line.contains(&needle)))
    }

    fn mount(&self, device: &str, mount_point: &Path, opts: &[String]) -> Result<()> {
        let mp = super::path_str(mount_point)?;
        let mut args: Vec<&str> = opts.iter().map(String::as_str).collect();
        args.push(device);
        args.push(mp);
        execute_in_namespace("mount", &args)?;
        Ok(())
    }

    fn umount(&self, mount_point: &Path) -> Result<()> {
        execute_in_namespace("umount", &[super::path_str(mount_point)?])?;
        Ok(())
    }

    fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        execute("mkfs", &["-t", fs_type, device])?;
        Ok(())
    }
}

pub fn system() -> Arc<dyn Mounter> {
    Arc::new(SystemMounter)
}

/// Mounter that only tracks state in memory
#[derive(Debug, Default)]
pub struct MemoryMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    formatted: Mutex<Vec<String>>,
}

impl MemoryMounter {
    pub fn formatted(&self) -> Vec<String> {
        self.formatted.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl Mounter for MemoryMounter {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        Ok(self
            .mounted
            .lock()
            .map(|m| m.contains(mount_point))
            .unwrap_or(false))
    }

    fn mount(&self, _device: &str, mount_point: &Path, _opts: &[String]) -> Result<()> {
        if let Ok(mut m) = self.mounted.lock() {
            m.insert(mount_point.to_path_buf());
        }
        Ok(())
    }

    fn umount(&self, mount_point: &Path) -> Result<()> {
        if let Ok(mut m) = self.mounted.lock() {
            m.remove(mount_point);
        }
        Ok(())
    }

    fn format(&self, device: &str, _fs_type: &str) -> Result<()> {
        if let Ok(mut f) = self.formatted.lock() {
            f.push(device.to_string());
        }
        Ok(())
    }
}

/// A volume that can be mounted at a host path
pub trait MountableVolume {
    fn name(&self) -> &str;
    fn device(&self) -> Result<String>;
    fn mount_point(&self) -> &str;
    fn set_mount_point(&mut self, mount_point: String);
    /// Root of the owning driver; default mount points live in `<root>/mounts`
    fn driver_root(&self) -> &Path;

    fn mount_opts(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_mount_point(&self) -> PathBuf {
        self.driver_root().join("mounts").join(self.name())
    }
}

/// Mount `volume` at `mount_point` (or its default), returning the path used.
///
/// Mounting an already mounted volume at the same place is a no-op; asking
/// for a different place is `Busy`.
pub fn volume_mount<V: MountableVolume>(
    mounter: &dyn Mounter,
    volume: &mut V,
    mount_point: Option<&str>,
) -> Result<String> {
    let device = volume.device()?;
    let target = match mount_point {
        Some(mp) if !mp.is_empty() => PathBuf::from(mp),
        _ if !volume.mount_point().is_empty() => PathBuf::from(volume.mount_point()),
        _ => volume.default_mount_point(),
    };
    let target_str = super::path_str(&target)?.to_string();

    let existing = volume.mount_point();
    if !existing.is_empty() && existing != target_str {
        return Err(Error::Busy(format!(
            "volume {} already mounted at {}",
            volume.name(),
            existing
        )));
    }

    fs::create_dir_all(&target)?;
    if !mounter.is_mounted(&target)? {
        mounter.mount(&device, &target, &volume.mount_opts())?;
        log::info!("Mounted {} at {}", device, target_str);
    }
    volume.set_mount_point(target_str.clone());
    Ok(target_str)
}

/// Unmount `volume`; a volume with no mount point is left alone
pub fn volume_umount<V: MountableVolume>(mounter: &dyn Mounter, volume: &mut V) -> Result<()> {
    let mount_point = volume.mount_point().to_string();
    if mount_point.is_empty() {
        log::debug!("Volume {} is not mounted", volume.name());
        return Ok(());
    }

    let path = PathBuf::from(&mount_point);
    if mounter.is_mounted(&path)? {
        mounter.umount(&path)?;
    }
    if path == volume.default_mount_point() {
        if let Err(e) = fs::remove_dir(&path) {
            log::warn!("Cannot remove mount point {}: {}", mount_point, e);
        }
    }
    volume.set_mount_point(String::new());
    log::info!("Unmounted volume {} from {}", volume.name(), mount_point);
    Ok(())
}

//! Directory-backed volumes
//!
//! Each volume is a directory under the configured base path, so "mounting"
//! just hands out that directory. Snapshots are tarballs of the directory and
//! backups upload the tarball as a single file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::driver::{
    opt, opt_bool, BackupOps, Capability, ConvoyDriver, Info, Opts, SnapshotOps, VolumeOps,
    OPT_BACKUP_URL, OPT_MOUNT_POINT, OPT_PREPARE_FOR_VM, OPT_REFERENCE_ONLY, OPT_SIZE,
    OPT_SNAPSHOT_CREATED_TIME, OPT_VOLUME_CREATED_TIME, OPT_VOLUME_NAME, OPT_VOLUME_UUID,
};
use crate::error::{Error, Result};
use crate::objectstore::{self, SnapshotInfo, VolumeInfo};
use crate::store::{self, Record};
use crate::util::{self, path_str};

pub const DRIVER_NAME: &str = "vfs";

const VFS_PATH: &str = "vfs.path";
const VFS_DEFAULT_VOLUME_SIZE: &str = "vfs.defaultvolumesize";
const DEFAULT_VOLUME_SIZE: &str = "100G";

const SNAPSHOT_DIR: &str = "snapshots";
/// Image file handed to VMs inside a volume prepared for one
const VM_IMAGE_FILE: &str = "disk.img";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub root: String,
    pub path: String,
    pub default_volume_size: i64,
}

impl Record for Device {
    const PREFIX: &'static str = DRIVER_NAME;
    const SUFFIX: &'static str = ".cfg";

    fn id(&self) -> &str {
        ""
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "VolumeUUID")]
    pub volume_uuid: String,
    pub file_path: String,
    pub created_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub name: String,
    pub size: i64,
    pub path: String,
    pub mount_point: String,
    #[serde(rename = "PrepareForVM")]
    pub prepare_for_vm: bool,
    pub created_time: String,
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl Record for Volume {
    const PREFIX: &'static str = "vfs_volume_";
    const SUFFIX: &'static str = ".json";

    fn id(&self) -> &str {
        &self.uuid
    }
}

pub struct VfsDriver {
    root: PathBuf,
    device: RwLock<Device>,
}

pub fn init(root: &Path, opts: &Opts) -> Result<Box<dyn ConvoyDriver>> {
    Ok(Box::new(VfsDriver::new(root, opts)?))
}

impl VfsDriver {
    pub fn new(root: &Path, opts: &Opts) -> Result<Self> {
        let mut device = if store::exists::<Device>(root, "") {
            store::load::<Device>(root, "")?
        } else {
            let path = util::require_opt(opts, VFS_PATH)?;
            fs::create_dir_all(path)?;
            Device {
                root: path_str(root)?.to_string(),
                path: path.to_string(),
                default_volume_size: 0,
            }
        };

        if device.default_volume_size == 0 {
            let size = util::parse_size(match opt(opts, VFS_DEFAULT_VOLUME_SIZE) {
                "" => DEFAULT_VOLUME_SIZE,
                s => s,
            })?;
            if size <= 0 {
                return Err(Error::InvalidArgument(format!(
                    "illegal default volume size {}",
                    size
                )));
            }
            device.default_volume_size = size;
        }
        store::save(root, &device)?;
        log::debug!("vfs driver serving volumes under {}", device.path);

        Ok(Self {
            root: root.to_path_buf(),
            device: RwLock::new(device),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Device>> {
        self.device
            .read()
            .map_err(|_| Error::Backend("vfs driver lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Device>> {
        self.device
            .write()
            .map_err(|_| Error::Backend("vfs driver lock poisoned".into()))
    }

    fn load_volume(&self, id: &str) -> Result<Volume> {
        match store::load::<Volume>(&self.root, id) {
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("volume {}", id))),
            other => other,
        }
    }

    fn snapshot_file(&self, snapshot_id: &str, volume_id: &str) -> PathBuf {
        self.root
            .join(SNAPSHOT_DIR)
            .join(format!("{}_{}.tar.gz", volume_id, snapshot_id))
    }

    fn volume_info(volume: &Volume) -> Info {
        let size = if volume.prepare_for_vm { volume.size } else { 0 };
        HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Name".to_string(), volume.name.clone()),
            ("Path".to_string(), volume.path.clone()),
            (OPT_MOUNT_POINT.to_string(), volume.mount_point.clone()),
            (OPT_SIZE.to_string(), size.to_string()),
            (OPT_PREPARE_FOR_VM.to_string(), volume.prepare_for_vm.to_string()),
            ("CreatedTime".to_string(), volume.created_time.clone()),
        ])
    }

    fn snapshot_info(snapshot: &Snapshot) -> Info {
        HashMap::from([
            ("UUID".to_string(), snapshot.uuid.clone()),
            ("VolumeUUID".to_string(), snapshot.volume_uuid.clone()),
            ("FilePath".to_string(), snapshot.file_path.clone()),
            ("CreatedTime".to_string(), snapshot.created_time.clone()),
        ])
    }

    fn check_backup_driver(backup_url: &str) -> Result<()> {
        let volume = objectstore::load_volume(backup_url)?;
        if volume.driver != DRIVER_NAME {
            return Err(Error::InvalidArgument(format!(
                "backup {} belongs to driver {}, not {}",
                backup_url, volume.driver, DRIVER_NAME
            )));
        }
        Ok(())
    }

    fn restore_into(backup_url: &str, dir: &Path) -> Result<()> {
        let file = objectstore::restore_single_file_backup(backup_url, dir)?;
        let result = util::decompress_dir(&file, dir);
        if let Err(e) = fs::remove_file(&file) {
            log::warn!("Cannot remove downloaded backup {}: {}", file.display(), e);
        }
        result
    }
}

/// Create the sparse image file a VM volume exposes
fn prepare_image_file(mount_point: &str, size: i64) -> Result<()> {
    let image = Path::new(mount_point).join(VM_IMAGE_FILE);
    if image.exists() {
        return Ok(());
    }
    let file = fs::File::create(&image)?;
    file.set_len(size as u64)?;
    log::debug!("Prepared {} bytes image {}", size, image.display());
    Ok(())
}

impl ConvoyDriver for VfsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<Info> {
        let dev = self.read()?;
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Root".to_string(), dev.root.clone()),
            ("Path".to_string(), dev.path.clone()),
            ("DefaultVolumeSize".to_string(), dev.default_volume_size.to_string()),
        ]))
    }

    fn volume_ops(&self) -> Capability<'_, dyn VolumeOps> {
        Capability::Supported(self)
    }

    fn snapshot_ops(&self) -> Capability<'_, dyn SnapshotOps> {
        Capability::Supported(self)
    }

    fn backup_ops(&self) -> Capability<'_, dyn BackupOps> {
        Capability::Supported(self)
    }
}

impl VolumeOps for VfsDriver {
    fn create_volume(&self, id: &str, opts: &Opts) -> Result<()> {
        let dev = self.write()?;

        let backup_url = opt(opts, OPT_BACKUP_URL);
        if !backup_url.is_empty() {
            Self::check_backup_driver(backup_url)?;
        }
        if store::exists::<Volume>(&self.root, id) {
            return Err(Error::AlreadyExists(format!("volume {}", id)));
        }

        let name = match opt(opts, OPT_VOLUME_NAME) {
            "" => format!("volume-{}", id.get(..8).unwrap_or(id)),
            n => n.to_string(),
        };
        let prepare_for_vm = opt_bool(opts, OPT_PREPARE_FOR_VM);
        let size = if prepare_for_vm {
            match util::parse_size(opt(opts, OPT_SIZE))? {
                0 => dev.default_volume_size,
                s => s,
            }
        } else {
            0
        };

        let path = Path::new(&dev.path).join(&name);
        if path.exists() && !backup_url.is_empty() {
            return Err(Error::AlreadyExists(format!(
                "cannot restore into existing directory {}",
                path.display()
            )));
        }
        fs::create_dir_all(&path)?;

        if !backup_url.is_empty() {
            if let Err(e) = Self::restore_into(backup_url, &path) {
                if let Err(rm) = fs::remove_dir_all(&path) {
                    log::warn!("Rollback: cannot remove {}: {}", path.display(), rm);
                }
                return Err(e);
            }
        }

        let volume = Volume {
            uuid: id.to_string(),
            name,
            size,
            path: path_str(&path)?.to_string(),
            mount_point: String::new(),
            prepare_for_vm,
            created_time: util::now(),
            snapshots: BTreeMap::new(),
        };
        store::save(&self.root, &volume)?;
        log::info!("Created vfs volume {} at {}", id, volume.path);
        Ok(())
    }

    fn delete_volume(&self, id: &str, opts: &Opts) -> Result<()> {
        let _dev = self.write()?;
        let volume = self.load_volume(id)?;
        if !volume.mount_point.is_empty() {
            return Err(Error::Busy(format!(
                "volume {} is mounted at {}",
                id, volume.mount_point
            )));
        }
        if !volume.snapshots.is_empty() {
            return Err(Error::HasChildren(format!(
                "volume {} still has {} snapshot(s)",
                id,
                volume.snapshots.len()
            )));
        }

        if opt_bool(opts, OPT_REFERENCE_ONLY) {
            log::info!("Keeping {} of volume {} (reference only)", volume.path, id);
        } else {
            log::debug!("Cleaning up {} for volume {}", volume.path, id);
            match fs::remove_dir_all(&volume.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        store::delete::<Volume>(&self.root, id)?;
        log::info!("Deleted vfs volume {}", id);
        Ok(())
    }

    fn mount_volume(&self, id: &str, opts: &Opts) -> Result<String> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        if !opt(opts, OPT_MOUNT_POINT).is_empty() {
            return Err(Error::InvalidArgument(
                "vfs volumes cannot be mounted at a specified mount point".into(),
            ));
        }
        if volume.mount_point.is_empty() {
            volume.mount_point = volume.path.clone();
        }
        if volume.prepare_for_vm {
            prepare_image_file(&volume.mount_point, volume.size)?;
        }
        store::save(&self.root, &volume)?;
        Ok(volume.mount_point)
    }

    fn umount_volume(&self, id: &str) -> Result<()> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        volume.mount_point.clear();
        store::save(&self.root, &volume)
    }

    fn mount_point(&self, id: &str) -> Result<String> {
        let _dev = self.read()?;
        Ok(self.load_volume(id)?.mount_point)
    }

    fn get_volume_info(&self, id: &str) -> Result<Info> {
        let _dev = self.read()?;
        Ok(Self::volume_info(&self.load_volume(id)?))
    }

    fn list_volumes(&self, _opts: &Opts) -> Result<HashMap<String, Info>> {
        let _dev = self.read()?;
        let mut result = HashMap::new();
        for id in store::list_ids::<Volume>(&self.root)? {
            let volume = self.load_volume(&id)?;
            result.insert(id, Self::volume_info(&volume));
        }
        Ok(result)
    }
}

impl SnapshotOps for VfsDriver {
    fn create_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(volume_id)?;
        if volume.snapshots.contains_key(id) {
            return Err(Error::AlreadyExists(format!(
                "snapshot {} of volume {}",
                id, volume_id
            )));
        }

        let file = self.snapshot_file(id, volume_id);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        util::compress_dir(Path::new(&volume.path), &file)?;

        volume.snapshots.insert(
            id.to_string(),
            Snapshot {
                uuid: id.to_string(),
                volume_uuid: volume_id.to_string(),
                file_path: path_str(&file)?.to_string(),
                created_time: util::now(),
            },
        );
        store::save(&self.root, &volume)?;
        log::info!("Created snapshot {} of volume {}", id, volume_id);
        Ok(())
    }

    fn delete_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(volume_id)?;
        let snapshot = volume.snapshots.remove(id).ok_or_else(|| {
            Error::NotFound(format!("snapshot {} of volume {}", id, volume_id))
        })?;
        fs::remove_file(&snapshot.file_path)?;
        store::save(&self.root, &volume)?;
        log::info!("Deleted snapshot {} of volume {}", id, volume_id);
        Ok(())
    }

    fn get_snapshot_info(&self, id: &str, volume_id: &str) -> Result<Info> {
        let _dev = self.read()?;
        let volume = self.load_volume(volume_id)?;
        volume
            .snapshots
            .get(id)
            .map(Self::snapshot_info)
            .ok_or_else(|| Error::NotFound(format!("snapshot {} of volume {}", id, volume_id)))
    }

    fn list_snapshots(&self, opts: &Opts) -> Result<HashMap<String, Info>> {
        let _dev = self.read()?;
        let ids = match opt(opts, OPT_VOLUME_UUID) {
            "" => store::list_ids::<Volume>(&self.root)?,
            id => vec![id.to_string()],
        };
        let mut result = HashMap::new();
        for id in ids {
            for (snap_id, snapshot) in &self.load_volume(&id)?.snapshots {
                result.insert(snap_id.clone(), Self::snapshot_info(snapshot));
            }
        }
        Ok(result)
    }
}

impl BackupOps for VfsDriver {
    fn create_backup(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        dest_url: &str,
        opts: &Opts,
    ) -> Result<String> {
        let _dev = self.write()?;
        let volume = self.load_volume(volume_id)?;
        let snapshot = volume.snapshots.get(snapshot_id).ok_or_else(|| {
            Error::NotFound(format!("snapshot {} of volume {}", snapshot_id, volume_id))
        })?;

        let volume_info = VolumeInfo {
            name: volume_id.to_string(),
            driver: DRIVER_NAME.to_string(),
            size: volume.size,
            created_time: match opt(opts, OPT_VOLUME_CREATED_TIME) {
                "" => volume.created_time.clone(),
                t => t.to_string(),
            },
        };
        let snapshot_info = SnapshotInfo {
            name: snapshot_id.to_string(),
            created_time: match opt(opts, OPT_SNAPSHOT_CREATED_TIME) {
                "" => snapshot.created_time.clone(),
                t => t.to_string(),
            },
        };
        objectstore::create_single_file_backup(
            &volume_info,
            &snapshot_info,
            Path::new(&snapshot.file_path),
            dest_url,
        )
    }

    fn delete_backup(&self, backup_url: &str) -> Result<()> {
        let _dev = self.write()?;
        Self::check_backup_driver(backup_url)?;
        objectstore::delete_single_file_backup(backup_url)
    }

    fn get_backup_info(&self, backup_url: &str) -> Result<Info> {
        Self::check_backup_driver(backup_url)?;
        objectstore::get_backup_info(backup_url)
    }

    fn list_backups(&self, dest_url: &str, opts: &Opts) -> Result<HashMap<String, Info>> {
        objectstore::list(Some(opt(opts, OPT_VOLUME_UUID)), dest_url, DRIVER_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(dir: &TempDir) -> Result<VfsDriver> {
        let root = dir.path().join("root");
        fs::create_dir_all(&root)?;
        let opts = Opts::from([(
            VFS_PATH.to_string(),
            dir.path().join("volumes").display().to_string(),
        )]);
        VfsDriver::new(&root, &opts)
    }

    fn named(name: &str) -> Opts {
        Opts::from([(OPT_VOLUME_NAME.to_string(), name.to_string())])
    }

    #[test]
    fn test_init_requires_path() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            VfsDriver::new(dir.path(), &Opts::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_config_survives_restart() -> Result<()> {
        let dir = TempDir::new()?;
        let first = driver(&dir)?.info()?;
        // Options are ignored once the config exists
        let again = VfsDriver::new(&dir.path().join("root"), &Opts::new())?;
        assert_eq!(again.info()?, first);
        assert_eq!(first["DefaultVolumeSize"], (100i64 << 30).to_string());
        Ok(())
    }

    #[test]
    fn test_volume_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let driver = driver(&dir)?;

        driver.create_volume("0123456789abcdef", &Opts::new())?;
        let info = driver.get_volume_info("0123456789abcdef")?;
        assert_eq!(info["Name"], "volume-01234567");
        assert!(Path::new(&info["Path"]).is_dir());
        assert!(matches!(
            driver.create_volume("0123456789abcdef", &Opts::new()),
            Err(Error::AlreadyExists(_))
        ));

        let mp = driver.mount_volume("0123456789abcdef", &Opts::new())?;
        assert_eq!(mp, info["Path"]);
        assert_eq!(driver.mount_volume("0123456789abcdef", &Opts::new())?, mp);
        let at = Opts::from([(OPT_MOUNT_POINT.to_string(), "/mnt/x".to_string())]);
        assert!(driver.mount_volume("0123456789abcdef", &at).is_err());
        assert!(matches!(
            driver.delete_volume("0123456789abcdef", &Opts::new()),
            Err(Error::Busy(_))
        ));

        driver.umount_volume("0123456789abcdef")?;
        driver.delete_volume("0123456789abcdef", &Opts::new())?;
        assert!(!Path::new(&info["Path"]).exists());
        assert!(driver.list_volumes(&Opts::new())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_reference_only_delete_keeps_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let driver = driver(&dir)?;
        driver.create_volume("vol1", &named("kept"))?;
        let path = driver.get_volume_info("vol1")?["Path"].clone();

        let opts = Opts::from([(OPT_REFERENCE_ONLY.to_string(), "true".to_string())]);
        driver.delete_volume("vol1", &opts)?;
        assert!(Path::new(&path).is_dir());
        assert!(matches!(
            driver.get_volume_info("vol1"),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_prepare_for_vm_creates_image() -> Result<()> {
        let dir = TempDir::new()?;
        let driver = driver(&dir)?;
        let mut opts = named("vm");
        opts.insert(OPT_PREPARE_FOR_VM.to_string(), "true".to_string());
        opts.insert(OPT_SIZE.to_string(), "1M".to_string());
        driver.create_volume("vol1", &opts)?;

        let mp = driver.mount_volume("vol1", &Opts::new())?;
        assert_eq!(fs::metadata(Path::new(&mp).join(VM_IMAGE_FILE))?.len(), 1 << 20);
        assert_eq!(driver.get_volume_info("vol1")?[OPT_SIZE], (1 << 20).to_string());
        Ok(())
    }

    #[test]
    fn test_snapshot_backup_restore() -> Result<()> {
        let dir = TempDir::new()?;
        let driver = driver(&dir)?;
        let dest = format!("vfs://{}", dir.path().join("backups").display());

        driver.create_volume("vol1", &named("data"))?;
        let path = PathBuf::from(&driver.get_volume_info("vol1")?["Path"]);
        fs::write(path.join("hello.txt"), b"hello")?;

        driver.create_snapshot("snap1", "vol1")?;
        assert!(matches!(
            driver.delete_volume("vol1", &Opts::new()),
            Err(Error::HasChildren(_))
        ));
        let url = driver.create_backup("snap1", "vol1", &dest, &Opts::new())?;
        assert_eq!(driver.get_backup_info(&url)?["SnapshotName"], "snap1");
        assert_eq!(driver.list_backups(&dest, &Opts::new())?.len(), 1);

        let restore = Opts::from([
            (OPT_VOLUME_NAME.to_string(), "restored".to_string()),
            (OPT_BACKUP_URL.to_string(), url.clone()),
        ]);
        driver.create_volume("vol2", &restore)?;
        let restored = PathBuf::from(&driver.get_volume_info("vol2")?["Path"]);
        assert_eq!(fs::read(restored.join("hello.txt"))?, b"hello");
        assert_eq!(fs::read_dir(&restored)?.count(), 1);

        driver.delete_backup(&url)?;
        assert!(driver.list_backups(&dest, &Opts::new())?.is_empty());

        driver.delete_snapshot("snap1", "vol1")?;
        assert!(driver.list_snapshots(&Opts::new())?.is_empty());
        driver.delete_volume("vol1", &Opts::new())?;
        Ok(())
    }
}

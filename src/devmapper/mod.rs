//! Thin-provisioned volumes on a device-mapper thin pool
//!
//! Every volume and snapshot is a thin device in one pool, identified by a
//! device id taken from a persisted, strictly increasing counter. Volumes are
//! active as `/dev/mapper/<uuid>`; snapshots are only activated while a backup
//! reads them.

pub mod backend;
pub mod thin_delta;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::driver::{
    opt, opt_bool, BackupOps, Capability, ConvoyDriver, Info, Opts, SnapshotOps, VolumeOps,
    DEFAULT_FILESYSTEM, OPT_BACKUP_URL, OPT_MOUNT_POINT, OPT_PREPARE_FOR_VM, OPT_SIZE,
    OPT_SNAPSHOT_CREATED_TIME, OPT_VOLUME_CREATED_TIME, OPT_VOLUME_NAME, OPT_VOLUME_UUID,
};
use crate::error::{Error, Result};
use crate::objectstore::{self, DeltaBackupConfig, DeltaBlockOperations, Mappings, SnapshotInfo, VolumeInfo};
use crate::store::{self, Record};
use crate::util::mount::{self, MountableVolume, Mounter};
use crate::util::{self, path_str};

use backend::{DmBackend, DmsetupBackend, DM_DIR, SECTOR_SIZE};

pub const DRIVER_NAME: &str = "devicemapper";

const DEFAULT_THINPOOL_NAME: &str = "convoy-pool";
const DEFAULT_BLOCK_SIZE: &str = "4096";
const DEFAULT_VOLUME_SIZE: &str = "100G";

const DM_DATA_DEV: &str = "dm.datadev";
const DM_METADATA_DEV: &str = "dm.metadatadev";
const DM_THINPOOL_NAME: &str = "dm.thinpoolname";
const DM_THINPOOL_BLOCK_SIZE: &str = "dm.thinpoolblocksize";
const DM_DEFAULT_VOLUME_SIZE: &str = "dm.defaultvolumesize";

/// Thin pool block size bounds, in sectors
const BLOCK_SIZE_MIN: i64 = 128;
const BLOCK_SIZE_MAX: i64 = 2097152;
const BLOCK_SIZE_MULTIPLIER: i64 = 128;

/// Driver record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub root: String,
    pub data_device: String,
    pub metadata_device: String,
    pub thinpool_device: String,
    pub thinpool_size: i64,
    /// In sectors
    pub thinpool_block_size: i64,
    pub default_volume_size: i64,
    #[serde(rename = "LastDevID")]
    pub last_dev_id: u32,
}

impl Record for Device {
    const PREFIX: &'static str = DRIVER_NAME;
    const SUFFIX: &'static str = ".cfg";

    fn id(&self) -> &str {
        ""
    }
}

impl Device {
    fn pool_name(&self) -> &str {
        self.thinpool_device
            .rsplit('/')
            .next()
            .unwrap_or(&self.thinpool_device)
    }

    fn block_bytes(&self) -> i64 {
        self.thinpool_block_size * SECTOR_SIZE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "VolumeUUID")]
    pub volume_uuid: String,
    #[serde(rename = "DevID")]
    pub dev_id: u32,
    pub activated: bool,
    pub created_time: String,
}

/// Volume record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub name: String,
    #[serde(rename = "DevID")]
    pub dev_id: u32,
    pub size: i64,
    pub mount_point: String,
    pub created_time: String,
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl Record for Volume {
    const PREFIX: &'static str = "devicemapper_volume_";
    const SUFFIX: &'static str = ".json";

    fn id(&self) -> &str {
        &self.uuid
    }
}

struct MountTarget<'a> {
    volume: &'a mut Volume,
    root: &'a Path,
    device: String,
}

impl MountableVolume for MountTarget<'_> {
    fn name(&self) -> &str {
        &self.volume.uuid
    }

    fn device(&self) -> Result<String> {
        Ok(self.device.clone())
    }

    fn mount_point(&self) -> &str {
        &self.volume.mount_point
    }

    fn set_mount_point(&mut self, mount_point: String) {
        self.volume.mount_point = mount_point;
    }

    fn driver_root(&self) -> &Path {
        self.root
    }
}

pub struct DevmapperDriver {
    root: PathBuf,
    backend: Arc<dyn DmBackend>,
    mounter: Arc<dyn Mounter>,
    device: RwLock<Device>,
}

pub fn init(root: &Path, opts: &Opts) -> Result<Box<dyn ConvoyDriver>> {
    let backend: Arc<dyn DmBackend> = Arc::new(DmsetupBackend);
    backend.check_environment()?;
    Ok(Box::new(DevmapperDriver::new(root, opts, backend, mount::system())?))
}

fn verify_config(opts: &Opts) -> Result<Device> {
    let data_device = util::require_opt(opts, DM_DATA_DEV)?.to_string();
    let metadata_device = util::require_opt(opts, DM_METADATA_DEV)?.to_string();

    let pool_name = match opt(opts, DM_THINPOOL_NAME) {
        "" => DEFAULT_THINPOOL_NAME,
        name => name,
    };
    let block_size_str = match opt(opts, DM_THINPOOL_BLOCK_SIZE) {
        "" => DEFAULT_BLOCK_SIZE,
        s => s,
    };
    let block_size: i64 = block_size_str.parse().map_err(|_| {
        Error::InvalidArgument(format!("illegal block size {}", block_size_str))
    })?;
    if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&block_size)
        || block_size % BLOCK_SIZE_MULTIPLIER != 0
    {
        return Err(Error::InvalidArgument(format!(
            "block size must be between {} and {} sectors and a multiple of {}, got {}",
            BLOCK_SIZE_MIN, BLOCK_SIZE_MAX, BLOCK_SIZE_MULTIPLIER, block_size
        )));
    }

    let default_volume_size = util::parse_size(match opt(opts, DM_DEFAULT_VOLUME_SIZE) {
        "" => DEFAULT_VOLUME_SIZE,
        s => s,
    })?;
    if default_volume_size <= 0 || default_volume_size % (block_size * SECTOR_SIZE) != 0 {
        return Err(Error::InvalidArgument(format!(
            "default volume size {} is not a multiple of the pool block size",
            default_volume_size
        )));
    }

    Ok(Device {
        data_device,
        metadata_device,
        thinpool_device: format!("{}/{}", DM_DIR, pool_name),
        thinpool_block_size: block_size,
        default_volume_size,
        ..Default::default()
    })
}

fn poisoned() -> Error {
    Error::Backend("devicemapper driver lock poisoned".into())
}

impl DevmapperDriver {
    /// Load the pool from `root`, or create it from `opts` on first use
    pub fn new(
        root: &Path,
        opts: &Opts,
        backend: Arc<dyn DmBackend>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self> {
        let device = if store::exists::<Device>(root, "") {
            let device: Device = store::load(root, "")?;
            log::debug!("Loaded devicemapper config from {}", root.display());
            device
        } else {
            let mut device = verify_config(opts)?;
            device.root = path_str(root)?.to_string();
            device.thinpool_size = backend.device_size(&device.data_device)?;
            backend.create_pool(
                device.pool_name(),
                &device.data_device,
                &device.metadata_device,
                device.thinpool_size,
                device.thinpool_block_size as u32,
            )?;
            store::save(root, &device)?;
            log::info!(
                "Created thin pool {} on {} (block size {} sectors)",
                device.thinpool_device,
                device.data_device,
                device.thinpool_block_size
            );
            device
        };

        let driver = Self {
            root: root.to_path_buf(),
            backend,
            mounter,
            device: RwLock::new(device),
        };
        driver.activate_pool()?;
        Ok(driver)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Device>> {
        self.device.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Device>> {
        self.device.write().map_err(|_| poisoned())
    }

    /// Recreate the pool after a reboot and reactivate volume devices
    fn activate_pool(&self) -> Result<()> {
        let dev = self.write()?;
        if !self.backend.pool_exists(dev.pool_name()) {
            self.backend.create_pool(
                dev.pool_name(),
                &dev.data_device,
                &dev.metadata_device,
                dev.thinpool_size,
                dev.thinpool_block_size as u32,
            )?;
            log::info!("Reinitialized existing pool {}", dev.thinpool_device);
        }

        for id in store::list_ids::<Volume>(&self.root)? {
            let mut volume: Volume = store::load(&self.root, &id)?;
            if !self.backend.device_path(&id).exists() {
                self.backend
                    .activate_device(dev.pool_name(), &id, volume.dev_id, volume.size)?;
                log::debug!("Reactivated volume device {}", id);
            }

            let mut stale = false;
            for (snap_id, snapshot) in volume.snapshots.iter_mut() {
                if snapshot.activated && !self.backend.device_path(snap_id).exists() {
                    log::warn!(
                        "Snapshot {} of volume {} was recorded active but has no device",
                        snap_id,
                        id
                    );
                    snapshot.activated = false;
                    stale = true;
                }
            }
            if stale {
                store::save(&self.root, &volume)?;
            }
        }
        Ok(())
    }

    fn allocate_dev_id(&self, dev: &mut Device) -> Result<u32> {
        dev.last_dev_id += 1;
        store::save(&self.root, &*dev)?;
        log::debug!("Allocated device id {}", dev.last_dev_id);
        Ok(dev.last_dev_id)
    }

    fn load_volume(&self, id: &str) -> Result<Volume> {
        match store::load::<Volume>(&self.root, id) {
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("volume {}", id))),
            other => other,
        }
    }

    fn volume_device(&self, id: &str) -> Result<String> {
        Ok(path_str(&self.backend.device_path(id))?.to_string())
    }

    fn snapshot_of(volume: &Volume, snapshot_id: &str) -> Result<Snapshot> {
        volume.snapshots.get(snapshot_id).cloned().ok_or_else(|| {
            Error::NotFound(format!("snapshot {} of volume {}", snapshot_id, volume.uuid))
        })
    }

    fn volume_info(&self, volume: &Volume) -> Result<Info> {
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("UUID".to_string(), volume.uuid.clone()),
            ("Name".to_string(), volume.name.clone()),
            ("DevID".to_string(), volume.dev_id.to_string()),
            ("Size".to_string(), volume.size.to_string()),
            ("MountPoint".to_string(), volume.mount_point.clone()),
            ("Device".to_string(), self.volume_device(&volume.uuid)?),
            ("CreatedTime".to_string(), volume.created_time.clone()),
            ("Snapshots".to_string(), volume.snapshots.len().to_string()),
        ]))
    }

    fn snapshot_info(volume: &Volume, snapshot: &Snapshot) -> Info {
        HashMap::from([
            ("UUID".to_string(), snapshot.uuid.clone()),
            ("VolumeUUID".to_string(), volume.uuid.clone()),
            ("DevID".to_string(), snapshot.dev_id.to_string()),
            ("Activated".to_string(), snapshot.activated.to_string()),
            ("Size".to_string(), volume.size.to_string()),
            ("CreatedTime".to_string(), snapshot.created_time.clone()),
        ])
    }

    /// Deactivate and free a half-created volume device
    fn rollback_device(&self, dev: &Device, id: &str, dev_id: u32, activated: bool) {
        if activated {
            if let Err(e) = self.backend.deactivate_device(id) {
                log::warn!("Rollback: cannot deactivate {}: {}", id, e);
            }
        }
        if let Err(e) = self.backend.delete_device(dev.pool_name(), dev_id) {
            log::warn!("Rollback: cannot delete device {} of {}: {}", dev_id, id, e);
        } else {
            log::info!("Rolled back device {} of volume {}", dev_id, id);
        }
    }

    fn restore_or_format(&self, id: &str, backup_url: &str, prepare_for_vm: bool) -> Result<()> {
        let device = self.volume_device(id)?;
        if !backup_url.is_empty() {
            objectstore::restore_delta_block_backup(backup_url, Path::new(&device))
        } else if !prepare_for_vm {
            self.mounter.format(&device, DEFAULT_FILESYSTEM)
        } else {
            Ok(())
        }
    }
}

impl ConvoyDriver for DevmapperDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<Info> {
        let dev = self.read()?;
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Root".to_string(), dev.root.clone()),
            ("DataDevice".to_string(), dev.data_device.clone()),
            ("MetadataDevice".to_string(), dev.metadata_device.clone()),
            ("ThinpoolDevice".to_string(), dev.thinpool_device.clone()),
            ("ThinpoolSize".to_string(), dev.thinpool_size.to_string()),
            ("ThinpoolBlockSize".to_string(), dev.block_bytes().to_string()),
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

    fn shutdown(&self) -> Result<()> {
        let dev = self.write()?;
        for id in store::list_ids::<Volume>(&self.root)? {
            self.backend.deactivate_device(&id)?;
            log::debug!("Deactivated volume device {}", id);
        }
        self.backend.remove_pool(dev.pool_name())?;
        log::info!("Deactivated pool {}", dev.thinpool_device);
        Ok(())
    }
}

impl VolumeOps for DevmapperDriver {
    fn create_volume(&self, id: &str, opts: &Opts) -> Result<()> {
        let mut dev = self.write()?;
        if store::exists::<Volume>(&self.root, id) {
            return Err(Error::AlreadyExists(format!("volume {}", id)));
        }

        let backup_url = opt(opts, OPT_BACKUP_URL);
        let mut size = util::parse_size(opt(opts, OPT_SIZE))?;
        if !backup_url.is_empty() {
            let backup_volume = objectstore::load_volume(backup_url)?;
            if backup_volume.driver != DRIVER_NAME {
                return Err(Error::InvalidArgument(format!(
                    "backup {} was made by driver {}, not {}",
                    backup_url, backup_volume.driver, DRIVER_NAME
                )));
            }
            size = backup_volume.size;
        }
        if size == 0 {
            size = dev.default_volume_size;
        }
        if size % dev.block_bytes() != 0 {
            return Err(Error::InvalidArgument(format!(
                "size {} must be a multiple of block size {}",
                size,
                dev.block_bytes()
            )));
        }

        let dev_id = self.allocate_dev_id(&mut dev)?;
        log::debug!("Creating volume {} with device id {}", id, dev_id);
        self.backend.create_device(dev.pool_name(), dev_id)?;

        if let Err(e) = self
            .backend
            .activate_device(dev.pool_name(), id, dev_id, size)
        {
            self.rollback_device(&dev, id, dev_id, false);
            return Err(e);
        }

        if let Err(e) = self.restore_or_format(id, backup_url, opt_bool(opts, OPT_PREPARE_FOR_VM)) {
            self.rollback_device(&dev, id, dev_id, true);
            return Err(e);
        }

        let volume = Volume {
            uuid: id.to_string(),
            name: opt(opts, OPT_VOLUME_NAME).to_string(),
            dev_id,
            size,
            mount_point: String::new(),
            created_time: util::now(),
            snapshots: BTreeMap::new(),
        };
        if let Err(e) = store::save(&self.root, &volume) {
            self.rollback_device(&dev, id, dev_id, true);
            return Err(e);
        }
        log::info!("Created volume {} (device id {}, {} bytes)", id, dev_id, size);
        Ok(())
    }

    fn delete_volume(&self, id: &str, _opts: &Opts) -> Result<()> {
        let dev = self.write()?;
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

        if self.backend.device_path(id).exists() {
            self.backend.deactivate_device(id)?;
        }
        self.backend.delete_device(dev.pool_name(), volume.dev_id)?;
        store::delete::<Volume>(&self.root, id)?;
        log::info!("Deleted volume {} (device id {})", id, volume.dev_id);
        Ok(())
    }

    fn mount_volume(&self, id: &str, opts: &Opts) -> Result<String> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        let device = self.volume_device(id)?;
        let mount_point = {
            let mut target = MountTarget {
                volume: &mut volume,
                root: &self.root,
                device,
            };
            let requested = opt(opts, OPT_MOUNT_POINT);
            mount::volume_mount(
                self.mounter.as_ref(),
                &mut target,
                Some(requested).filter(|m| !m.is_empty()),
            )?
        };
        store::save(&self.root, &volume)?;
        Ok(mount_point)
    }

    fn umount_volume(&self, id: &str) -> Result<()> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        let device = self.volume_device(id)?;
        {
            let mut target = MountTarget {
                volume: &mut volume,
                root: &self.root,
                device,
            };
            mount::volume_umount(self.mounter.as_ref(), &mut target)?;
        }
        store::save(&self.root, &volume)
    }

    fn mount_point(&self, id: &str) -> Result<String> {
        let _dev = self.read()?;
        Ok(self.load_volume(id)?.mount_point)
    }

    fn get_volume_info(&self, id: &str) -> Result<Info> {
        let _dev = self.read()?;
        let volume = self.load_volume(id)?;
        self.volume_info(&volume)
    }

    fn list_volumes(&self, _opts: &Opts) -> Result<HashMap<String, Info>> {
        let _dev = self.read()?;
        let mut result = HashMap::new();
        for id in store::list_ids::<Volume>(&self.root)? {
            let volume = self.load_volume(&id)?;
            result.insert(id, self.volume_info(&volume)?);
        }
        Ok(result)
    }
}

impl SnapshotOps for DevmapperDriver {
    fn create_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        let mut dev = self.write()?;
        let mut volume = self.load_volume(volume_id)?;
        if volume.snapshots.contains_key(id) {
            return Err(Error::AlreadyExists(format!(
                "snapshot {} of volume {}",
                id, volume_id
            )));
        }

        let dev_id = self.allocate_dev_id(&mut dev)?;
        log::debug!(
            "Creating snapshot {} of volume {} (device id {} from {})",
            id,
            volume_id,
            dev_id,
            volume.dev_id
        );
        self.backend
            .create_snap_device(dev.pool_name(), dev_id, volume_id, volume.dev_id)?;

        volume.snapshots.insert(
            id.to_string(),
            Snapshot {
                uuid: id.to_string(),
                volume_uuid: volume_id.to_string(),
                dev_id,
                activated: false,
                created_time: util::now(),
            },
        );
        if let Err(e) = store::save(&self.root, &volume) {
            self.rollback_device(&dev, id, dev_id, false);
            return Err(e);
        }
        log::info!("Created snapshot {} of volume {}", id, volume_id);
        Ok(())
    }

    fn delete_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        let dev = self.write()?;
        let mut volume = self.load_volume(volume_id)?;
        let snapshot = Self::snapshot_of(&volume, id)?;

        if snapshot.activated || self.backend.device_path(id).exists() {
            self.backend.deactivate_device(id)?;
        }
        self.backend.delete_device(dev.pool_name(), snapshot.dev_id)?;
        volume.snapshots.remove(id);
        store::save(&self.root, &volume)?;
        log::info!("Deleted snapshot {} of volume {}", id, volume_id);
        Ok(())
    }

    fn get_snapshot_info(&self, id: &str, volume_id: &str) -> Result<Info> {
        let _dev = self.read()?;
        let volume = self.load_volume(volume_id)?;
        let snapshot = Self::snapshot_of(&volume, id)?;
        Ok(Self::snapshot_info(&volume, &snapshot))
    }

    fn list_snapshots(&self, opts: &Opts) -> Result<HashMap<String, Info>> {
        let _dev = self.read()?;
        let ids = match opt(opts, OPT_VOLUME_UUID) {
            "" => store::list_ids::<Volume>(&self.root)?,
            id => vec![id.to_string()],
        };
        let mut result = HashMap::new();
        for id in ids {
            let volume = self.load_volume(&id)?;
            for (snap_id, snapshot) in &volume.snapshots {
                result.insert(snap_id.clone(), Self::snapshot_info(&volume, snapshot));
            }
        }
        Ok(result)
    }
}

/// Snapshot access for the backup engine, used while the driver lock is held
struct SnapshotReader<'a> {
    driver: &'a DevmapperDriver,
    device: &'a Device,
}

impl SnapshotReader<'_> {
    fn load(&self, id: &str, volume_id: &str) -> Result<(Volume, Snapshot)> {
        let volume = self.driver.load_volume(volume_id)?;
        let snapshot = DevmapperDriver::snapshot_of(&volume, id)?;
        Ok((volume, snapshot))
    }

    fn set_activated(&self, id: &str, volume_id: &str, activated: bool) -> Result<()> {
        let mut volume = self.driver.load_volume(volume_id)?;
        if let Some(snapshot) = volume.snapshots.get_mut(id) {
            snapshot.activated = activated;
        }
        store::save(&self.driver.root, &volume)
    }
}

impl DeltaBlockOperations for SnapshotReader<'_> {
    fn has_snapshot(&self, id: &str, volume_id: &str) -> bool {
        self.load(id, volume_id).is_ok()
    }

    fn compare_snapshot(&self, id: &str, compare_id: &str, volume_id: &str) -> Result<Mappings> {
        let (compare_id, include_same) = if compare_id.is_empty() || compare_id == id {
            (id, true)
        } else {
            (compare_id, false)
        };
        let (_, snap1) = self.load(id, volume_id)?;
        let (_, snap2) = self.load(compare_id, volume_id)?;

        let output = self.driver.backend.thin_delta(
            self.device.pool_name(),
            &self.device.metadata_device,
            snap1.dev_id,
            snap2.dev_id,
        )?;
        thin_delta::parse_thin_delta(&output, self.device.block_bytes(), include_same)
    }

    fn open_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        let (volume, snapshot) = self.load(id, volume_id)?;
        if !self.driver.backend.device_path(id).exists() {
            self.driver.backend.activate_device(
                self.device.pool_name(),
                id,
                snapshot.dev_id,
                volume.size,
            )?;
        }
        self.set_activated(id, volume_id, true)
    }

    fn read_snapshot(&self, id: &str, volume_id: &str, offset: i64, buf: &mut [u8]) -> Result<()> {
        self.load(id, volume_id)?;
        let file = std::fs::File::open(self.driver.backend.device_path(id))?;
        file.read_exact_at(buf, offset as u64)?;
        Ok(())
    }

    fn close_snapshot(&self, id: &str, volume_id: &str) -> Result<()> {
        self.load(id, volume_id)?;
        self.driver.backend.deactivate_device(id)?;
        self.set_activated(id, volume_id, false)
    }
}

impl DevmapperDriver {
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
}

impl BackupOps for DevmapperDriver {
    fn create_backup(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        dest_url: &str,
        opts: &Opts,
    ) -> Result<String> {
        let dev = self.write()?;
        let volume = self.load_volume(volume_id)?;
        let snapshot = Self::snapshot_of(&volume, snapshot_id)?;

        let reader = SnapshotReader {
            driver: self,
            device: &dev,
        };
        let config = DeltaBackupConfig {
            volume: VolumeInfo {
                name: volume_id.to_string(),
                driver: DRIVER_NAME.to_string(),
                size: volume.size,
                created_time: match opt(opts, OPT_VOLUME_CREATED_TIME) {
                    "" => volume.created_time.clone(),
                    t => t.to_string(),
                },
            },
            snapshot: SnapshotInfo {
                name: snapshot_id.to_string(),
                created_time: match opt(opts, OPT_SNAPSHOT_CREATED_TIME) {
                    "" => snapshot.created_time.clone(),
                    t => t.to_string(),
                },
            },
            dest_url: dest_url.to_string(),
            delta_ops: &reader,
        };
        objectstore::create_delta_block_backup(&config)
    }

    fn delete_backup(&self, backup_url: &str) -> Result<()> {
        let _dev = self.write()?;
        Self::check_backup_driver(backup_url)?;
        objectstore::delete_delta_block_backup(backup_url)
    }

    fn get_backup_info(&self, backup_url: &str) -> Result<Info> {
        Self::check_backup_driver(backup_url)?;
        objectstore::get_backup_info(backup_url)
    }

    fn list_backups(&self, dest_url: &str, opts: &Opts) -> Result<HashMap<String, Info>> {
        objectstore::list(Some(opt(opts, OPT_VOLUME_UUID)), dest_url, DRIVER_NAME)
    }
}

//! DigitalOcean block storage volumes
//!
//! Volumes are cloud volumes attached to the local droplet and mounted from
//! `/dev/disk/by-id`. Snapshots and backups are not offered.

pub mod client;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::driver::{
    opt, opt_bool, Capability, ConvoyDriver, Info, Opts, VolumeOps, DEFAULT_FILESYSTEM,
    OPT_MOUNT_POINT, OPT_REFERENCE_ONLY, OPT_SIZE, OPT_VOLUME_DRIVER_ID, OPT_VOLUME_NAME,
};
use crate::error::{Error, Result};
use crate::store::{self, Record};
use crate::util::mount::{self, MountableVolume, Mounter};
use crate::util::{self, path_str};

use client::{DoClient, DoHttpClient, GB};

pub const DRIVER_NAME: &str = "digitalocean";

const DO_DEFAULT_VOLUME_SIZE: &str = "do.defaultvolumesize";
const DEFAULT_VOLUME_SIZE: &str = "10G";

const DEVICE_DIR: &str = "/dev/disk/by-id";
const DEVICE_PREFIX: &str = "scsi-0DO_Volume_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub root: String,
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
pub struct Volume {
    pub name: String,
    /// Cloud-side volume id
    #[serde(rename = "ID")]
    pub id: String,
    pub device: String,
    pub mount_point: String,
    pub size: i64,
    pub created_time: String,
    #[serde(skip)]
    root: PathBuf,
}

impl Record for Volume {
    const PREFIX: &'static str = "digitalocean_volume_";
    const SUFFIX: &'static str = ".json";

    fn id(&self) -> &str {
        &self.name
    }
}

impl MountableVolume for Volume {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> Result<String> {
        Ok(self.device.clone())
    }

    fn mount_point(&self) -> &str {
        &self.mount_point
    }

    fn set_mount_point(&mut self, mount_point: String) {
        self.mount_point = mount_point;
    }

    fn driver_root(&self) -> &Path {
        &self.root
    }
}

fn device_path(cloud_name: &str) -> String {
    format!("{}/{}{}", DEVICE_DIR, DEVICE_PREFIX, cloud_name)
}

pub struct DoDriver {
    root: PathBuf,
    client: Arc<dyn DoClient>,
    mounter: Arc<dyn Mounter>,
    device: RwLock<Device>,
}

pub fn init(root: &Path, opts: &Opts) -> Result<Box<dyn ConvoyDriver>> {
    let client = Arc::new(DoHttpClient::from_env()?);
    Ok(Box::new(DoDriver::new(root, opts, client, mount::system())?))
}

impl DoDriver {
    pub fn new(
        root: &Path,
        opts: &Opts,
        client: Arc<dyn DoClient>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self> {
        let device = if store::exists::<Device>(root, "") {
            store::load::<Device>(root, "")?
        } else {
            let size = util::parse_size(match opt(opts, DO_DEFAULT_VOLUME_SIZE) {
                "" => DEFAULT_VOLUME_SIZE,
                s => s,
            })?;
            if size <= 0 {
                return Err(Error::InvalidArgument(format!(
                    "illegal default volume size {}",
                    size
                )));
            }
            let device = Device {
                root: path_str(root)?.to_string(),
                default_volume_size: size,
            };
            store::save(root, &device)?;
            device
        };

        let driver = Self {
            root: root.to_path_buf(),
            client,
            mounter,
            device: RwLock::new(device),
        };
        driver.remount_volumes()?;
        Ok(driver)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Device>> {
        self.device
            .read()
            .map_err(|_| Error::Backend("digitalocean driver lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Device>> {
        self.device
            .write()
            .map_err(|_| Error::Backend("digitalocean driver lock poisoned".into()))
    }

    fn load_volume(&self, name: &str) -> Result<Volume> {
        let mut volume = match store::load::<Volume>(&self.root, name) {
            Err(e) if e.is_not_found() => return Err(Error::NotFound(format!("volume {}", name))),
            other => other?,
        };
        volume.root = self.root.clone();
        Ok(volume)
    }

    /// Mount again every volume that was mounted before a restart
    fn remount_volumes(&self) -> Result<()> {
        let _dev = self.write()?;
        for name in store::list_ids::<Volume>(&self.root)? {
            let mut volume = self.load_volume(&name)?;
            if volume.mount_point.is_empty() {
                continue;
            }
            mount::volume_mount(self.mounter.as_ref(), &mut volume, None)?;
            log::debug!("Remounted volume {} at {}", name, volume.mount_point);
        }
        Ok(())
    }

    fn volume_info(&self, volume: &Volume) -> Result<Info> {
        let cloud = self.client.get_volume(&volume.id)?;
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Device".to_string(), volume.device.clone()),
            ("MountPoint".to_string(), volume.mount_point.clone()),
            ("ID".to_string(), volume.id.clone()),
            (OPT_VOLUME_NAME.to_string(), volume.name.clone()),
            ("Size".to_string(), cloud.size_bytes().to_string()),
            ("CreatedTime".to_string(), volume.created_time.clone()),
        ]))
    }

    /// Undo a partially created cloud volume
    fn rollback(&self, name: &str, cloud_id: &str, attached: bool, created: bool) {
        if attached {
            if let Err(e) = self.client.detach_volume(cloud_id) {
                log::warn!("Rollback: cannot detach {} ({}): {}", name, cloud_id, e);
            }
        }
        if created {
            match self.client.delete_volume(cloud_id) {
                Ok(()) => log::info!("Rolled back cloud volume {} of {}", cloud_id, name),
                Err(e) => log::warn!("Rollback: cannot delete {} ({}): {}", name, cloud_id, e),
            }
        }
    }
}

impl ConvoyDriver for DoDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<Info> {
        let dev = self.read()?;
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Root".to_string(), dev.root.clone()),
            ("DefaultVolumeSize".to_string(), dev.default_volume_size.to_string()),
        ]))
    }

    fn volume_ops(&self) -> Capability<'_, dyn VolumeOps> {
        Capability::Supported(self)
    }
}

impl VolumeOps for DoDriver {
    fn create_volume(&self, id: &str, opts: &Opts) -> Result<()> {
        let dev = self.write()?;
        if store::exists::<Volume>(&self.root, id) {
            return Err(Error::AlreadyExists(format!("volume {}", id)));
        }

        // An existing cloud volume is adopted as is
        let (cloud_id, cloud_name, size, created) = match opt(opts, OPT_VOLUME_DRIVER_ID) {
            "" => {
                let size = match util::parse_size(opt(opts, OPT_SIZE))? {
                    0 => dev.default_volume_size,
                    s => s,
                };
                let size = client::gigabytes(size) * GB;
                let cloud_id = self.client.create_volume(id, size)?;
                log::debug!("Created cloud volume {} for {}", cloud_id, id);
                (cloud_id, id.to_string(), size, true)
            }
            external => {
                let cloud = self.client.get_volume(external)?;
                log::debug!("Adopting cloud volume {} ({}) as {}", cloud.id, cloud.name, id);
                (cloud.id.clone(), cloud.name.clone(), cloud.size_bytes(), false)
            }
        };

        if let Err(e) = self.client.attach_volume(&cloud_id) {
            self.rollback(id, &cloud_id, false, created);
            return Err(e);
        }

        let device = device_path(&cloud_name);
        if created {
            if let Err(e) = self.mounter.format(&device, DEFAULT_FILESYSTEM) {
                self.rollback(id, &cloud_id, true, created);
                return Err(e);
            }
        }

        let volume = Volume {
            name: id.to_string(),
            id: cloud_id.clone(),
            device,
            mount_point: String::new(),
            size,
            created_time: util::now(),
            root: self.root.clone(),
        };
        if let Err(e) = store::save(&self.root, &volume) {
            self.rollback(id, &cloud_id, true, created);
            return Err(e);
        }
        log::info!("Created volume {} on cloud volume {}", id, cloud_id);
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

        self.client.detach_volume(&volume.id)?;
        if opt_bool(opts, OPT_REFERENCE_ONLY) {
            log::info!("Keeping cloud volume {} of {} (reference only)", volume.id, id);
        } else {
            self.client.delete_volume(&volume.id)?;
        }
        store::delete::<Volume>(&self.root, id)?;
        log::info!("Deleted volume {}", id);
        Ok(())
    }

    fn mount_volume(&self, id: &str, opts: &Opts) -> Result<String> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        let requested = opt(opts, OPT_MOUNT_POINT);
        let mount_point = mount::volume_mount(
            self.mounter.as_ref(),
            &mut volume,
            Some(requested).filter(|m| !m.is_empty()),
        )?;
        store::save(&self.root, &volume)?;
        Ok(mount_point)
    }

    fn umount_volume(&self, id: &str) -> Result<()> {
        let _dev = self.write()?;
        let mut volume = self.load_volume(id)?;
        mount::volume_umount(self.mounter.as_ref(), &mut volume)?;
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

//! Replicated block volumes provisioned as Rancher stacks
//!
//! Creating a volume launches a stack of replicas plus a controller and waits
//! for the controller to publish `/dev/longhorn/<name>`. Any failure on the
//! way tears the whole stack down again.

pub mod stack;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::driver::{
    opt, opt_bool, Capability, ConvoyDriver, Info, Opts, VolumeOps, DEFAULT_FILESYSTEM,
    OPT_MOUNT_POINT, OPT_PREPARE_FOR_VM, OPT_SIZE, OPT_VOLUME_NAME,
};
use crate::error::{Error, Result};
use crate::store::{self, Record};
use crate::util::mount::{self, MountableVolume, Mounter};
use crate::util::{self, backoff, path_str};

use stack::{Orchestrator, RancherClient, StackSpec, SERVICE_COUNT};

pub const DRIVER_NAME: &str = "longhorn";

const LH_RANCHER_URL: &str = "lh.rancherurl";
const LH_RANCHER_ACCESS_KEY: &str = "lh.rancheraccesskey";
const LH_RANCHER_SECRET_KEY: &str = "lh.ranchersecretkey";
const LH_DEFAULT_VOLUME_SIZE: &str = "lh.defaultvolumesize";
const DEFAULT_VOLUME_SIZE: &str = "10G";

/// Environment fallbacks for the Rancher API keys
const ACCESS_KEY_ENV: &str = "CATTLE_ACCESS_KEY";
const SECRET_KEY_ENV: &str = "CATTLE_SECRET_KEY";
/// Container the controller is scheduled next to
const CONVOY_CONTAINER_ENV: &str = "CONVOY_CONTAINER";

const DEVICE_DIR: &str = "/dev/longhorn";
const WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Driver record; API keys are never stored here
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub root: String,
    pub default_volume_size: i64,
    #[serde(rename = "RancherURL")]
    pub rancher_url: String,
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
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub name: String,
    pub size: i64,
    pub mount_point: String,
    #[serde(rename = "StackID")]
    pub stack_id: String,
    pub stack_name: String,
    pub device: String,
    pub created_time: String,
    #[serde(skip)]
    root: PathBuf,
}

impl Record for Volume {
    const PREFIX: &'static str = "longhorn_volume_";
    const SUFFIX: &'static str = ".json";

    fn id(&self) -> &str {
        &self.uuid
    }
}

impl MountableVolume for Volume {
    fn name(&self) -> &str {
        &self.uuid
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

pub struct LonghornDriver {
    root: PathBuf,
    orchestrator: Arc<dyn Orchestrator>,
    mounter: Arc<dyn Mounter>,
    device_dir: PathBuf,
    wait_timeout: Duration,
    device: RwLock<Device>,
}

fn credential(opts: &Opts, key: &str, env: &str) -> Result<String> {
    match opt(opts, key) {
        "" => std::env::var(env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("missing {} (or {})", key, env))),
        v => Ok(v.to_string()),
    }
}

pub fn init(root: &Path, opts: &Opts) -> Result<Box<dyn ConvoyDriver>> {
    let device = load_or_create_device(root, opts)?;
    log::debug!("Connecting to Rancher at {}", device.rancher_url);
    let client = RancherClient::new(
        &device.rancher_url,
        &credential(opts, LH_RANCHER_ACCESS_KEY, ACCESS_KEY_ENV)?,
        &credential(opts, LH_RANCHER_SECRET_KEY, SECRET_KEY_ENV)?,
    )?;
    Ok(Box::new(LonghornDriver::new(
        root,
        device,
        Arc::new(client),
        mount::system(),
    )?))
}

fn load_or_create_device(root: &Path, opts: &Opts) -> Result<Device> {
    if store::exists::<Device>(root, "") {
        return store::load(root, "");
    }
    let rancher_url = util::require_opt(opts, LH_RANCHER_URL)?.to_string();
    let size = util::parse_size(match opt(opts, LH_DEFAULT_VOLUME_SIZE) {
        "" => DEFAULT_VOLUME_SIZE,
        s => s,
    })?;
    if size <= 0 {
        return Err(Error::InvalidArgument(format!(
            "illegal default volume size {}",
            size
        )));
    }
    Ok(Device {
        root: path_str(root)?.to_string(),
        default_volume_size: size,
        rancher_url,
    })
}

impl LonghornDriver {
    pub fn new(
        root: &Path,
        device: Device,
        orchestrator: Arc<dyn Orchestrator>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self> {
        store::save(root, &device)?;
        Ok(Self {
            root: root.to_path_buf(),
            orchestrator,
            mounter,
            device_dir: PathBuf::from(DEVICE_DIR),
            wait_timeout: WAIT_TIMEOUT,
            device: RwLock::new(device),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Device>> {
        self.device
            .read()
            .map_err(|_| Error::Backend("longhorn driver lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Device>> {
        self.device
            .write()
            .map_err(|_| Error::Backend("longhorn driver lock poisoned".into()))
    }

    fn load_volume(&self, id: &str) -> Result<Volume> {
        let mut volume = match store::load::<Volume>(&self.root, id) {
            Err(e) if e.is_not_found() => return Err(Error::NotFound(format!("volume {}", id))),
            other => other?,
        };
        volume.root = self.root.clone();
        Ok(volume)
    }

    fn volume_info(volume: &Volume) -> Info {
        HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Name".to_string(), volume.name.clone()),
            ("Size".to_string(), volume.size.to_string()),
            ("StackName".to_string(), volume.stack_name.clone()),
            ("StackID".to_string(), volume.stack_id.clone()),
            ("Device".to_string(), volume.device.clone()),
            ("MountPoint".to_string(), volume.mount_point.clone()),
            ("CreatedTime".to_string(), volume.created_time.clone()),
        ])
    }

    /// Bring the stack up and wait for the controller's device node
    fn launch(&self, stack: &stack::Stack, device: &Path, format: bool) -> Result<()> {
        let orchestrator = self.orchestrator.as_ref();
        stack::wait_stack(orchestrator, stack, self.wait_timeout)?;
        stack::wait_services(orchestrator, stack, SERVICE_COUNT, "inactive", self.wait_timeout)?;
        orchestrator.activate_services(&stack.id)?;
        stack::wait_services(orchestrator, stack, SERVICE_COUNT, "active", self.wait_timeout)?;

        backoff(
            self.wait_timeout,
            &format!("device {} did not appear", device.display()),
            || Ok(device.exists()),
        )?;
        if format {
            self.mounter.format(path_str(device)?, DEFAULT_FILESYSTEM)?;
        }
        Ok(())
    }

    fn teardown(&self, stack: &stack::Stack) {
        match self.orchestrator.delete_stack(&stack.id) {
            Ok(()) => log::info!("Cleaned up stack {}", stack.name),
            Err(e) => log::warn!("Cannot clean up stack {}: {}", stack.name, e),
        }
    }
}

impl ConvoyDriver for LonghornDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn info(&self) -> Result<Info> {
        let dev = self.read()?;
        Ok(HashMap::from([
            ("Driver".to_string(), DRIVER_NAME.to_string()),
            ("Root".to_string(), dev.root.clone()),
            ("RancherURL".to_string(), dev.rancher_url.clone()),
            ("DefaultVolumeSize".to_string(), dev.default_volume_size.to_string()),
        ]))
    }

    fn volume_ops(&self) -> Capability<'_, dyn VolumeOps> {
        Capability::Supported(self)
    }
}

impl VolumeOps for LonghornDriver {
    fn create_volume(&self, id: &str, opts: &Opts) -> Result<()> {
        let dev = self.write()?;
        if store::exists::<Volume>(&self.root, id) {
            return Err(Error::AlreadyExists(format!("volume {}", id)));
        }
        let size = match util::parse_size(opt(opts, OPT_SIZE))? {
            0 => dev.default_volume_size,
            s => s,
        };

        let container = std::env::var(CONVOY_CONTAINER_ENV).unwrap_or_else(|_| "convoy".into());
        let spec = StackSpec::for_volume(id, size, &container);
        // A stack left behind by an interrupted create is picked up again
        let stack = match self.orchestrator.find_stack(&spec.name)? {
            Some(existing) => {
                log::info!("Reusing existing stack {} ({})", existing.name, existing.id);
                existing
            }
            None => self.orchestrator.create_stack(&spec)?,
        };
        log::debug!("Launching stack {} ({}) for volume {}", stack.name, stack.id, id);

        let device = self.device_dir.join(id);
        if let Err(e) = self.launch(&stack, &device, !opt_bool(opts, OPT_PREPARE_FOR_VM)) {
            log::error!("Failed to launch stack {} for volume {}: {}", stack.name, id, e);
            self.teardown(&stack);
            return Err(e);
        }

        let volume = Volume {
            uuid: id.to_string(),
            name: opt(opts, OPT_VOLUME_NAME).to_string(),
            size,
            mount_point: String::new(),
            stack_id: stack.id.clone(),
            stack_name: stack.name.clone(),
            device: path_str(&device)?.to_string(),
            created_time: util::now(),
            root: self.root.clone(),
        };
        if let Err(e) = store::save(&self.root, &volume) {
            self.teardown(&stack);
            return Err(e);
        }
        log::info!("Created volume {} on stack {}", id, stack.name);
        Ok(())
    }

    fn delete_volume(&self, id: &str, _opts: &Opts) -> Result<()> {
        let _dev = self.write()?;
        let volume = self.load_volume(id)?;
        if !volume.mount_point.is_empty() {
            return Err(Error::Busy(format!(
                "volume {} is mounted at {}",
                id, volume.mount_point
            )));
        }

        match self.orchestrator.get_stack(&volume.stack_id) {
            Ok(stack) => {
                self.orchestrator.deactivate_services(&stack.id)?;
                self.orchestrator.delete_stack(&stack.id)?;
            }
            Err(e) if e.is_not_found() => {
                log::warn!("Stack {} of volume {} is already gone", volume.stack_name, id);
            }
            Err(e) => return Err(e),
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
        Ok(Self::volume_info(&self.load_volume(id)?))
    }

    fn list_volumes(&self, _opts: &Opts) -> Result<HashMap<String, Info>> {
        let _dev = self.read()?;
        let mut result = HashMap::new();
        for id in store::list_ids::<Volume>(&self.root)? {
            result.insert(id.clone(), Self::volume_info(&self.load_volume(&id)?));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::stack::{Service, Stack};
    use super::*;
    use crate::util::mount::MemoryMounter;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Control plane whose services become ready immediately
    struct FakeRancher {
        stacks: Mutex<HashMap<String, (Stack, bool)>>,
        device_dir: PathBuf,
        publish_device: bool,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeRancher {
        fn new(device_dir: &Path, publish_device: bool) -> Self {
            Self {
                stacks: Mutex::new(HashMap::new()),
                device_dir: device_dir.to_path_buf(),
                publish_device,
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    impl Orchestrator for FakeRancher {
        fn find_stack(&self, name: &str) -> Result<Option<Stack>> {
            Ok(self
                .stacks
                .lock()
                .unwrap()
                .values()
                .find(|(s, _)| s.name == name)
                .map(|(s, _)| s.clone()))
        }

        fn create_stack(&self, spec: &StackSpec) -> Result<Stack> {
            let mut stacks = self.stacks.lock().unwrap();
            let stack = Stack {
                id: format!("1e{}", stacks.len() + 1),
                name: spec.name.clone(),
                state: "inactive".into(),
                transitioning: "no".into(),
            };
            stacks.insert(stack.id.clone(), (stack.clone(), false));
            Ok(stack)
        }

        fn get_stack(&self, id: &str) -> Result<Stack> {
            self.stacks
                .lock()
                .unwrap()
                .get(id)
                .map(|(s, _)| s.clone())
                .ok_or_else(|| Error::NotFound(format!("stack {}", id)))
        }

        fn delete_stack(&self, id: &str) -> Result<()> {
            self.stacks.lock().unwrap().remove(id);
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }

        fn list_services(&self, stack_id: &str) -> Result<Vec<Service>> {
            let active = self.stacks.lock().unwrap().get(stack_id).map(|(_, a)| *a);
            let state = if active == Some(true) { "active" } else { "inactive" };
            Ok(["replica", "replica", "controller"]
                .iter()
                .enumerate()
                .map(|(i, name)| Service {
                    id: format!("1s{}", i),
                    name: name.to_string(),
                    state: state.to_string(),
                })
                .collect())
        }

        fn activate_services(&self, stack_id: &str) -> Result<()> {
            let mut stacks = self.stacks.lock().unwrap();
            let (stack, active) = stacks
                .get_mut(stack_id)
                .ok_or_else(|| Error::NotFound(format!("stack {}", stack_id)))?;
            *active = true;
            if self.publish_device {
                let volume = stack.name.trim_start_matches("Longhorn-");
                std::fs::write(self.device_dir.join(volume), b"")?;
            }
            Ok(())
        }

        fn deactivate_services(&self, stack_id: &str) -> Result<()> {
            if let Some((_, active)) = self.stacks.lock().unwrap().get_mut(stack_id) {
                *active = false;
            }
            Ok(())
        }
    }

    fn driver(dir: &TempDir, rancher: &Arc<FakeRancher>, mounter: &Arc<MemoryMounter>) -> Result<LonghornDriver> {
        let opts = Opts::from([(LH_RANCHER_URL.to_string(), "http://rancher:8080/v1".to_string())]);
        let device = load_or_create_device(dir.path(), &opts)?;
        let mut driver = LonghornDriver::new(dir.path(), device, rancher.clone(), mounter.clone())?;
        driver.device_dir = dir.path().join("dev");
        driver.wait_timeout = Duration::from_millis(400);
        Ok(driver)
    }

    fn setup(publish_device: bool) -> (TempDir, Arc<FakeRancher>, Arc<MemoryMounter>) {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("dev");
        std::fs::create_dir_all(&dev).unwrap();
        let rancher = Arc::new(FakeRancher::new(&dev, publish_device));
        (dir, rancher, Arc::new(MemoryMounter::default()))
    }

    #[test]
    fn test_init_requires_rancher_url() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_or_create_device(dir.path(), &Opts::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_device_record_has_no_keys() -> Result<()> {
        let (dir, rancher, mounter) = setup(true);
        driver(&dir, &rancher, &mounter)?;
        let saved = std::fs::read_to_string(dir.path().join("longhorn.cfg"))?;
        assert!(saved.contains("RancherURL"));
        assert!(!saved.to_lowercase().contains("key"));
        Ok(())
    }

    #[test]
    fn test_create_mount_delete() -> Result<()> {
        let (dir, rancher, mounter) = setup(true);
        let driver = driver(&dir, &rancher, &mounter)?;

        driver.create_volume("vol1", &Opts::from([(OPT_SIZE.to_string(), "1G".to_string())]))?;
        let info = driver.get_volume_info("vol1")?;
        assert_eq!(info["StackName"], "Longhorn-vol1");
        assert_eq!(info["Size"], (1i64 << 30).to_string());
        assert_eq!(mounter.formatted(), vec![info["Device"].clone()]);

        let mp = driver.mount_volume("vol1", &Opts::new())?;
        assert_eq!(driver.mount_volume("vol1", &Opts::new())?, mp);
        assert!(matches!(
            driver.delete_volume("vol1", &Opts::new()),
            Err(Error::Busy(_))
        ));
        driver.umount_volume("vol1")?;

        driver.delete_volume("vol1", &Opts::new())?;
        assert_eq!(*rancher.deleted.lock().unwrap(), vec![info["StackID"].clone()]);
        assert!(driver.list_volumes(&Opts::new())?.is_empty());
        assert!(matches!(driver.snapshots(), Err(Error::NotSupported { .. })));
        assert!(!driver.backup_ops().is_supported());
        Ok(())
    }

    #[test]
    fn test_missing_device_tears_down_stack() -> Result<()> {
        let (dir, rancher, mounter) = setup(false);
        let driver = driver(&dir, &rancher, &mounter)?;

        assert!(matches!(
            driver.create_volume("vol1", &Opts::new()),
            Err(Error::Timeout(_))
        ));
        assert_eq!(rancher.deleted.lock().unwrap().len(), 1);
        assert!(rancher.stacks.lock().unwrap().is_empty());
        assert!(matches!(
            driver.get_volume_info("vol1"),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }
}

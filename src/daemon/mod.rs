//! Volume daemon
//!
//! Owns the daemon root, the initialised drivers and the daemon-level volume
//! records that map user-facing names to uuids. Every request arrives as a
//! [`Command`] and is answered with a JSON value by [`Daemon::dispatch`].

mod backup;
mod docker;
mod snapshot;
mod volume;

pub mod server;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::{DaemonConfig, MIN_CMD_TIMEOUT};
use crate::driver::{self, ConvoyDriver, Opts};
use crate::error::{Error, Result};
use crate::store::{self, Record};
use crate::util::{self, Index};

pub use backup::{BackupCreateRequest, BackupListRequest, BackupRequest};
pub use docker::{PluginOp, PluginRequest, PluginResponse, PluginVolume};
pub use snapshot::{SnapshotCreateRequest, SnapshotRequest, SnapshotResponse};
pub use volume::{
    MountResponse, VolumeCreateRequest, VolumeDeleteRequest, VolumeListRequest,
    VolumeMountRequest, VolumeRequest, VolumeResponse,
};

pub const DEFAULT_ROOT: &str = "/var/lib/rancher/convoy";
pub const DEFAULT_SOCKET: &str = "/var/run/convoy/convoy.sock";

const LOCK_FILE: &str = "lock";

/// Start-up settings taken from the command line
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub root: PathBuf,
    pub drivers: Vec<String>,
    pub driver_opts: Opts,
    pub mnt_ns: String,
    pub ignore_docker_delete: bool,
    pub create_on_docker_mount: bool,
    pub cmd_timeout: Duration,
    /// Rebuild `convoy.cfg` from these options even if one exists
    pub ignore_config_file: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            drivers: Vec::new(),
            driver_opts: Opts::new(),
            mnt_ns: String::new(),
            ignore_docker_delete: false,
            create_on_docker_mount: false,
            cmd_timeout: util::DEFAULT_CMD_TIMEOUT,
            ignore_config_file: false,
        }
    }
}

/// Daemon-level volume record, `<root>/volume_<uuid>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub name: String,
    pub driver_name: String,
    pub created_time: String,
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl Record for Volume {
    const PREFIX: &'static str = "volume_";
    const SUFFIX: &'static str = ".json";

    fn id(&self) -> &str {
        &self.uuid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "VolumeUUID")]
    pub volume_uuid: String,
    pub name: String,
    pub created_time: String,
}

/// In-memory lookups rebuilt from the volume records at start
#[derive(Debug, Default)]
struct Indexes {
    /// Volume and snapshot names share one namespace
    names: Index,
    /// Snapshot uuid to owning volume uuid
    snapshot_volumes: Index,
}

/// A request to the daemon
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Op")]
pub enum Command {
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "volume.create")]
    VolumeCreate(VolumeCreateRequest),
    #[serde(rename = "volume.delete")]
    VolumeDelete(VolumeDeleteRequest),
    #[serde(rename = "volume.mount")]
    VolumeMount(VolumeMountRequest),
    #[serde(rename = "volume.umount")]
    VolumeUmount(VolumeRequest),
    #[serde(rename = "volume.inspect")]
    VolumeInspect(VolumeRequest),
    #[serde(rename = "volume.list")]
    VolumeList(VolumeListRequest),
    #[serde(rename = "snapshot.create")]
    SnapshotCreate(SnapshotCreateRequest),
    #[serde(rename = "snapshot.delete")]
    SnapshotDelete(SnapshotRequest),
    #[serde(rename = "snapshot.inspect")]
    SnapshotInspect(SnapshotRequest),
    #[serde(rename = "snapshot.list")]
    SnapshotList(VolumeRequest),
    #[serde(rename = "backup.create")]
    BackupCreate(BackupCreateRequest),
    #[serde(rename = "backup.delete")]
    BackupDelete(BackupRequest),
    #[serde(rename = "backup.inspect")]
    BackupInspect(BackupRequest),
    #[serde(rename = "backup.list")]
    BackupList(BackupListRequest),
}

impl Command {
    pub const OPS: &'static [&'static str] = &[
        "info",
        "volume.create",
        "volume.delete",
        "volume.mount",
        "volume.umount",
        "volume.inspect",
        "volume.list",
        "snapshot.create",
        "snapshot.delete",
        "snapshot.inspect",
        "snapshot.list",
        "backup.create",
        "backup.delete",
        "backup.inspect",
        "backup.list",
    ];

    /// Decode the JSON `body` of operation `op` (e.g. `volume.create`).
    ///
    /// An unknown operation is `NotFound`; a malformed body is `InvalidArgument`.
    pub fn parse(op: &str, body: &[u8]) -> Result<Self> {
        if !Self::OPS.contains(&op) {
            return Err(Error::NotFound(format!("command {}", op)));
        }
        let mut value: serde_json::Value = if body.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_slice(body)
                .map_err(|e| Error::InvalidArgument(format!("{} request: {}", op, e)))?
        };
        let object = value.as_object_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("{} request must be a JSON object", op))
        })?;
        object.insert("Op".into(), serde_json::Value::String(op.to_string()));
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidArgument(format!("{} request: {}", op, e)))
    }
}

pub struct Daemon {
    root: PathBuf,
    config: DaemonConfig,
    drivers: BTreeMap<String, Box<dyn ConvoyDriver>>,
    indexes: RwLock<Indexes>,
    _lock: File,
}

impl Daemon {
    /// Lock the root, load or create `convoy.cfg` and bring up every driver.
    ///
    /// An existing config wins over `opts`, so a restart sees the same
    /// drivers and settings as the first start.
    pub fn start(opts: DaemonOptions) -> Result<Self> {
        fs::create_dir_all(&opts.root)?;
        let lock = util::lock_file(&opts.root.join(LOCK_FILE))?;

        let config = if !opts.ignore_config_file && store::exists::<DaemonConfig>(&opts.root, "") {
            let config: DaemonConfig = store::load(&opts.root, "")?;
            log::info!(
                "Loaded daemon config from {}",
                config.config_file(&opts.root).display()
            );
            if config.root != opts.root.display().to_string() {
                log::warn!(
                    "Daemon config records root {} but running in {}",
                    config.root,
                    opts.root.display()
                );
            }
            config
        } else {
            Self::new_config(&opts)?
        };

        util::mount::init_mount_namespace(&config.mount_namespace_fd)?;
        util::set_cmd_timeout(config.cmd_timeout()?);

        let mut drivers = BTreeMap::new();
        for name in &config.driver_list {
            let driver = driver::get_driver(name, &opts.root, &opts.driver_opts)?;
            drivers.insert(name.clone(), driver);
        }

        let daemon = Self {
            root: opts.root,
            config,
            drivers,
            indexes: RwLock::new(Indexes::default()),
            _lock: lock,
        };
        daemon.rebuild_indexes()?;
        daemon.reconcile();
        store::save(&daemon.root, &daemon.config)?;

        log::info!(
            "Daemon started in {} with drivers {:?}",
            daemon.root.display(),
            daemon.config.driver_list
        );
        Ok(daemon)
    }

    fn new_config(opts: &DaemonOptions) -> Result<DaemonConfig> {
        let default_driver = opts
            .drivers
            .first()
            .ok_or_else(|| Error::InvalidArgument("at least one driver must be given".into()))?;
        for name in &opts.drivers {
            if !driver::is_registered(name) {
                return Err(Error::InvalidArgument(format!("unknown driver {}", name)));
            }
        }
        if opts.cmd_timeout < MIN_CMD_TIMEOUT {
            return Err(Error::InvalidArgument(format!(
                "cmd timeout {} is below the minimum of 1m",
                util::format_duration(opts.cmd_timeout)
            )));
        }

        Ok(DaemonConfig {
            root: opts.root.display().to_string(),
            driver_list: opts.drivers.clone(),
            default_driver: default_driver.clone(),
            mount_namespace_fd: opts.mnt_ns.clone(),
            ignore_docker_delete: opts.ignore_docker_delete,
            create_on_docker_mount: opts.create_on_docker_mount,
            cmd_timeout: util::format_duration(opts.cmd_timeout),
        })
    }

    fn rebuild_indexes(&self) -> Result<()> {
        let mut indexes = self.write()?;
        for id in store::list_ids::<Volume>(&self.root)? {
            let volume: Volume = store::load(&self.root, &id)?;
            indexes.names.add(&volume.name, &volume.uuid)?;
            for snapshot in volume.snapshots.values() {
                indexes.snapshot_volumes.add(&snapshot.uuid, &volume.uuid)?;
                if !snapshot.name.is_empty() {
                    indexes.names.add(&snapshot.name, &snapshot.uuid)?;
                }
            }
        }
        log::debug!("Indexed {} names", indexes.names.len());
        Ok(())
    }

    /// Log volumes whose driver state no longer matches the daemon records
    fn reconcile(&self) {
        let ids = match store::list_ids::<Volume>(&self.root) {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Cannot list volumes for reconciliation: {}", e);
                return;
            }
        };
        for id in ids {
            let volume: Volume = match store::load(&self.root, &id) {
                Ok(volume) => volume,
                Err(e) => {
                    log::warn!("Volume {} record unreadable: {}", id, e);
                    continue;
                }
            };
            let probe = self
                .driver(&volume.driver_name)
                .and_then(|d| d.volumes())
                .and_then(|ops| ops.get_volume_info(&volume.uuid));
            if let Err(e) = probe {
                log::warn!(
                    "Volume {} ({}) diverges from driver {}: {}",
                    volume.uuid,
                    volume.name,
                    volume.driver_name,
                    e
                );
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn cmd_timeout(&self) -> Duration {
        self.config.cmd_timeout().unwrap_or(util::DEFAULT_CMD_TIMEOUT)
    }

    /// Run one command and render its result
    pub fn dispatch(&self, command: Command) -> Result<serde_json::Value> {
        let value = match command {
            Command::Info => self.info()?,
            Command::VolumeCreate(req) => serde_json::to_value(self.create_volume(&req)?)?,
            Command::VolumeDelete(req) => {
                self.delete_volume(&req)?;
                serde_json::json!({})
            }
            Command::VolumeMount(req) => serde_json::to_value(self.mount_volume(&req)?)?,
            Command::VolumeUmount(req) => {
                self.umount_volume(&req)?;
                serde_json::json!({})
            }
            Command::VolumeInspect(req) => serde_json::to_value(self.inspect_volume(&req)?)?,
            Command::VolumeList(req) => self.list_volumes(&req)?,
            Command::SnapshotCreate(req) => serde_json::to_value(self.create_snapshot(&req)?)?,
            Command::SnapshotDelete(req) => {
                self.delete_snapshot(&req)?;
                serde_json::json!({})
            }
            Command::SnapshotInspect(req) => serde_json::to_value(self.inspect_snapshot(&req)?)?,
            Command::SnapshotList(req) => serde_json::to_value(self.list_snapshots(&req)?)?,
            Command::BackupCreate(req) => {
                serde_json::json!({ "URL": self.create_backup(&req)? })
            }
            Command::BackupDelete(req) => {
                self.delete_backup(&req)?;
                serde_json::json!({})
            }
            Command::BackupInspect(req) => serde_json::to_value(self.inspect_backup(&req)?)?,
            Command::BackupList(req) => serde_json::to_value(self.list_backups(&req)?)?,
        };
        Ok(value)
    }

    /// Undo a command whose caller stopped waiting for its result
    pub(crate) fn roll_back(&self, op: &str, value: &serde_json::Value) -> Result<()> {
        let field = |key: &str| value[key].as_str().unwrap_or_default().to_string();
        match op {
            "volume.create" => self.delete_volume(&VolumeDeleteRequest {
                volume: field("UUID"),
                reference_only: false,
            }),
            "volume.mount" => self.umount_volume(&VolumeRequest {
                volume: field("UUID"),
            }),
            "snapshot.create" => self.delete_snapshot(&SnapshotRequest {
                snapshot: field("UUID"),
            }),
            "backup.create" => self.delete_backup(&BackupRequest { url: field("URL") }),
            _ => Ok(()),
        }
    }

    fn info(&self) -> Result<serde_json::Value> {
        let mut info = serde_json::Map::new();
        info.insert("General".into(), serde_json::to_value(&self.config)?);
        for (name, driver) in &self.drivers {
            let attrs: BTreeMap<_, _> = driver.info()?.into_iter().collect();
            info.insert(name.clone(), serde_json::to_value(attrs)?);
        }
        Ok(serde_json::Value::Object(info))
    }

    /// Release driver resources before exit
    pub fn shutdown(&self) {
        for (name, driver) in &self.drivers {
            if let Err(e) = driver.shutdown() {
                log::warn!("Driver {} did not shut down cleanly: {}", name, e);
            }
        }
    }

    fn driver(&self, name: &str) -> Result<&dyn ConvoyDriver> {
        self.drivers
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| Error::NotFound(format!("driver {} is not loaded", name)))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Indexes>> {
        self.indexes
            .read()
            .map_err(|_| Error::Backend("daemon index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Indexes>> {
        self.indexes
            .write()
            .map_err(|_| Error::Backend("daemon index lock poisoned".into()))
    }

    fn load_volume(&self, uuid: &str) -> Result<Volume> {
        if !util::is_uuid(uuid) {
            return Err(Error::NotFound(format!("volume {}", uuid)));
        }
        store::load(&self.root, uuid).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("volume {}", uuid)),
            e => e,
        })
    }

    /// Look a volume up by name or uuid
    fn resolve_volume(&self, indexes: &Indexes, key: &str) -> Result<Volume> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("volume name or uuid is required".into()));
        }
        let uuid = indexes.names.get(key).unwrap_or(key);
        self.load_volume(uuid)
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("volume {}", key)),
                e => e,
            })
    }

    /// Look a snapshot up by name or uuid, with the volume that owns it
    fn resolve_snapshot(&self, indexes: &Indexes, key: &str) -> Result<(Volume, Snapshot)> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot name or uuid is required".into()));
        }
        let uuid = indexes.names.get(key).unwrap_or(key);
        let volume_uuid = indexes
            .snapshot_volumes
            .get(uuid)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;
        let volume = self.load_volume(volume_uuid)?;
        let snapshot = volume.snapshots.get(uuid).cloned().ok_or_else(|| {
            Error::NotFound(format!("snapshot {} of volume {}", key, volume.uuid))
        })?;
        Ok((volume, snapshot))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn options(dir: &TempDir) -> DaemonOptions {
        DaemonOptions {
            root: dir.path().join("root"),
            drivers: vec!["vfs".to_string()],
            driver_opts: Opts::from([(
                "vfs.path".to_string(),
                dir.path().join("volumes").display().to_string(),
            )]),
            ..DaemonOptions::default()
        }
    }

    pub(crate) fn create(daemon: &Daemon, name: &str) -> Result<VolumeResponse> {
        daemon.create_volume(&VolumeCreateRequest {
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_start_persists_config() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        assert_eq!(daemon.config().default_driver, "vfs");
        assert_eq!(daemon.config().cmd_timeout, "1m");
        assert!(daemon.root().join("convoy.cfg").exists());

        // A second daemon on the same root is refused
        assert!(matches!(Daemon::start(options(&dir)), Err(Error::Busy(_))));
        Ok(())
    }

    #[test]
    fn test_existing_config_wins() -> Result<()> {
        let dir = TempDir::new()?;
        drop(Daemon::start(options(&dir))?);

        let mut opts = options(&dir);
        opts.drivers = vec!["devicemapper".to_string()];
        opts.driver_opts.clear();
        let daemon = Daemon::start(opts)?;
        assert_eq!(daemon.config().driver_list, vec!["vfs"]);
        Ok(())
    }

    #[test]
    fn test_invalid_options() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir);
        opts.drivers.clear();
        assert!(matches!(Daemon::start(opts), Err(Error::InvalidArgument(_))));

        let mut opts = options(&dir);
        opts.cmd_timeout = Duration::from_secs(30);
        assert!(matches!(Daemon::start(opts), Err(Error::InvalidArgument(_))));

        let mut opts = options(&dir);
        opts.drivers = vec!["ebs".to_string()];
        assert!(matches!(Daemon::start(opts), Err(Error::InvalidArgument(_))));

        let mut opts = options(&dir);
        opts.mnt_ns = dir.path().join("no-such-ns").display().to_string();
        assert!(matches!(Daemon::start(opts), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_restart_keeps_volumes() -> Result<()> {
        let dir = TempDir::new()?;
        let (first, second) = {
            let daemon = Daemon::start(options(&dir))?;
            let first = create(&daemon, "db")?;
            let second = create(&daemon, "web")?;
            daemon.create_snapshot(&SnapshotCreateRequest {
                volume: "db".into(),
                name: "db-snap".into(),
            })?;
            (first, second)
        };

        let daemon = Daemon::start(options(&dir))?;
        let listed = daemon.list_volumes(&VolumeListRequest::default())?;
        assert_eq!(listed.as_object().map(|m| m.len()), Some(2));
        assert_eq!(
            listed[&first.uuid]["DriverInfo"],
            serde_json::to_value(&first.driver_info)?
        );
        assert_eq!(daemon.inspect_volume(&VolumeRequest { volume: "web".into() })?.uuid, second.uuid);
        let snapshot = daemon.inspect_snapshot(&SnapshotRequest {
            snapshot: "db-snap".into(),
        })?;
        assert_eq!(snapshot.volume_uuid, first.uuid);
        Ok(())
    }

    #[test]
    fn test_dispatch_commands() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;

        let info = daemon.dispatch(Command::parse("info", b"")?)?;
        assert_eq!(info["General"]["DefaultDriver"], "vfs");
        assert!(info["vfs"].is_object());

        let body = br#"{"Name": "logs", "DriverName": "vfs"}"#;
        let created = daemon.dispatch(Command::parse("volume.create", body)?)?;
        assert_eq!(created["Name"], "logs");
        assert_eq!(created["Driver"], "vfs");

        let mounted = daemon.dispatch(Command::parse("volume.mount", br#"{"Volume": "logs"}"#)?)?;
        assert!(!mounted["MountPoint"].as_str().unwrap_or("").is_empty());

        assert!(matches!(
            Command::parse("volume.resize", b"{}"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            Command::parse("volume.create", b"[1, 2]"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("volume.create", br#"{"Name": 3}"#),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unloaded_driver_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let orphan = Volume {
            uuid: util::new_uuid(),
            name: "orphan".into(),
            driver_name: "longhorn".into(),
            created_time: util::now(),
            snapshots: BTreeMap::new(),
        };
        store::save(daemon.root(), &orphan)?;
        drop(daemon);

        // Start logs the divergence and leaves the record alone
        let daemon = Daemon::start(options(&dir))?;
        assert!(store::exists::<Volume>(daemon.root(), &orphan.uuid));
        assert!(matches!(
            daemon.inspect_volume(&VolumeRequest { volume: "orphan".into() }),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Daemon, Snapshot, SnapshotResponse, Volume};
use crate::driver::{
    Opts, OPT_BACKUP_URL, OPT_MOUNT_POINT, OPT_PREPARE_FOR_VM, OPT_REFERENCE_ONLY, OPT_SIZE,
    OPT_VOLUME_DRIVER_ID, OPT_VOLUME_NAME,
};
use crate::error::{Error, Result};
use crate::objectstore;
use crate::store;
use crate::util;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeCreateRequest {
    pub name: String,
    /// Default driver when empty
    pub driver_name: String,
    /// Human size such as `10G`; the driver default when empty
    pub size: String,
    #[serde(rename = "BackupURL")]
    pub backup_url: String,
    /// Adopt an existing backend volume instead of creating one
    #[serde(rename = "DriverVolumeID")]
    pub driver_volume_id: String,
    #[serde(rename = "PrepareForVM")]
    pub prepare_for_vm: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeDeleteRequest {
    pub volume: String,
    /// Forget the volume locally but keep the backend resource
    pub reference_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeMountRequest {
    pub volume: String,
    pub mount_point: String,
}

/// A request naming one volume by name or uuid
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeRequest {
    pub volume: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeListRequest {
    /// List what every driver knows instead of the daemon's own records
    pub driver_specific: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeResponse {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub name: String,
    pub driver: String,
    pub mount_point: String,
    pub created_time: String,
    pub driver_info: BTreeMap<String, String>,
    pub snapshots: BTreeMap<String, SnapshotResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountResponse {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub mount_point: String,
}

impl Daemon {
    pub fn create_volume(&self, req: &VolumeCreateRequest) -> Result<VolumeResponse> {
        let mut indexes = self.write()?;

        if !req.name.is_empty() {
            util::check_name(&req.name)?;
            if let Some(existing) = indexes.names.get(&req.name) {
                return Err(Error::AlreadyExists(format!(
                    "name {} is already used by {}",
                    req.name, existing
                )));
            }
        }
        let (uuid, name) = loop {
            let uuid = util::new_uuid();
            let name = match req.name.as_str() {
                "" => format!("volume-{}", &uuid[..8]),
                name => name.to_string(),
            };
            if indexes.names.get(&name).is_none() {
                break (uuid, name);
            }
        };

        let driver_name = self.driver_for_create(req)?;
        let ops = self.driver(&driver_name)?.volumes()?;

        let mut opts = Opts::from([(OPT_VOLUME_NAME.to_string(), name.clone())]);
        for (key, value) in [
            (OPT_SIZE, &req.size),
            (OPT_BACKUP_URL, &req.backup_url),
            (OPT_VOLUME_DRIVER_ID, &req.driver_volume_id),
        ] {
            if !value.is_empty() {
                opts.insert(key.to_string(), value.clone());
            }
        }
        if req.prepare_for_vm {
            opts.insert(OPT_PREPARE_FOR_VM.to_string(), "true".to_string());
        }

        log::debug!("Creating volume {} ({}) on driver {}", uuid, name, driver_name);
        ops.create_volume(&uuid, &opts)?;

        let volume = Volume {
            uuid: uuid.clone(),
            name: name.clone(),
            driver_name: driver_name.clone(),
            created_time: util::now(),
            snapshots: BTreeMap::new(),
        };
        if let Err(e) = store::save(&self.root, &volume) {
            if let Err(rollback) = ops.delete_volume(&uuid, &Opts::new()) {
                log::warn!("Cannot roll back volume {}: {}", uuid, rollback);
            }
            return Err(e);
        }
        indexes.names.add(&name, &uuid)?;

        log::info!("Created volume {} ({}) on driver {}", uuid, name, driver_name);
        self.volume_response(&volume)
    }

    /// A restore must land on the driver that made the backup
    fn driver_for_create(&self, req: &VolumeCreateRequest) -> Result<String> {
        if !req.backup_url.is_empty() {
            let backup_volume = objectstore::load_volume(&req.backup_url)?;
            if !req.driver_name.is_empty() && req.driver_name != backup_volume.driver {
                return Err(Error::InvalidArgument(format!(
                    "backup {} belongs to driver {}, not {}",
                    req.backup_url, backup_volume.driver, req.driver_name
                )));
            }
            return Ok(backup_volume.driver);
        }
        Ok(match req.driver_name.as_str() {
            "" => self.config.default_driver.clone(),
            name => name.to_string(),
        })
    }

    pub fn delete_volume(&self, req: &VolumeDeleteRequest) -> Result<()> {
        let mut indexes = self.write()?;
        let volume = self.resolve_volume(&indexes, &req.volume)?;
        let ops = self.driver(&volume.driver_name)?.volumes()?;

        let opts = Opts::from([(
            OPT_REFERENCE_ONLY.to_string(),
            req.reference_only.to_string(),
        )]);
        ops.delete_volume(&volume.uuid, &opts)?;
        store::delete::<Volume>(&self.root, &volume.uuid)?;

        let mut forget = |key: &str| {
            if let Err(e) = indexes.names.remove(key) {
                log::warn!("Index out of sync for {}: {}", key, e);
            }
        };
        forget(&volume.name);
        for snapshot in volume.snapshots.values().filter(|s| !s.name.is_empty()) {
            forget(&snapshot.name);
        }
        for snapshot in volume.snapshots.keys() {
            let _ = indexes.snapshot_volumes.remove(snapshot);
        }

        log::info!("Deleted volume {} ({})", volume.uuid, volume.name);
        Ok(())
    }

    pub fn mount_volume(&self, req: &VolumeMountRequest) -> Result<MountResponse> {
        let indexes = self.write()?;
        let volume = self.resolve_volume(&indexes, &req.volume)?;
        let ops = self.driver(&volume.driver_name)?.volumes()?;

        let opts = Opts::from([(OPT_MOUNT_POINT.to_string(), req.mount_point.clone())]);
        let mount_point = ops.mount_volume(&volume.uuid, &opts)?;
        log::debug!("Volume {} mounted at {}", volume.uuid, mount_point);
        Ok(MountResponse {
            uuid: volume.uuid,
            mount_point,
        })
    }

    pub fn umount_volume(&self, req: &VolumeRequest) -> Result<()> {
        let indexes = self.write()?;
        let volume = self.resolve_volume(&indexes, &req.volume)?;
        self.driver(&volume.driver_name)?
            .volumes()?
            .umount_volume(&volume.uuid)?;
        log::debug!("Volume {} unmounted", volume.uuid);
        Ok(())
    }

    pub fn inspect_volume(&self, req: &VolumeRequest) -> Result<VolumeResponse> {
        let indexes = self.read()?;
        let volume = self.resolve_volume(&indexes, &req.volume)?;
        self.volume_response(&volume)
    }

    pub fn list_volumes(&self, req: &VolumeListRequest) -> Result<serde_json::Value> {
        let _indexes = self.read()?;

        if req.driver_specific {
            let mut result = BTreeMap::new();
            for (name, driver) in &self.drivers {
                let Ok(ops) = driver.volumes() else {
                    continue;
                };
                for (id, info) in ops.list_volumes(&Opts::new())? {
                    let mut info: BTreeMap<_, _> = info.into_iter().collect();
                    info.insert("Driver".to_string(), name.clone());
                    result.insert(id, info);
                }
            }
            return Ok(serde_json::to_value(result)?);
        }

        let mut result = BTreeMap::new();
        for id in store::list_ids::<Volume>(&self.root)? {
            let volume = self.load_volume(&id)?;
            result.insert(id, self.volume_response(&volume)?);
        }
        log::debug!("Listed {} volumes", result.len());
        Ok(serde_json::to_value(result)?)
    }

    pub(super) fn volume_response(&self, volume: &Volume) -> Result<VolumeResponse> {
        let ops = self.driver(&volume.driver_name)?.volumes()?;
        let mut driver_info: BTreeMap<_, _> =
            ops.get_volume_info(&volume.uuid)?.into_iter().collect();
        driver_info.insert("Driver".to_string(), volume.driver_name.clone());

        let mut snapshots = BTreeMap::new();
        for snapshot in volume.snapshots.values() {
            snapshots.insert(
                snapshot.uuid.clone(),
                self.snapshot_response(volume, snapshot)?,
            );
        }

        Ok(VolumeResponse {
            uuid: volume.uuid.clone(),
            name: volume.name.clone(),
            driver: volume.driver_name.clone(),
            mount_point: ops.mount_point(&volume.uuid)?,
            created_time: volume.created_time.clone(),
            driver_info,
            snapshots,
        })
    }

    pub(super) fn snapshot_response(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<SnapshotResponse> {
        let driver = self.driver(&volume.driver_name)?;
        let mut driver_info: BTreeMap<_, _> = match driver.snapshot_ops() {
            crate::driver::Capability::Supported(ops) => ops
                .get_snapshot_info(&snapshot.uuid, &volume.uuid)?
                .into_iter()
                .collect(),
            crate::driver::Capability::NotSupported => BTreeMap::new(),
        };
        driver_info.insert("Driver".to_string(), volume.driver_name.clone());

        Ok(SnapshotResponse {
            uuid: snapshot.uuid.clone(),
            volume_uuid: volume.uuid.clone(),
            volume_name: volume.name.clone(),
            name: snapshot.name.clone(),
            created_time: snapshot.created_time.clone(),
            driver_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create, options};
    use super::super::{SnapshotCreateRequest, SnapshotRequest};
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_create_names() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;

        let named = create(&daemon, "db")?;
        assert_eq!(named.name, "db");
        assert_eq!(named.driver, "vfs");
        assert!(util::is_uuid(&named.uuid));

        assert!(matches!(create(&daemon, "db"), Err(Error::AlreadyExists(_))));
        assert!(matches!(create(&daemon, "bad name"), Err(Error::InvalidArgument(_))));

        let unnamed = create(&daemon, "")?;
        assert_eq!(unnamed.name, format!("volume-{}", &unnamed.uuid[..8]));

        let other = daemon.create_volume(&VolumeCreateRequest {
            driver_name: "devicemapper".into(),
            ..Default::default()
        });
        assert!(matches!(other, Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_lookup_by_name_or_uuid() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let created = create(&daemon, "db")?;

        let by_name = daemon.inspect_volume(&VolumeRequest { volume: "db".into() })?;
        let by_uuid = daemon.inspect_volume(&VolumeRequest {
            volume: created.uuid.clone(),
        })?;
        assert_eq!(by_name, by_uuid);
        assert_eq!(by_name, created);

        for missing in ["nope", "../convoy", "00000000-0000-0000-0000-000000000000"] {
            assert!(matches!(
                daemon.inspect_volume(&VolumeRequest { volume: missing.into() }),
                Err(Error::NotFound(_))
            ));
        }
        assert!(matches!(
            daemon.inspect_volume(&VolumeRequest::default()),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mount_and_delete() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let created = create(&daemon, "db")?;

        let req = VolumeMountRequest {
            volume: "db".into(),
            ..Default::default()
        };
        let mounted = daemon.mount_volume(&req)?;
        assert_eq!(mounted.uuid, created.uuid);
        assert!(Path::new(&mounted.mount_point).is_dir());
        assert_eq!(daemon.mount_volume(&req)?, mounted);
        assert_eq!(
            daemon.inspect_volume(&VolumeRequest { volume: "db".into() })?.mount_point,
            mounted.mount_point
        );

        let delete = VolumeDeleteRequest {
            volume: "db".into(),
            reference_only: false,
        };
        assert!(matches!(daemon.delete_volume(&delete), Err(Error::Busy(_))));

        daemon.umount_volume(&VolumeRequest { volume: "db".into() })?;
        daemon.delete_volume(&delete)?;
        assert!(!Path::new(&mounted.mount_point).exists());
        assert!(matches!(
            daemon.inspect_volume(&VolumeRequest { volume: "db".into() }),
            Err(Error::NotFound(_))
        ));

        // The name is free again
        create(&daemon, "db")?;
        Ok(())
    }

    #[test]
    fn test_delete_with_snapshots() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        create(&daemon, "db")?;
        daemon.create_snapshot(&SnapshotCreateRequest {
            volume: "db".into(),
            name: "nightly".into(),
        })?;

        let delete = VolumeDeleteRequest {
            volume: "db".into(),
            reference_only: false,
        };
        assert!(matches!(daemon.delete_volume(&delete), Err(Error::HasChildren(_))));

        daemon.delete_snapshot(&SnapshotRequest {
            snapshot: "nightly".into(),
        })?;
        daemon.delete_volume(&delete)?;
        create(&daemon, "nightly")?;
        Ok(())
    }

    #[test]
    fn test_list_volumes() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let db = create(&daemon, "db")?;
        let web = create(&daemon, "web")?;

        let listed = daemon.list_volumes(&VolumeListRequest::default())?;
        assert_eq!(listed[&db.uuid]["Name"], "db");
        assert_eq!(listed[&web.uuid]["Driver"], "vfs");

        let raw = daemon.list_volumes(&VolumeListRequest {
            driver_specific: true,
        })?;
        assert_eq!(raw[&db.uuid]["Driver"], "vfs");
        assert_eq!(raw[&web.uuid]["Name"], "web");
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Daemon, Snapshot, VolumeRequest};
use crate::driver::{Opts, OPT_VOLUME_UUID};
use crate::error::{Error, Result};
use crate::store;
use crate::util;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SnapshotCreateRequest {
    pub volume: String,
    /// Optional; shares the namespace of volume names
    pub name: String,
}

/// A request naming one snapshot by name or uuid
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SnapshotRequest {
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotResponse {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "VolumeUUID")]
    pub volume_uuid: String,
    pub volume_name: String,
    pub name: String,
    pub created_time: String,
    pub driver_info: BTreeMap<String, String>,
}

impl Daemon {
    pub fn create_snapshot(&self, req: &SnapshotCreateRequest) -> Result<SnapshotResponse> {
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

        let mut volume = self.resolve_volume(&indexes, &req.volume)?;
        let ops = self.driver(&volume.driver_name)?.snapshots()?;

        let uuid = util::new_uuid();
        ops.create_snapshot(&uuid, &volume.uuid)?;

        let snapshot = Snapshot {
            uuid: uuid.clone(),
            volume_uuid: volume.uuid.clone(),
            name: req.name.clone(),
            created_time: util::now(),
        };
        volume.snapshots.insert(uuid.clone(), snapshot.clone());
        if let Err(e) = store::save(&self.root, &volume) {
            if let Err(rollback) = ops.delete_snapshot(&uuid, &volume.uuid) {
                log::warn!("Cannot roll back snapshot {}: {}", uuid, rollback);
            }
            return Err(e);
        }
        indexes.snapshot_volumes.add(&uuid, &volume.uuid)?;
        if !snapshot.name.is_empty() {
            indexes.names.add(&snapshot.name, &uuid)?;
        }

        log::info!(
            "Created snapshot {} ({}) of volume {}",
            uuid,
            snapshot.name,
            volume.uuid
        );
        self.snapshot_response(&volume, &snapshot)
    }

    pub fn delete_snapshot(&self, req: &SnapshotRequest) -> Result<()> {
        let mut indexes = self.write()?;
        let (mut volume, snapshot) = self.resolve_snapshot(&indexes, &req.snapshot)?;
        self.driver(&volume.driver_name)?
            .snapshots()?
            .delete_snapshot(&snapshot.uuid, &volume.uuid)?;

        volume.snapshots.remove(&snapshot.uuid);
        store::save(&self.root, &volume)?;
        indexes.snapshot_volumes.remove(&snapshot.uuid)?;
        if !snapshot.name.is_empty() {
            indexes.names.remove(&snapshot.name)?;
        }

        log::info!("Deleted snapshot {} of volume {}", snapshot.uuid, volume.uuid);
        Ok(())
    }

    pub fn inspect_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotResponse> {
        let indexes = self.read()?;
        let (volume, snapshot) = self.resolve_snapshot(&indexes, &req.snapshot)?;
        self.snapshot_response(&volume, &snapshot)
    }

    /// Snapshots the driver knows of for one volume, keyed by uuid
    pub fn list_snapshots(&self, req: &VolumeRequest) -> Result<BTreeMap<String, SnapshotResponse>> {
        let indexes = self.read()?;
        let volume = self.resolve_volume(&indexes, &req.volume)?;
        let known = self
            .driver(&volume.driver_name)?
            .snapshots()?
            .list_snapshots(&Opts::from([(OPT_VOLUME_UUID.to_string(), volume.uuid.clone())]))?;

        let mut result = BTreeMap::new();
        for snapshot in volume.snapshots.values() {
            if !known.contains_key(&snapshot.uuid) {
                log::warn!(
                    "Snapshot {} of volume {} is missing from driver {}",
                    snapshot.uuid,
                    volume.uuid,
                    volume.driver_name
                );
                continue;
            }
            result.insert(
                snapshot.uuid.clone(),
                self.snapshot_response(&volume, snapshot)?,
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create, options};
    use super::*;
    use tempfile::TempDir;

    fn snap(daemon: &Daemon, volume: &str, name: &str) -> Result<SnapshotResponse> {
        daemon.create_snapshot(&SnapshotCreateRequest {
            volume: volume.into(),
            name: name.into(),
        })
    }

    #[test]
    fn test_snapshot_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let volume = create(&daemon, "db")?;

        let created = snap(&daemon, "db", "nightly")?;
        assert_eq!(created.volume_uuid, volume.uuid);
        assert_eq!(created.volume_name, "db");
        assert_eq!(created.driver_info["Driver"], "vfs");

        let by_uuid = daemon.inspect_snapshot(&SnapshotRequest {
            snapshot: created.uuid.clone(),
        })?;
        assert_eq!(by_uuid, created);

        let inspected = daemon.inspect_volume(&VolumeRequest {
            volume: "db".into(),
        })?;
        assert_eq!(inspected.snapshots[&created.uuid], created);

        daemon.delete_snapshot(&SnapshotRequest {
            snapshot: "nightly".into(),
        })?;
        assert!(matches!(
            daemon.inspect_snapshot(&SnapshotRequest {
                snapshot: "nightly".into()
            }),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_snapshot_names_share_volume_namespace() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        create(&daemon, "db")?;

        assert!(matches!(snap(&daemon, "db", "db"), Err(Error::AlreadyExists(_))));
        let nightly = snap(&daemon, "db", "nightly")?;
        assert!(matches!(create(&daemon, "nightly"), Err(Error::AlreadyExists(_))));
        assert!(matches!(snap(&daemon, "db", "nightly"), Err(Error::AlreadyExists(_))));

        // A volume name does not resolve as a snapshot
        assert!(matches!(
            daemon.inspect_snapshot(&SnapshotRequest { snapshot: "db".into() }),
            Err(Error::NotFound(_))
        ));

        let unnamed = snap(&daemon, "db", "")?;
        assert!(unnamed.name.is_empty());
        let listed = daemon.list_snapshots(&VolumeRequest { volume: "db".into() })?;
        assert_eq!(listed.len(), 2);
        assert!(listed.contains_key(&nightly.uuid));
        Ok(())
    }

    #[test]
    fn test_snapshot_of_missing_volume() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        assert!(matches!(snap(&daemon, "ghost", "s1"), Err(Error::NotFound(_))));
        // The rejected name stays free
        create(&daemon, "s1")?;
        Ok(())
    }
}

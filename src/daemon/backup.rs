use serde::Deserialize;
use std::collections::BTreeMap;

use super::Daemon;
use crate::driver::{
    ConvoyDriver, Opts, OPT_SNAPSHOT_CREATED_TIME, OPT_SNAPSHOT_NAME, OPT_VOLUME_CREATED_TIME,
    OPT_VOLUME_NAME, OPT_VOLUME_UUID,
};
use crate::error::Result;
use crate::objectstore;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackupCreateRequest {
    pub snapshot: String,
    /// Destination object store, e.g. `s3://bucket@us-east-1/backups`
    #[serde(rename = "URL")]
    pub url: String,
}

/// A request naming one backup by its URL
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackupRequest {
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackupListRequest {
    #[serde(rename = "URL")]
    pub url: String,
    /// Restrict to one volume, by name or uuid
    pub volume: String,
}

type InfoMap = BTreeMap<String, String>;

impl Daemon {
    /// Back a snapshot up and return the backup URL
    pub fn create_backup(&self, req: &BackupCreateRequest) -> Result<String> {
        // Only name resolution holds the daemon lock; the driver serialises the rest
        let (volume, snapshot) = {
            let indexes = self.read()?;
            self.resolve_snapshot(&indexes, &req.snapshot)?
        };
        let ops = self.driver(&volume.driver_name)?.backups()?;

        let opts = Opts::from([
            (OPT_VOLUME_NAME.to_string(), volume.name.clone()),
            (OPT_VOLUME_CREATED_TIME.to_string(), volume.created_time.clone()),
            (OPT_SNAPSHOT_NAME.to_string(), snapshot.name.clone()),
            (OPT_SNAPSHOT_CREATED_TIME.to_string(), snapshot.created_time.clone()),
        ]);
        log::debug!(
            "Backing up snapshot {} of volume {} to {}",
            snapshot.uuid,
            volume.uuid,
            req.url
        );
        let url = ops.create_backup(&snapshot.uuid, &volume.uuid, &req.url, &opts)?;
        log::info!("Backed up snapshot {} to {}", snapshot.uuid, url);
        Ok(url)
    }

    pub fn delete_backup(&self, req: &BackupRequest) -> Result<()> {
        self.backup_driver(&req.url)?
            .backups()?
            .delete_backup(&req.url)?;
        log::info!("Deleted backup {}", req.url);
        Ok(())
    }

    pub fn inspect_backup(&self, req: &BackupRequest) -> Result<InfoMap> {
        let info = self
            .backup_driver(&req.url)?
            .backups()?
            .get_backup_info(&req.url)?;
        Ok(info.into_iter().collect())
    }

    /// Backups at `url` made by every driver that supports them
    pub fn list_backups(&self, req: &BackupListRequest) -> Result<BTreeMap<String, InfoMap>> {
        let volume_uuid = if req.volume.is_empty() {
            String::new()
        } else {
            let indexes = self.read()?;
            match self.resolve_volume(&indexes, &req.volume) {
                Ok(volume) => volume.uuid,
                // Backups outlive their local volume
                Err(_) => req.volume.clone(),
            }
        };
        let opts = Opts::from([(OPT_VOLUME_UUID.to_string(), volume_uuid)]);

        let mut result = BTreeMap::new();
        for driver in self.drivers.values() {
            let Ok(ops) = driver.backups() else {
                continue;
            };
            for (url, info) in ops.list_backups(&req.url, &opts)? {
                result.insert(url, info.into_iter().collect());
            }
        }
        Ok(result)
    }

    /// The driver recorded in the backup's volume index
    fn backup_driver(&self, backup_url: &str) -> Result<&dyn ConvoyDriver> {
        let volume = objectstore::load_volume(backup_url)?;
        self.driver(&volume.driver)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create, options};
    use super::super::{SnapshotCreateRequest, VolumeCreateRequest, VolumeRequest};
    use super::*;
    use crate::error::Error;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn backup_target(dir: &TempDir) -> String {
        let path = dir.path().join("backups");
        fs::create_dir_all(&path).unwrap();
        format!("vfs://{}", path.display())
    }

    #[test]
    fn test_backup_and_restore() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let target = backup_target(&dir);

        let volume = create(&daemon, "db")?;
        fs::write(Path::new(&volume.driver_info["Path"]).join("data"), b"rows")?;
        daemon.create_snapshot(&SnapshotCreateRequest {
            volume: "db".into(),
            name: "nightly".into(),
        })?;

        let url = daemon.create_backup(&BackupCreateRequest {
            snapshot: "nightly".into(),
            url: target.clone(),
        })?;
        let (backup, backup_volume, _) = objectstore::decode_backup_url(&url)?;
        assert_eq!(backup_volume, volume.uuid);
        assert!(!backup.is_empty());

        let info = daemon.inspect_backup(&BackupRequest { url: url.clone() })?;
        assert_eq!(info["DriverName"], "vfs");
        assert_eq!(info["SnapshotName"], backup);

        let listed = daemon.list_backups(&BackupListRequest {
            url: target.clone(),
            volume: "db".into(),
        })?;
        assert_eq!(listed.len(), 1);
        assert!(listed.values().all(|i| i["BackupName"] == backup));

        // The restore lands on the backup's driver
        let restored = daemon.create_volume(&VolumeCreateRequest {
            name: "db-restored".into(),
            backup_url: url.clone(),
            ..Default::default()
        })?;
        assert_eq!(restored.driver, "vfs");
        assert_eq!(
            fs::read(Path::new(&restored.driver_info["Path"]).join("data"))?,
            b"rows"
        );

        daemon.delete_backup(&BackupRequest { url: url.clone() })?;
        assert!(daemon.inspect_backup(&BackupRequest { url }).is_err());
        let listed = daemon.list_backups(&BackupListRequest {
            url: target,
            volume: String::new(),
        })?;
        assert!(listed.is_empty());
        Ok(())
    }

    #[test]
    fn test_backup_errors() -> Result<()> {
        let dir = TempDir::new()?;
        let daemon = Daemon::start(options(&dir))?;
        let target = backup_target(&dir);
        create(&daemon, "db")?;

        assert!(matches!(
            daemon.create_backup(&BackupCreateRequest {
                snapshot: "missing".into(),
                url: target.clone(),
            }),
            Err(Error::NotFound(_))
        ));
        assert!(daemon
            .inspect_backup(&BackupRequest {
                url: format!("{}?backup=b&volume=v", target),
            })
            .is_err());
        assert!(matches!(
            daemon.create_volume(&VolumeCreateRequest {
                backup_url: "vfs:///nowhere".into(),
                ..Default::default()
            }),
            Err(_)
        ));
        assert!(daemon.inspect_volume(&VolumeRequest { volume: "db".into() }).is_ok());
        Ok(())
    }
}

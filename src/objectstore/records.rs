//! On-store layout: volume index, backup manifests and backup URLs
//!
//! ```text
//! convoy-objectstore/volumes/<n0n1>/<n2n3>/<volume>/volume.cfg
//!                                                   backups/backup_<name>.cfg
//!                                                   blocks/<c0c1>/<c2c3>/<checksum>.blk
//!                                                   BackupFiles/<name>.bak
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};
use url::Url;

use super::{get_driver, read_json, write_json, ObjectStoreDriver};
use crate::error::{Error, Result};
use crate::util;

const OBJECTSTORE_BASE: &str = "convoy-objectstore";
const VOLUME_SEPARATE_LAYER1: usize = 2;
const VOLUME_SEPARATE_LAYER2: usize = 4;
const VOLUME_DIRECTORY: &str = "volumes";
const VOLUME_CONFIG_FILE: &str = "volume.cfg";
const BACKUP_DIRECTORY: &str = "backups";
const BACKUP_CONFIG_PREFIX: &str = "backup_";
const CFG_SUFFIX: &str = ".cfg";
pub(crate) const BLOCKS_DIRECTORY: &str = "blocks";
pub(crate) const BLK_SUFFIX: &str = ".blk";
pub(crate) const BACKUP_FILES_DIRECTORY: &str = "BackupFiles";

/// Per-volume index at the destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupVolume {
    pub name: String,
    pub driver: String,
    pub size: i64,
    pub created_time: String,
    #[serde(default)]
    pub last_backup_name: String,
    /// Snapshots that currently have a backup
    #[serde(default)]
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockMapping {
    pub offset: i64,
    pub block_checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupFile {
    pub file_path: String,
}

/// Backup manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Backup {
    pub name: String,
    pub driver: String,
    pub volume_name: String,
    pub snapshot_name: String,
    pub snapshot_created_at: String,
    pub created_time: String,
    pub size: i64,
    #[serde(default)]
    pub block_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot_name: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockMapping>,
    #[serde(default)]
    pub single_file: BackupFile,
}

/// Source volume description handed to the backup engines
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub size: i64,
    pub created_time: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_time: String,
}

pub(crate) fn volume_path(volume_name: &str) -> String {
    let mut padded = volume_name.to_string();
    while padded.chars().count() < VOLUME_SEPARATE_LAYER2 {
        padded.push('!');
    }
    let chars: Vec<char> = padded.chars().collect();
    let layer1: String = chars[..VOLUME_SEPARATE_LAYER1].iter().collect();
    let layer2: String = chars[VOLUME_SEPARATE_LAYER1..VOLUME_SEPARATE_LAYER2]
        .iter()
        .collect();
    format!(
        "{}/{}/{}/{}/{}",
        OBJECTSTORE_BASE, VOLUME_DIRECTORY, layer1, layer2, volume_name
    )
}

fn volume_config_path(volume_name: &str) -> String {
    format!("{}/{}", volume_path(volume_name), VOLUME_CONFIG_FILE)
}

fn backup_dir(volume_name: &str) -> String {
    format!("{}/{}", volume_path(volume_name), BACKUP_DIRECTORY)
}

fn backup_config_path(backup_name: &str, volume_name: &str) -> String {
    format!(
        "{}/{}{}{}",
        backup_dir(volume_name),
        BACKUP_CONFIG_PREFIX,
        backup_name,
        CFG_SUFFIX
    )
}

pub(crate) fn block_path(volume_name: &str, checksum: &str) -> String {
    let shard1 = checksum.get(..2).unwrap_or("00");
    let shard2 = checksum.get(2..4).unwrap_or("00");
    format!(
        "{}/{}/{}/{}/{}{}",
        volume_path(volume_name),
        BLOCKS_DIRECTORY,
        shard1,
        shard2,
        checksum,
        BLK_SUFFIX
    )
}

pub(crate) fn single_file_path(volume_name: &str, backup_name: &str) -> String {
    format!(
        "{}/{}/{}.bak",
        volume_path(volume_name),
        BACKUP_FILES_DIRECTORY,
        backup_name
    )
}

pub(crate) fn volume_exists(volume_name: &str, driver: &dyn ObjectStoreDriver) -> bool {
    driver.file_exists(&volume_config_path(volume_name))
}

/// Create the volume index unless it already exists
pub(crate) fn add_volume(volume: &BackupVolume, driver: &dyn ObjectStoreDriver) -> Result<()> {
    if volume_exists(&volume.name, driver) {
        return Ok(());
    }
    save_volume(volume, driver)?;
    log::info!("Added backup volume {} to {}", volume.name, driver.url());
    Ok(())
}

pub(crate) fn load_volume_config(
    volume_name: &str,
    driver: &dyn ObjectStoreDriver,
) -> Result<BackupVolume> {
    read_json(driver, &volume_config_path(volume_name))
}

pub(crate) fn save_volume(volume: &BackupVolume, driver: &dyn ObjectStoreDriver) -> Result<()> {
    write_json(driver, &volume_config_path(&volume.name), volume)
}

pub(crate) fn load_backup(
    backup_name: &str,
    volume_name: &str,
    driver: &dyn ObjectStoreDriver,
) -> Result<Backup> {
    read_json(driver, &backup_config_path(backup_name, volume_name))
}

pub(crate) fn save_backup(backup: &Backup, driver: &dyn ObjectStoreDriver) -> Result<()> {
    let path = backup_config_path(&backup.name, &backup.volume_name);
    write_json(driver, &path, backup)?;
    log::debug!("Saved manifest {}", path);
    Ok(())
}

pub(crate) fn remove_backup(backup: &Backup, driver: &dyn ObjectStoreDriver) -> Result<()> {
    let path = backup_config_path(&backup.name, &backup.volume_name);
    driver.remove(&[&path])?;
    log::debug!("Removed manifest {}", path);
    Ok(())
}

/// Names of every manifest of `volume_name`
pub(crate) fn backup_names(volume_name: &str, driver: &dyn ObjectStoreDriver) -> Result<Vec<String>> {
    let names = match driver.list(&backup_dir(volume_name)) {
        Ok(names) => names,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = util::extract_names(&names, BACKUP_CONFIG_PREFIX, CFG_SUFFIX);
    names.sort();
    Ok(names)
}

/// Every volume with an index at the destination
fn volume_names(driver: &dyn ObjectStoreDriver) -> Result<Vec<String>> {
    let root = format!("{}/{}", OBJECTSTORE_BASE, VOLUME_DIRECTORY);
    let list_or_empty = |path: &str| -> Result<Vec<String>> {
        match driver.list(path) {
            Ok(names) => Ok(names),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    };

    let mut names = Vec::new();
    for layer1 in list_or_empty(&root)? {
        let layer1_path = format!("{}/{}", root, layer1);
        for layer2 in list_or_empty(&layer1_path)? {
            let layer2_path = format!("{}/{}", layer1_path, layer2);
            for name in list_or_empty(&layer2_path)? {
                if volume_exists(&name, driver) {
                    names.push(name);
                }
            }
        }
    }
    names.sort();
    Ok(names)
}

/// `<dest>?backup=<name>&volume=<volume>`
pub fn encode_backup_url(backup_name: &str, volume_name: &str, dest_url: &str) -> Result<String> {
    let mut url = Url::parse(dest_url)
        .map_err(|e| Error::InvalidArgument(format!("invalid URL {}: {}", dest_url, e)))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("backup", backup_name)
        .append_pair("volume", volume_name);
    Ok(url.to_string())
}

/// Split a backup URL into (backup name, volume name, destination URL)
pub fn decode_backup_url(backup_url: &str) -> Result<(String, String, String)> {
    let mut url = Url::parse(backup_url)
        .map_err(|e| Error::InvalidArgument(format!("invalid backup URL {}: {}", backup_url, e)))?;
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();

    let backup = pairs.get("backup").filter(|v| !v.is_empty()).cloned();
    let volume = pairs.get("volume").filter(|v| !v.is_empty()).cloned();
    let (Some(backup), Some(volume)) = (backup, volume) else {
        return Err(Error::InvalidArgument(format!(
            "backup URL {} must name both backup and volume",
            backup_url
        )));
    };

    url.set_query(None);
    Ok((backup, volume, url.to_string()))
}

/// Volume index referenced by a backup URL
pub fn load_volume(backup_url: &str) -> Result<BackupVolume> {
    let (_, volume_name, dest_url) = decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    load_volume_config(&volume_name, driver.as_ref())
}

fn fill_backup_info(backup: &Backup, volume: &BackupVolume, dest_url: &str) -> Result<HashMap<String, String>> {
    let url = encode_backup_url(&backup.name, &volume.name, dest_url)?;
    Ok(HashMap::from([
        ("BackupURL".to_string(), url),
        ("BackupName".to_string(), backup.name.clone()),
        ("DriverName".to_string(), volume.driver.clone()),
        ("VolumeName".to_string(), volume.name.clone()),
        ("VolumeSize".to_string(), volume.size.to_string()),
        ("VolumeCreatedAt".to_string(), volume.created_time.clone()),
        ("SnapshotName".to_string(), backup.snapshot_name.clone()),
        ("SnapshotCreatedAt".to_string(), backup.snapshot_created_at.clone()),
        ("CreatedTime".to_string(), backup.created_time.clone()),
        ("Size".to_string(), backup.size.to_string()),
    ]))
}

/// Attributes of the backup behind `backup_url`
pub fn get_backup_info(backup_url: &str) -> Result<HashMap<String, String>> {
    let (backup_name, volume_name, dest_url) = decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    let volume = load_volume_config(&volume_name, driver.as_ref())?;
    let backup = load_backup(&backup_name, &volume_name, driver.as_ref())?;
    fill_backup_info(&backup, &volume, &driver.url())
}

/// Backups at `dest_url` made by `driver_name`, for one volume or all
pub fn list(
    volume_name: Option<&str>,
    dest_url: &str,
    driver_name: &str,
) -> Result<HashMap<String, HashMap<String, String>>> {
    let driver = get_driver(dest_url)?;
    let volumes = match volume_name {
        Some(name) if !name.is_empty() => {
            if !volume_exists(name, driver.as_ref()) {
                return Ok(HashMap::new());
            }
            vec![name.to_string()]
        }
        _ => volume_names(driver.as_ref())?,
    };

    let mut result = HashMap::new();
    for name in volumes {
        let volume = load_volume_config(&name, driver.as_ref())?;
        if volume.driver != driver_name {
            continue;
        }
        for backup_name in backup_names(&name, driver.as_ref())? {
            let backup = load_backup(&backup_name, &name, driver.as_ref())?;
            let info = fill_backup_info(&backup, &volume, &driver.url())?;
            if let Some(url) = info.get("BackupURL").cloned() {
                result.insert(url, info);
            }
        }
    }
    Ok(result)
}

/// Volumes at some destination with a backup being written or deleted
static LOCKED_VOLUMES: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());
static VOLUME_RELEASED: Condvar = Condvar::new();

/// Exclusive hold on one volume's backups at one destination
///
/// Block uploads, manifest writes and the sweep of unreferenced blocks all run
/// under it, so a delete never removes a block a concurrent backup relies on.
pub(crate) struct VolumeLock {
    key: String,
}

pub(crate) fn lock_volume(volume_name: &str, driver: &dyn ObjectStoreDriver) -> Result<VolumeLock> {
    fn poisoned<T>(_: T) -> Error {
        Error::Backend("backup volume lock poisoned".into())
    }
    let key = format!("{}/{}", driver.url(), volume_path(volume_name));

    let mut locked = LOCKED_VOLUMES.lock().map_err(poisoned)?;
    while locked.contains(&key) {
        log::debug!("Waiting for backup lock on {}", key);
        locked = VOLUME_RELEASED.wait(locked).map_err(poisoned)?;
    }
    locked.insert(key.clone());
    Ok(VolumeLock { key })
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        let mut locked = match LOCKED_VOLUMES.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        locked.remove(&self.key);
        VOLUME_RELEASED.notify_all();
    }
}

//! Backups that ship a snapshot as one opaque file

use std::path::{Path, PathBuf};

use super::deltablock::forget_backup;
use super::records::{
    self, add_volume, load_backup, load_volume_config, lock_volume, remove_backup, save_backup,
    save_volume, single_file_path, Backup, BackupFile, BackupVolume, SnapshotInfo, VolumeInfo,
};
use super::get_driver;
use crate::error::{Error, Result};
use crate::util;

/// Upload `file` as the backup of `snapshot`, returning the backup URL
pub fn create_single_file_backup(
    volume: &VolumeInfo,
    snapshot: &SnapshotInfo,
    file: &Path,
    dest_url: &str,
) -> Result<String> {
    let driver = get_driver(dest_url)?;
    let driver = driver.as_ref();
    let _lock = lock_volume(&volume.name, driver)?;

    add_volume(
        &BackupVolume {
            name: volume.name.clone(),
            driver: volume.driver.clone(),
            size: volume.size,
            created_time: volume.created_time.clone(),
            ..Default::default()
        },
        driver,
    )?;
    let mut backup_volume = load_volume_config(&volume.name, driver)?;

    let path = single_file_path(&volume.name, &snapshot.name);
    driver.upload(file, &path)?;
    log::debug!("Uploaded {} to {}", file.display(), path);

    let size = std::fs::metadata(file)?.len() as i64;
    let backup = Backup {
        name: snapshot.name.clone(),
        driver: volume.driver.clone(),
        volume_name: volume.name.clone(),
        snapshot_name: snapshot.name.clone(),
        snapshot_created_at: snapshot.created_time.clone(),
        created_time: util::now(),
        size,
        single_file: BackupFile { file_path: path },
        ..Default::default()
    };
    save_backup(&backup, driver)?;

    backup_volume.last_backup_name = backup.name.clone();
    if !backup_volume.snapshots.contains(&snapshot.name) {
        backup_volume.snapshots.push(snapshot.name.clone());
    }
    save_volume(&backup_volume, driver)?;

    log::info!(
        "Created single file backup {} of volume {}",
        backup.name,
        volume.name
    );
    records::encode_backup_url(&backup.name, &volume.name, &driver.url())
}

/// Download the backup file into `dest_dir`, returning its local path
pub fn restore_single_file_backup(backup_url: &str, dest_dir: &Path) -> Result<PathBuf> {
    let (backup_name, volume_name, dest_url) = records::decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    let driver = driver.as_ref();

    let backup = load_backup(&backup_name, &volume_name, driver)?;
    let remote = &backup.single_file.file_path;
    if remote.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "backup {} is not a single file backup",
            backup_url
        )));
    }

    let file_name = Path::new(remote)
        .file_name()
        .ok_or_else(|| Error::Corrupt(format!("bad backup file path {}", remote)))?;
    let dest = dest_dir.join(file_name);
    driver.download(remote, &dest)?;
    Ok(dest)
}

pub fn delete_single_file_backup(backup_url: &str) -> Result<()> {
    let (backup_name, volume_name, dest_url) = records::decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    let driver = driver.as_ref();
    let _lock = lock_volume(&volume_name, driver)?;

    let mut volume = load_volume_config(&volume_name, driver)?;
    let backup = load_backup(&backup_name, &volume_name, driver)?;
    if backup.single_file.file_path.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "backup {} is not a single file backup",
            backup_url
        )));
    }

    driver.remove(&[&backup.single_file.file_path])?;
    remove_backup(&backup, driver)?;
    forget_backup(&mut volume, &backup, driver)?;
    log::info!("Deleted single file backup {}", backup_url);
    Ok(())
}

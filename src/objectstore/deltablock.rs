//! Incremental, content-addressed block backups
//!
//! The storage driver reports which byte ranges changed between two snapshots.
//! Those ranges are cut into fixed backup blocks; each non-zero block is stored
//! once under its BLAKE3 checksum, and the manifest lists `(offset, checksum)`
//! for the whole snapshot. Manifests are always complete (the previous
//! manifest is merged in), so restore never walks a chain.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use super::records::{
    self, add_volume, backup_names, block_path, load_backup, load_volume_config, lock_volume,
    remove_backup, save_backup, save_volume, volume_path, Backup, BackupVolume, BlockMapping, SnapshotInfo,
    VolumeInfo,
};
use super::{get_driver, read_all, write_all, ObjectStoreDriver};
use crate::error::{Error, Result};
use crate::util;

/// Granularity of stored backup blocks
pub const BACKUP_BLOCK_SIZE: i64 = 4096;

const MARKER_RAW: u8 = 0x00;
const MARKER_LZ4: u8 = 0x01;

/// One changed byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub offset: i64,
    pub size: i64,
}

/// Changed ranges between two snapshots, in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mappings {
    /// Device block size in bytes; every mapping is aligned to it
    pub block_size: i64,
    pub mappings: Vec<Mapping>,
}

/// Snapshot access a storage driver provides to the backup engine
pub trait DeltaBlockOperations: Send + Sync {
    fn has_snapshot(&self, id: &str, volume_id: &str) -> bool;

    /// Ranges that differ between `id` and `compare_id`; an empty or identical
    /// `compare_id` yields the full map of `id`
    fn compare_snapshot(&self, id: &str, compare_id: &str, volume_id: &str) -> Result<Mappings>;

    fn open_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;

    fn read_snapshot(&self, id: &str, volume_id: &str, offset: i64, buf: &mut [u8]) -> Result<()>;

    fn close_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;
}

pub struct DeltaBackupConfig<'a> {
    pub volume: VolumeInfo,
    pub snapshot: SnapshotInfo,
    pub dest_url: String,
    pub delta_ops: &'a dyn DeltaBlockOperations,
}

/// Closes the snapshot when the backup finishes, successfully or not
struct OpenSnapshot<'a> {
    ops: &'a dyn DeltaBlockOperations,
    snapshot: &'a str,
    volume: &'a str,
}

impl Drop for OpenSnapshot<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.close_snapshot(self.snapshot, self.volume) {
            log::warn!(
                "Failed to close snapshot {} of volume {}: {}",
                self.snapshot,
                self.volume,
                e
            );
        }
    }
}

pub(crate) fn encode_block(data: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(data);
    let mut stored = Vec::with_capacity(compressed.len().min(data.len()) + 1);
    if compressed.len() < data.len() {
        stored.push(MARKER_LZ4);
        stored.extend_from_slice(&compressed);
    } else {
        stored.push(MARKER_RAW);
        stored.extend_from_slice(data);
    }
    stored
}

/// Hex BLAKE3 digest naming a block object
pub(crate) fn block_checksum(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

pub(crate) fn decode_block(stored: &[u8], checksum: &str) -> Result<Vec<u8>> {
    let (marker, payload) = stored
        .split_first()
        .ok_or_else(|| Error::Corrupt(format!("empty block {}", checksum)))?;
    let data = match *marker {
        MARKER_RAW => payload.to_vec(),
        MARKER_LZ4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::Corrupt(format!("block {}: {}", checksum, e)))?,
        other => {
            return Err(Error::Corrupt(format!(
                "block {} has unknown marker {:#04x}",
                checksum, other
            )))
        }
    };
    let actual = block_checksum(&data);
    if actual != checksum {
        return Err(Error::Corrupt(format!(
            "block checksum mismatch: expected {}, got {}",
            checksum, actual
        )));
    }
    Ok(data)
}

/// Previous manifest entries outside the changed ranges, plus the new entries.
///
/// `previous` is sorted by offset, as every saved manifest is. One pass over
/// each input after sorting the ranges and the delta.
fn merge_block_maps(
    previous: &[BlockMapping],
    changed: &[Mapping],
    mut delta: Vec<BlockMapping>,
) -> Vec<BlockMapping> {
    let mut ranges: Vec<(i64, i64)> = changed
        .iter()
        .map(|m| (m.offset, m.offset + m.size))
        .collect();
    ranges.sort_unstable();
    let mut ranges = ranges.into_iter().peekable();
    let kept = previous.iter().filter(|b| {
        while ranges.next_if(|&(_, end)| end <= b.offset).is_some() {}
        !matches!(ranges.peek(), Some(&(start, _)) if start <= b.offset)
    });

    delta.sort_by_key(|b| b.offset);
    let mut delta = delta.into_iter().peekable();
    let mut merged = Vec::with_capacity(previous.len() + delta.len());
    for block in kept {
        while let Some(new) = delta.next_if(|d| d.offset <= block.offset) {
            merged.push(new);
        }
        if merged.last().map_or(true, |m: &BlockMapping| m.offset != block.offset) {
            merged.push(block.clone());
        }
    }
    merged.extend(delta);
    merged.dedup_by_key(|b| b.offset);
    merged
}

/// Back up `config.snapshot` to `config.dest_url`, returning the backup URL
pub fn create_delta_block_backup(config: &DeltaBackupConfig<'_>) -> Result<String> {
    let volume = &config.volume;
    let snapshot = &config.snapshot;
    let ops = config.delta_ops;

    let driver = get_driver(&config.dest_url)?;
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
    if backup_volume.driver != volume.driver {
        return Err(Error::InvalidArgument(format!(
            "volume {} at {} was backed up by driver {}, not {}",
            volume.name,
            driver.url(),
            backup_volume.driver,
            volume.driver
        )));
    }

    let existing = load_backup(&snapshot.name, &volume.name, driver).ok();

    // Incremental only when the last backup is of another snapshot that still
    // exists locally and whose manifest is readable
    let last = backup_volume.last_backup_name.clone();
    let previous = if last.is_empty() || last == snapshot.name {
        None
    } else if !ops.has_snapshot(&last, &volume.name) {
        log::info!(
            "Previous snapshot {} of volume {} is gone, doing full backup",
            last,
            volume.name
        );
        None
    } else {
        match load_backup(&last, &volume.name, driver) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("Cannot load manifest {} ({}), doing full backup", last, e);
                None
            }
        }
    };

    ops.open_snapshot(&snapshot.name, &volume.name)?;
    let _guard = OpenSnapshot {
        ops,
        snapshot: &snapshot.name,
        volume: &volume.name,
    };

    let compare_id = previous
        .as_ref()
        .map(|p| p.snapshot_name.as_str())
        .unwrap_or(snapshot.name.as_str());
    let delta = ops.compare_snapshot(&snapshot.name, compare_id, &volume.name)?;
    if delta.block_size <= 0 || delta.block_size % BACKUP_BLOCK_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "device block size {} is not a multiple of backup block size {}",
            delta.block_size, BACKUP_BLOCK_SIZE
        )));
    }

    log::info!(
        "Backing up snapshot {} of volume {} to {} ({} ranges, {})",
        snapshot.name,
        volume.name,
        driver.url(),
        delta.mappings.len(),
        if previous.is_some() { "incremental" } else { "full" }
    );

    let mut new_blocks = Vec::new();
    let mut uploaded = 0usize;
    let mut buf = vec![0u8; delta.block_size as usize];
    for mapping in &delta.mappings {
        if mapping.offset % delta.block_size != 0 || mapping.size % delta.block_size != 0 {
            return Err(Error::Corrupt(format!(
                "range {}+{} is not aligned to block size {}",
                mapping.offset, mapping.size, delta.block_size
            )));
        }
        let mut offset = mapping.offset;
        while offset < mapping.offset + mapping.size {
            ops.read_snapshot(&snapshot.name, &volume.name, offset, &mut buf)?;
            for (i, chunk) in buf.chunks(BACKUP_BLOCK_SIZE as usize).enumerate() {
                if chunk.iter().all(|&b| b == 0) {
                    continue;
                }
                let checksum = block_checksum(chunk);
                let path = block_path(&volume.name, &checksum);
                if driver.file_size(&path) < 0 {
                    write_all(driver, &path, &encode_block(chunk))?;
                    uploaded += 1;
                }
                new_blocks.push(BlockMapping {
                    offset: offset + i as i64 * BACKUP_BLOCK_SIZE,
                    block_checksum: checksum,
                });
            }
            offset += delta.block_size;
        }
    }

    let blocks = match &previous {
        Some(prev) => merge_block_maps(&prev.blocks, &delta.mappings, new_blocks),
        None => {
            new_blocks.sort_by_key(|b| b.offset);
            new_blocks
        }
    };

    let backup = Backup {
        name: snapshot.name.clone(),
        driver: volume.driver.clone(),
        volume_name: volume.name.clone(),
        snapshot_name: snapshot.name.clone(),
        snapshot_created_at: snapshot.created_time.clone(),
        created_time: existing
            .as_ref()
            .map(|b| b.created_time.clone())
            .unwrap_or_else(util::now),
        size: volume.size,
        block_size: BACKUP_BLOCK_SIZE,
        previous_snapshot_name: match &existing {
            Some(b) => b.previous_snapshot_name.clone(),
            None => previous.as_ref().map(|p| p.snapshot_name.clone()),
        },
        blocks,
        single_file: Default::default(),
    };
    save_backup(&backup, driver)?;

    backup_volume.last_backup_name = backup.name.clone();
    if !backup_volume.snapshots.contains(&snapshot.name) {
        backup_volume.snapshots.push(snapshot.name.clone());
    }
    save_volume(&backup_volume, driver)?;

    log::info!(
        "Backup {} of volume {} complete: {} blocks, {} uploaded",
        backup.name,
        volume.name,
        backup.blocks.len(),
        uploaded
    );
    records::encode_backup_url(&backup.name, &volume.name, &driver.url())
}

/// Write the backup behind `backup_url` into the device or file `dest`
pub fn restore_delta_block_backup(backup_url: &str, dest: &Path) -> Result<()> {
    let (backup_name, volume_name, dest_url) = records::decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    let driver = driver.as_ref();

    let volume = load_volume_config(&volume_name, driver)?;
    let backup = load_backup(&backup_name, &volume_name, driver)?;
    if backup.blocks.is_empty() && !backup.single_file.file_path.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "backup {} is a single file backup",
            backup_url
        )));
    }

    let mut file = OpenOptions::new().write(true).create(true).open(dest)?;
    if file.metadata()?.is_file() {
        file.set_len(volume.size.max(backup.size) as u64)?;
    }

    for block in &backup.blocks {
        let stored = read_all(driver, &block_path(&volume_name, &block.block_checksum))?;
        let data = decode_block(&stored, &block.block_checksum)?;
        file.seek(SeekFrom::Start(block.offset as u64))?;
        file.write_all(&data)?;
    }
    file.sync_all()?;

    log::info!(
        "Restored backup {} of volume {} into {} ({} blocks)",
        backup_name,
        volume_name,
        dest.display(),
        backup.blocks.len()
    );
    Ok(())
}

/// Remove a backup and every block no other manifest of the volume references
pub fn delete_delta_block_backup(backup_url: &str) -> Result<()> {
    let (backup_name, volume_name, dest_url) = records::decode_backup_url(backup_url)?;
    let driver = get_driver(&dest_url)?;
    let driver = driver.as_ref();
    let _lock = lock_volume(&volume_name, driver)?;

    let mut volume = load_volume_config(&volume_name, driver)?;
    let backup = load_backup(&backup_name, &volume_name, driver)?;

    let mut discard: HashSet<String> = backup
        .blocks
        .iter()
        .map(|b| b.block_checksum.clone())
        .collect();

    remove_backup(&backup, driver)?;
    forget_backup(&mut volume, &backup, driver)?;

    let remaining = backup_names(&volume_name, driver)?;
    if remaining.is_empty() {
        log::info!("No backups left for volume {}, removing it", volume_name);
        if let Err(e) = driver.remove(&[&volume_path(&volume_name)]) {
            log::warn!("Failed to remove volume {} from {}: {}", volume_name, driver.url(), e);
        }
        return Ok(());
    }

    for name in remaining {
        let other = load_backup(&name, &volume_name, driver)?;
        for block in &other.blocks {
            discard.remove(&block.block_checksum);
        }
        if discard.is_empty() {
            break;
        }
    }

    let paths: Vec<String> = discard
        .iter()
        .map(|checksum| block_path(&volume_name, checksum))
        .collect();
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    driver.remove(&refs)?;

    log::info!(
        "Deleted backup {} of volume {}, removed {} unreferenced blocks",
        backup_name,
        volume_name,
        refs.len()
    );
    Ok(())
}

/// Drop `backup` from the volume index
pub(crate) fn forget_backup(
    volume: &mut BackupVolume,
    backup: &Backup,
    driver: &dyn ObjectStoreDriver,
) -> Result<()> {
    if volume.last_backup_name == backup.name {
        volume.last_backup_name.clear();
    }
    volume.snapshots.retain(|s| s != &backup.snapshot_name);
    save_volume(volume, driver)
}

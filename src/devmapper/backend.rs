//! Kernel side of the thin pool
//!
//! [`DmsetupBackend`] drives device-mapper through `dmsetup`, `blockdev` and
//! `pdata_tools`. Tests use a backend whose thin devices are plain files.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::util::{self, execute};

pub const DM_DIR: &str = "/dev/mapper";
pub const SECTOR_SIZE: i64 = 512;

const THIN_PROVISION_TOOLS_BINARY: &str = "pdata_tools";
const THIN_PROVISION_TOOLS_MIN_VERSION: &str = "0.5";
/// Low water mark of the pool, in blocks
const POOL_LOW_WATER_MARK: u32 = 32768;

/// Thin pool and thin device operations
pub trait DmBackend: Send + Sync {
    /// Verify the host has the tools this backend needs
    fn check_environment(&self) -> Result<()> {
        Ok(())
    }

    /// Size in bytes of a block device
    fn device_size(&self, device: &str) -> Result<i64>;

    fn pool_exists(&self, pool: &str) -> bool;

    fn create_pool(
        &self,
        pool: &str,
        data_device: &str,
        metadata_device: &str,
        data_size: i64,
        block_sectors: u32,
    ) -> Result<()>;

    fn remove_pool(&self, pool: &str) -> Result<()>;

    /// Allocate thin device `dev_id` in the pool
    fn create_device(&self, pool: &str, dev_id: u32) -> Result<()>;

    /// Allocate `dev_id` as a snapshot of the active device `origin`
    fn create_snap_device(&self, pool: &str, dev_id: u32, origin: &str, origin_dev_id: u32) -> Result<()>;

    /// Free thin device `dev_id`; it must not be active
    fn delete_device(&self, pool: &str, dev_id: u32) -> Result<()>;

    /// Expose `dev_id` as `<DM_DIR>/<name>`
    fn activate_device(&self, pool: &str, name: &str, dev_id: u32, size: i64) -> Result<()>;

    fn deactivate_device(&self, name: &str) -> Result<()>;

    fn device_path(&self, name: &str) -> PathBuf;

    /// Raw `thin_delta` output comparing two devices of the pool
    fn thin_delta(&self, pool: &str, metadata_device: &str, dev_a: u32, dev_b: u32) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct DmsetupBackend;

impl DmsetupBackend {
    fn pool_path(pool: &str) -> String {
        format!("{}/{}", DM_DIR, pool)
    }

    fn message(pool: &str, msg: &str) -> Result<()> {
        execute("dmsetup", &["message", &Self::pool_path(pool), "0", msg])?;
        Ok(())
    }
}

impl DmBackend for DmsetupBackend {
    fn check_environment(&self) -> Result<()> {
        util::check_binary_version(
            THIN_PROVISION_TOOLS_BINARY,
            THIN_PROVISION_TOOLS_MIN_VERSION,
            &["thin_delta", "-V"],
        )
    }

    fn device_size(&self, device: &str) -> Result<i64> {
        let output = execute("blockdev", &["--getsize64", device])?;
        output
            .trim()
            .parse()
            .map_err(|_| Error::Backend(format!("unexpected size {:?} for {}", output.trim(), device)))
    }

    fn pool_exists(&self, pool: &str) -> bool {
        Path::new(&Self::pool_path(pool)).exists()
    }

    fn create_pool(
        &self,
        pool: &str,
        data_device: &str,
        metadata_device: &str,
        data_size: i64,
        block_sectors: u32,
    ) -> Result<()> {
        let table = format!(
            "0 {} thin-pool {} {} {} {} 1 skip_block_zeroing",
            data_size / SECTOR_SIZE,
            metadata_device,
            data_device,
            block_sectors,
            POOL_LOW_WATER_MARK
        );
        execute("dmsetup", &["create", pool, "--table", &table])?;
        log::info!("Created thin pool {} ({} bytes)", pool, data_size);
        Ok(())
    }

    fn remove_pool(&self, pool: &str) -> Result<()> {
        execute("dmsetup", &["remove", pool])?;
        Ok(())
    }

    fn create_device(&self, pool: &str, dev_id: u32) -> Result<()> {
        Self::message(pool, &format!("create_thin {}", dev_id))
    }

    fn create_snap_device(&self, pool: &str, dev_id: u32, origin: &str, origin_dev_id: u32) -> Result<()> {
        let origin_active = Path::new(DM_DIR).join(origin).exists();
        if origin_active {
            execute("dmsetup", &["suspend", origin])?;
        }
        let result = Self::message(pool, &format!("create_snap {} {}", dev_id, origin_dev_id));
        if origin_active {
            execute("dmsetup", &["resume", origin])?;
        }
        result
    }

    fn delete_device(&self, pool: &str, dev_id: u32) -> Result<()> {
        Self::message(pool, &format!("delete {}", dev_id))
    }

    fn activate_device(&self, pool: &str, name: &str, dev_id: u32, size: i64) -> Result<()> {
        let table = format!(
            "0 {} thin {} {}",
            size / SECTOR_SIZE,
            Self::pool_path(pool),
            dev_id
        );
        execute("dmsetup", &["create", name, "--table", &table])?;
        Ok(())
    }

    fn deactivate_device(&self, name: &str) -> Result<()> {
        execute("dmsetup", &["remove", name])?;
        Ok(())
    }

    fn device_path(&self, name: &str) -> PathBuf {
        Path::new(DM_DIR).join(name)
    }

    fn thin_delta(&self, pool: &str, metadata_device: &str, dev_a: u32, dev_b: u32) -> Result<String> {
        Self::message(pool, "reserve_metadata_snap")?;
        let result = execute(
            THIN_PROVISION_TOOLS_BINARY,
            &[
                "thin_delta",
                "--snap1",
                &dev_a.to_string(),
                "--snap2",
                &dev_b.to_string(),
                "-m",
                metadata_device,
            ],
        );
        if let Err(e) = Self::message(pool, "release_metadata_snap") {
            log::warn!("Failed to release metadata snapshot of {}: {}", pool, e);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Thin pool emulated with one sparse file per thin device

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::fs::{self, OpenOptions};
    use std::sync::Mutex;

    pub struct FileBackend {
        dir: PathBuf,
        pub block_bytes: Mutex<i64>,
        pools: Mutex<HashSet<String>>,
        /// dev id -> backing file
        devices: Mutex<HashMap<u32, PathBuf>>,
        /// active name -> dev id
        active: Mutex<HashMap<String, u32>>,
        pub fail_activate: Mutex<bool>,
        pub data_size: i64,
    }

    impl FileBackend {
        pub fn new(dir: &Path, data_size: i64) -> Self {
            Self {
                dir: dir.to_path_buf(),
                block_bytes: Mutex::new(0),
                pools: Mutex::new(HashSet::new()),
                devices: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                fail_activate: Mutex::new(false),
                data_size,
            }
        }

        fn dev_file(&self, dev_id: u32) -> PathBuf {
            self.dir.join(format!("thin-{}", dev_id))
        }

        pub fn device_ids(&self) -> Vec<u32> {
            let mut ids: Vec<u32> = self.devices.lock().unwrap().keys().copied().collect();
            ids.sort();
            ids
        }

        pub fn is_active(&self, name: &str) -> bool {
            self.active.lock().unwrap().contains_key(name)
        }

        /// Forget activations, as after a reboot
        pub fn reboot(&self) {
            for (name, _) in self.active.lock().unwrap().drain() {
                let _ = fs::remove_file(self.dir.join("mapper").join(name));
            }
            self.pools.lock().unwrap().clear();
        }
    }

    impl DmBackend for FileBackend {
        fn device_size(&self, _device: &str) -> Result<i64> {
            Ok(self.data_size)
        }

        fn pool_exists(&self, pool: &str) -> bool {
            self.pools.lock().unwrap().contains(pool)
        }

        fn create_pool(&self, pool: &str, _data: &str, _meta: &str, _size: i64, block_sectors: u32) -> Result<()> {
            *self.block_bytes.lock().unwrap() = block_sectors as i64 * SECTOR_SIZE;
            self.pools.lock().unwrap().insert(pool.to_string());
            fs::create_dir_all(self.dir.join("mapper"))?;
            Ok(())
        }

        fn remove_pool(&self, pool: &str) -> Result<()> {
            self.pools.lock().unwrap().remove(pool);
            Ok(())
        }

        fn create_device(&self, _pool: &str, dev_id: u32) -> Result<()> {
            let mut devices = self.devices.lock().unwrap();
            if devices.contains_key(&dev_id) {
                return Err(Error::Backend(format!("device id {} exists", dev_id)));
            }
            let path = self.dev_file(dev_id);
            fs::File::create(&path)?;
            devices.insert(dev_id, path);
            Ok(())
        }

        fn create_snap_device(&self, _pool: &str, dev_id: u32, _origin: &str, origin_dev_id: u32) -> Result<()> {
            let mut devices = self.devices.lock().unwrap();
            let origin = devices
                .get(&origin_dev_id)
                .cloned()
                .ok_or_else(|| Error::Backend(format!("no device {}", origin_dev_id)))?;
            let path = self.dev_file(dev_id);
            fs::copy(origin, &path)?;
            devices.insert(dev_id, path);
            Ok(())
        }

        fn delete_device(&self, _pool: &str, dev_id: u32) -> Result<()> {
            if self.active.lock().unwrap().values().any(|&id| id == dev_id) {
                return Err(Error::Busy(format!("device {} is active", dev_id)));
            }
            let path = self
                .devices
                .lock()
                .unwrap()
                .remove(&dev_id)
                .ok_or_else(|| Error::Backend(format!("no device {}", dev_id)))?;
            fs::remove_file(path)?;
            Ok(())
        }

        fn activate_device(&self, _pool: &str, name: &str, dev_id: u32, size: i64) -> Result<()> {
            if *self.fail_activate.lock().unwrap() {
                return Err(Error::Backend("activation failed".into()));
            }
            let file = self
                .devices
                .lock()
                .unwrap()
                .get(&dev_id)
                .cloned()
                .ok_or_else(|| Error::Backend(format!("no device {}", dev_id)))?;
            let f = OpenOptions::new().write(true).open(&file)?;
            if f.metadata()?.len() < size as u64 {
                f.set_len(size as u64)?;
            }
            let link = self.device_path(name);
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(&file, &link)?;
            self.active.lock().unwrap().insert(name.to_string(), dev_id);
            Ok(())
        }

        fn deactivate_device(&self, name: &str) -> Result<()> {
            self.active.lock().unwrap().remove(name);
            let _ = fs::remove_file(self.device_path(name));
            Ok(())
        }

        fn device_path(&self, name: &str) -> PathBuf {
            self.dir.join("mapper").join(name)
        }

        fn thin_delta(&self, _pool: &str, _meta: &str, dev_a: u32, dev_b: u32) -> Result<String> {
            let block = *self.block_bytes.lock().unwrap() as usize;
            let read = |id: u32| -> Result<Vec<u8>> {
                let path = self
                    .devices
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::Backend(format!("no device {}", id)))?;
                Ok(fs::read(path)?)
            };
            let a = read(dev_a)?;
            let b = read(dev_b)?;

            // A block counts as provisioned when it holds data
            let mapped = |data: &[u8], i: usize| -> Option<Vec<u8>> {
                let chunk = data.get(i * block..((i + 1) * block).min(data.len()))?;
                chunk.iter().any(|&x| x != 0).then(|| chunk.to_vec())
            };

            let blocks = a.len().max(b.len()).div_ceil(block);
            let mut out = format!("<diff left=\"{}\" right=\"{}\">\n", dev_a, dev_b);
            for i in 0..blocks {
                let tag = match (mapped(&a, i), mapped(&b, i)) {
                    (None, None) => continue,
                    (Some(x), Some(y)) if x == y => "same",
                    (Some(_), Some(_)) => "different",
                    (Some(_), None) => "left_only",
                    (None, Some(_)) => "right_only",
                };
                out.push_str(&format!("  <{} begin=\"{}\" length=\"1\"/>\n", tag, i));
            }
            out.push_str("</diff>\n");
            Ok(out)
        }
    }
}

//! Object store abstraction used as the backup target
//!
//! A backend is selected by URL scheme (`vfs:///path`, `s3://bucket@region/path`)
//! from a static table. All paths handed to a backend are relative to the
//! base path encoded in its URL.

pub mod deltablock;
pub mod records;
pub mod s3;
pub mod singlefile;
pub mod vfs;

use std::io::Read;
use std::path::Path;

use url::Url;

use crate::error::{Error, Result};

pub use deltablock::{
    create_delta_block_backup, delete_delta_block_backup, restore_delta_block_backup,
    DeltaBackupConfig, DeltaBlockOperations, Mapping, Mappings,
};
pub use records::{
    decode_backup_url, encode_backup_url, get_backup_info, list, load_volume, Backup,
    BackupVolume, SnapshotInfo, VolumeInfo,
};
pub use singlefile::{
    create_single_file_backup, delete_single_file_backup, restore_single_file_backup,
};

/// Blob-level I/O against one backup destination
pub trait ObjectStoreDriver: Send + Sync {
    /// URL scheme of this backend
    fn kind(&self) -> &str;

    /// Destination URL this driver was created from (no query)
    fn url(&self) -> String;

    /// Names of the immediate children of `path`
    fn list(&self, path: &str) -> Result<Vec<String>>;

    fn file_exists(&self, path: &str) -> bool {
        self.file_size(path) >= 0
    }

    /// Size of the object at `path`, -1 if it does not exist
    fn file_size(&self, path: &str) -> i64;

    /// Remove objects and everything below them
    fn remove(&self, paths: &[&str]) -> Result<()>;

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn write(&self, path: &str, data: &mut dyn Read) -> Result<()>;

    fn upload(&self, src: &Path, path: &str) -> Result<()>;

    fn download(&self, path: &str, dest: &Path) -> Result<()>;
}

type InitFn = fn(&Url) -> Result<Box<dyn ObjectStoreDriver>>;

struct Backend {
    kind: &'static str,
    init: InitFn,
}

static BACKENDS: &[Backend] = &[
    Backend {
        kind: vfs::KIND,
        init: vfs::init,
    },
    Backend {
        kind: s3::KIND,
        init: s3::init,
    },
];

/// Schemes with a registered backend
pub fn kinds() -> Vec<&'static str> {
    BACKENDS.iter().map(|b| b.kind).collect()
}

/// Open the backend for `dest_url`, probing it with a listing of the base path
pub fn get_driver(dest_url: &str) -> Result<Box<dyn ObjectStoreDriver>> {
    let mut url = Url::parse(dest_url)
        .map_err(|e| Error::InvalidArgument(format!("invalid URL {}: {}", dest_url, e)))?;
    url.set_query(None);

    let backend = BACKENDS
        .iter()
        .find(|b| b.kind == url.scheme())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unsupported object store kind {}, expected one of {:?}",
                url.scheme(),
                kinds()
            ))
        })?;

    let driver = (backend.init)(&url)?;
    driver.list("").map_err(|e| match e {
        Error::NotFound(m) => Error::InvalidArgument(format!("destination {} unusable: {}", dest_url, m)),
        other => other,
    })?;
    log::debug!("Loaded object store driver {} for {}", backend.kind, driver.url());
    Ok(driver)
}

/// Read a whole object into memory
pub fn read_all(driver: &dyn ObjectStoreDriver, path: &str) -> Result<Vec<u8>> {
    let mut reader = driver.read(path)?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn write_all(driver: &dyn ObjectStoreDriver, path: &str, data: &[u8]) -> Result<()> {
    let mut cursor = std::io::Cursor::new(data);
    driver.write(path, &mut cursor)
}

pub fn read_json<T: serde::de::DeserializeOwned>(
    driver: &dyn ObjectStoreDriver,
    path: &str,
) -> Result<T> {
    let data = read_all(driver, path)?;
    serde_json::from_slice(&data).map_err(|e| Error::Corrupt(format!("{}: {}", path, e)))
}

pub fn write_json<T: serde::Serialize>(
    driver: &dyn ObjectStoreDriver,
    path: &str,
    value: &T,
) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_all(driver, path, &data)
}

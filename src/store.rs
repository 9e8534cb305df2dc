//! Local record persistence
//!
//! Every persisted entity (driver config, volume record, daemon config) is one
//! JSON file under a root directory. File names are `<prefix><id><suffix>`, so
//! listing the ids of one record type is a directory scan.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// An entity persisted as a single JSON file
pub trait Record: Serialize + DeserializeOwned {
    /// File name prefix shared by all records of this type
    const PREFIX: &'static str;

    /// File name suffix shared by all records of this type
    const SUFFIX: &'static str;

    /// Stable identifier of this record ("" for singletons such as driver configs)
    fn id(&self) -> &str;

    fn file_name(id: &str) -> String {
        format!("{}{}{}", Self::PREFIX, id, Self::SUFFIX)
    }

    fn config_file(&self, root: &Path) -> PathBuf {
        root.join(Self::file_name(self.id()))
    }
}

/// Path of the record with `id` under `root`
pub fn path_of<R: Record>(root: &Path, id: &str) -> PathBuf {
    root.join(R::file_name(id))
}

pub fn exists<R: Record>(root: &Path, id: &str) -> bool {
    path_of::<R>(root, id).exists()
}

/// Load a record, `NotFound` if absent and `Corrupt` if it does not decode
pub fn load<R: Record>(root: &Path, id: &str) -> Result<R> {
    let path = path_of::<R>(root, id);
    load_file(&path)
}

pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("{}", path.display())));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&content)
        .map_err(|e| Error::Corrupt(format!("{}: {}", path.display(), e)))
}

/// Atomically replace the record on disk
pub fn save<R: Record>(root: &Path, record: &R) -> Result<()> {
    save_file(&record.config_file(root), record)
}

pub fn save_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_path_for(path);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    log::debug!("Saved record {}", path.display());
    Ok(())
}

/// Remove a record; an absent record is `NotFound`
pub fn delete<R: Record>(root: &Path, id: &str) -> Result<()> {
    let path = path_of::<R>(root, id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NotFound(format!("{}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

/// Ids of every record of type `R` under `root`
pub fn list_ids<R: Record>(root: &Path) -> Result<Vec<String>> {
    list_config_ids(root, R::PREFIX, R::SUFFIX)
}

/// Ids of every file named `<prefix><id><suffix>` in `root`, sorted
pub fn list_config_ids(root: &Path, prefix: &str, suffix: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(id) = crate::util::extract_name(name, prefix, suffix) {
            ids.push(id.to_string());
        }
    }

    ids.sort();
    Ok(ids)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp.{:08x}", rand::random::<u32>()));
    path.with_file_name(name)
}

//! Object store on a local or network-mounted directory (`vfs:///path`)

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use url::Url;

use super::ObjectStoreDriver;
use crate::error::{Error, Result};

pub const KIND: &str = "vfs";

/// Empty parent directories are pruned at most this many levels up
const MAX_CLEANUP_LEVEL: usize = 10;

pub struct VfsObjectStore {
    base: PathBuf,
}

pub fn init(url: &Url) -> Result<Box<dyn ObjectStoreDriver>> {
    if url.host_str().is_some_and(|h| !h.is_empty()) {
        return Err(Error::InvalidArgument(format!(
            "vfs URL {} must not have a host",
            url
        )));
    }
    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|e| Error::InvalidArgument(format!("vfs URL {} path: {}", url, e)))?;
    if path.is_empty() || path == "/" {
        return Err(Error::InvalidArgument(format!("vfs URL {} has no path", url)));
    }
    Ok(Box::new(VfsObjectStore::new(&*path)?))
}

impl VfsObjectStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".tmp.{:08x}", rand::random::<u32>()));
        path.with_file_name(name)
    }

    /// Copy `reader` into `dest` via a temporary file and rename
    fn write_atomic(&self, dest: &Path, reader: &mut dyn Read) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = Self::tmp_path(dest);
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            io::copy(reader, &mut file)?;
            file.sync_all()?;
            fs::rename(&tmp, dest)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove empty directories above `path`, never touching the base
    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        for _ in 0..MAX_CLEANUP_LEVEL {
            let Some(d) = dir else { break };
            if d == self.base || !d.starts_with(&self.base) {
                break;
            }
            // Fails on non-empty directories, which ends the walk
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

impl ObjectStoreDriver for VfsObjectStore {
    fn kind(&self) -> &str {
        KIND
    }

    fn url(&self) -> String {
        format!("{}://{}", KIND, self.base.display())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.full_path(path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{}", dir.display())));
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.contains(".tmp.") {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn file_size(&self, path: &str) -> i64 {
        match fs::metadata(self.full_path(path)) {
            Ok(meta) if meta.is_file() => meta.len() as i64,
            _ => -1,
        }
    }

    fn remove(&self, paths: &[&str]) -> Result<()> {
        for path in paths {
            let full = self.full_path(path);
            let result = match fs::symlink_metadata(&full) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full),
                Ok(_) => fs::remove_file(&full),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
            result?;
            self.prune_empty_parents(&full);
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.full_path(path);
        match File::open(&full) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{}", full.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, data: &mut dyn Read) -> Result<()> {
        self.write_atomic(&self.full_path(path), data)
    }

    fn upload(&self, src: &Path, path: &str) -> Result<()> {
        let mut file = File::open(src)?;
        self.write_atomic(&self.full_path(path), &mut file)
    }

    fn download(&self, path: &str, dest: &Path) -> Result<()> {
        let mut reader = self.read(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(dest)?;
        io::copy(&mut reader, &mut file)?;
        file.flush()?;
        Ok(())
    }
}

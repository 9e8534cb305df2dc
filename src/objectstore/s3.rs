//! S3 object store (`s3://bucket[@region]/path`)
//!
//! Backed by the `object_store` crate. Credentials come from the standard AWS
//! environment variables. Calls are driven to completion on a private
//! current-thread runtime so the rest of the daemon stays synchronous.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::runtime::Runtime;
use url::Url;

use super::ObjectStoreDriver;
use crate::error::{Error, Result};

pub const KIND: &str = "s3";

pub struct S3ObjectStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    region: Option<String>,
    path: String,
    runtime: Runtime,
}

/// Bucket, optional region and base path of an `s3://` URL
pub fn parse_url(url: &Url) -> Result<(String, Option<String>, String)> {
    let host = url.host_str().unwrap_or("");
    let (bucket, region) = if url.username().is_empty() {
        (host.to_string(), None)
    } else {
        (url.username().to_string(), Some(host.to_string()).filter(|r| !r.is_empty()))
    };
    let path = url.path().trim_start_matches('/').trim_end_matches('/').to_string();

    if bucket.is_empty() {
        return Err(Error::InvalidArgument(format!("S3 URL {} has no bucket", url)));
    }
    if path.is_empty() {
        return Err(Error::InvalidArgument(format!("S3 URL {} has no path", url)));
    }
    Ok((bucket, region, path))
}

pub fn init(url: &Url) -> Result<Box<dyn ObjectStoreDriver>> {
    let (bucket, region, path) = parse_url(url)?;

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
    if let Some(region) = &region {
        builder = builder.with_region(region);
    }
    let store = builder
        .build()
        .map_err(|e| Error::InvalidArgument(format!("cannot configure S3 for {}: {}", url, e)))?;

    Ok(Box::new(S3ObjectStore::with_store(
        Arc::new(store),
        bucket,
        region,
        path,
    )?))
}

fn map_err(e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { path, .. } => Error::NotFound(path),
        object_store::Error::InvalidPath { source } => Error::InvalidArgument(source.to_string()),
        object_store::Error::PermissionDenied { path, source }
        | object_store::Error::Unauthenticated { path, source } => {
            Error::Backend(format!("access denied for {}: {}", path, source))
        }
        other => Error::Transient(other.to_string()),
    }
}

impl S3ObjectStore {
    /// Wrap an existing store, rooting every path at `path`
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        region: Option<String>,
        path: String,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            store,
            bucket,
            region,
            path,
            runtime,
        })
    }

    fn key(&self, path: &str) -> ObjectPath {
        let path = path.trim_matches('/');
        if path.is_empty() {
            ObjectPath::from(self.path.as_str())
        } else {
            ObjectPath::from(format!("{}/{}", self.path, path))
        }
    }

    fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.key(path);
        self.runtime.block_on(async {
            let result = self.store.get(&key).await.map_err(map_err)?;
            let bytes = result.bytes().await.map_err(map_err)?;
            Ok(bytes.to_vec())
        })
    }

    fn put_bytes(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let key = self.key(path);
        self.runtime.block_on(async {
            self.store
                .put(&key, PutPayload::from(data))
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }
}

impl ObjectStoreDriver for S3ObjectStore {
    fn kind(&self) -> &str {
        KIND
    }

    fn url(&self) -> String {
        match &self.region {
            Some(region) => format!("{}://{}@{}/{}", KIND, self.bucket, region, self.path),
            None => format!("{}://{}/{}", KIND, self.bucket, self.path),
        }
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = self.key(path);
        self.runtime.block_on(async {
            let result = self
                .store
                .list_with_delimiter(Some(&prefix))
                .await
                .map_err(map_err)?;
            let mut names: Vec<String> = result
                .common_prefixes
                .iter()
                .filter_map(|p| p.filename().map(str::to_string))
                .collect();
            names.extend(
                result
                    .objects
                    .iter()
                    .filter_map(|o| o.location.filename().map(str::to_string)),
            );
            Ok(names)
        })
    }

    fn file_size(&self, path: &str) -> i64 {
        let key = self.key(path);
        self.runtime
            .block_on(self.store.head(&key))
            .map(|meta| meta.size as i64)
            .unwrap_or(-1)
    }

    fn remove(&self, paths: &[&str]) -> Result<()> {
        for path in paths {
            let key = self.key(path);
            self.runtime.block_on(async {
                let mut doomed: Vec<ObjectPath> = self
                    .store
                    .list(Some(&key))
                    .map_ok(|meta| meta.location)
                    .try_collect()
                    .await
                    .map_err(map_err)?;
                doomed.push(key.clone());

                for location in doomed {
                    match self.store.delete(&location).await {
                        Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                        Err(e) => return Err(map_err(e)),
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.get_bytes(path)?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn write(&self, path: &str, data: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        self.put_bytes(path, buf)
    }

    fn upload(&self, src: &Path, path: &str) -> Result<()> {
        let data = std::fs::read(src)?;
        self.put_bytes(path, data)
    }

    fn download(&self, path: &str, dest: &Path) -> Result<()> {
        let data = self.get_bytes(path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, data)?;
        Ok(())
    }
}

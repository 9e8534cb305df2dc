//! Docker volume plugin endpoints
//!
//! Docker addresses volumes by name only and expects every reply as HTTP 200
//! with a failure carried in `Err`. Removal keeps the backend volume, since
//! the same backend volume is often shared with other hosts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{
    Daemon, Volume, VolumeCreateRequest, VolumeDeleteRequest, VolumeMountRequest, VolumeRequest,
};
use crate::error::{Error, Result};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOp {
    Create,
    Remove,
    Mount,
    Unmount,
    Path,
    Get,
    List,
}

impl PluginOp {
    pub const ALL: [PluginOp; 7] = [
        PluginOp::Create,
        PluginOp::Remove,
        PluginOp::Mount,
        PluginOp::Unmount,
        PluginOp::Path,
        PluginOp::Get,
        PluginOp::List,
    ];
}

impl fmt::Display for PluginOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginOp::Create => "Create",
            PluginOp::Remove => "Remove",
            PluginOp::Mount => "Mount",
            PluginOp::Unmount => "Unmount",
            PluginOp::Path => "Path",
            PluginOp::Get => "Get",
            PluginOp::List => "List",
        };
        write!(f, "VolumeDriver.{}", name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PluginRequest {
    pub name: String,
    pub opts: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginVolume {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<PluginVolume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<PluginVolume>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
    /// Uuid of a volume this request created
    #[serde(skip)]
    pub created: Option<String>,
}

impl PluginResponse {
    pub fn error(error: &Error) -> Self {
        Self {
            err: error.to_string(),
            ..Default::default()
        }
    }
}

impl PluginRequest {
    fn create_request(&self) -> Result<VolumeCreateRequest> {
        let opt = |key: &str| self.opts.get(key).cloned().unwrap_or_default();
        let prepare_for_vm = match self.opts.get("vm").map(String::as_str) {
            None | Some("") => false,
            Some(value) => value
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("vm option {} is not a bool", value)))?,
        };
        Ok(VolumeCreateRequest {
            name: self.name.clone(),
            driver_name: opt("driver"),
            size: opt("size"),
            backup_url: opt("backup"),
            driver_volume_id: opt("id"),
            prepare_for_vm,
        })
    }
}

impl Daemon {
    /// Answer one Docker plugin call
    pub fn plugin(&self, op: PluginOp, req: &PluginRequest) -> Result<PluginResponse> {
        log::debug!("{} for {:?}", op, req.name);
        match op {
            PluginOp::Create => self.docker_create(req),
            PluginOp::Remove => self.docker_remove(req),
            PluginOp::Mount => self.docker_mount(req),
            PluginOp::Unmount => self.docker_unmount(req),
            PluginOp::Path => self.docker_path(req),
            PluginOp::Get => self.docker_get(req),
            PluginOp::List => self.docker_list(),
        }
    }

    /// Undo what a plugin call did once its caller stopped waiting
    pub(crate) fn roll_back_plugin(
        &self,
        op: PluginOp,
        req: &PluginRequest,
        response: &PluginResponse,
    ) -> Result<()> {
        if op == PluginOp::Mount && !response.mountpoint.is_empty() {
            self.umount_volume(&VolumeRequest {
                volume: req.name.clone(),
            })?;
        }
        if let Some(uuid) = &response.created {
            self.delete_volume(&VolumeDeleteRequest {
                volume: uuid.clone(),
                reference_only: false,
            })?;
        }
        Ok(())
    }

    /// The volume Docker calls `name`, if there is one
    fn docker_volume(&self, name: &str) -> Result<Option<Volume>> {
        util::check_name(name)?;
        let indexes = self.read()?;
        let Some(uuid) = indexes.names.get(name) else {
            return Ok(None);
        };
        match self.load_volume(uuid) {
            Ok(volume) => Ok(Some(volume)),
            Err(Error::NotFound(_)) => Err(Error::InvalidArgument(format!(
                "{} names a snapshot, not a volume",
                name
            ))),
            Err(e) => Err(e),
        }
    }

    fn docker_create(&self, req: &PluginRequest) -> Result<PluginResponse> {
        if let Some(volume) = self.docker_volume(&req.name)? {
            log::debug!("Found volume {} ({}) for docker", volume.uuid, volume.name);
            return Ok(PluginResponse::default());
        }
        let created = self.create_volume(&req.create_request()?)?;
        log::info!("Created volume {} ({}) for docker", created.uuid, created.name);
        Ok(PluginResponse {
            created: Some(created.uuid),
            ..Default::default()
        })
    }

    fn docker_remove(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let Some(volume) = self.docker_volume(&req.name)? else {
            log::info!("No volume {}, nothing to remove", req.name);
            return Ok(PluginResponse::default());
        };
        if self.config.ignore_docker_delete {
            log::debug!("Ignoring docker remove of volume {} ({})", volume.uuid, volume.name);
            return Ok(PluginResponse::default());
        }
        self.delete_volume(&VolumeDeleteRequest {
            volume: volume.uuid.clone(),
            reference_only: true,
        })?;
        log::debug!("Removed volume {} ({}) for docker", volume.uuid, volume.name);
        Ok(PluginResponse::default())
    }

    fn docker_mount(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let (volume, created) = match self.docker_volume(&req.name)? {
            Some(volume) => (volume.uuid, None),
            None if self.config.create_on_docker_mount => {
                let created = self.create_volume(&req.create_request()?)?;
                log::info!("Created volume {} ({}) on docker mount", created.uuid, created.name);
                (created.uuid.clone(), Some(created.uuid))
            }
            None => return Err(Error::NotFound(format!("volume {}", req.name))),
        };
        let mounted = self.mount_volume(&VolumeMountRequest {
            volume,
            mount_point: String::new(),
        });
        let mounted = match mounted {
            Ok(mounted) => mounted,
            Err(e) => {
                if let Some(uuid) = &created {
                    if let Err(rollback) = self.delete_volume(&VolumeDeleteRequest {
                        volume: uuid.clone(),
                        reference_only: false,
                    }) {
                        log::warn!("Cannot roll back volume {}: {}", uuid, rollback);
                    }
                }
                return Err(e);
            }
        };
        Ok(PluginResponse {
            mountpoint: mounted.mount_point,
            created,
            ..Default::default()
        })
    }

    fn docker_unmount(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let Some(volume) = self.docker_volume(&req.name)? else {
            log::info!("No volume {}, nothing to unmount", req.name);
            return Ok(PluginResponse::default());
        };
        self.umount_volume(&VolumeRequest {
            volume: volume.uuid,
        })?;
        Ok(PluginResponse::default())
    }

    fn docker_path(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let volume = self
            .docker_volume(&req.name)?
            .ok_or_else(|| Error::NotFound(format!("volume {}", req.name)))?;
        Ok(PluginResponse {
            mountpoint: self.docker_mount_point(&volume)?,
            ..Default::default()
        })
    }

    fn docker_get(&self, req: &PluginRequest) -> Result<PluginResponse> {
        let volume = self
            .docker_volume(&req.name)?
            .ok_or_else(|| Error::NotFound(format!("volume {}", req.name)))?;
        Ok(PluginResponse {
            volume: Some(PluginVolume {
                mountpoint: self.docker_mount_point(&volume)?,
                name: volume.name,
            }),
            ..Default::default()
        })
    }

    fn docker_list(&self) -> Result<PluginResponse> {
        let _indexes = self.read()?;
        let mut volumes = Vec::new();
        for id in crate::store::list_ids::<Volume>(&self.root)? {
            let volume = self.load_volume(&id)?;
            volumes.push(PluginVolume {
                mountpoint: self.docker_mount_point(&volume)?,
                name: volume.name,
            });
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(PluginResponse {
            volumes: Some(volumes),
            ..Default::default()
        })
    }

    fn docker_mount_point(&self, volume: &Volume) -> Result<String> {
        self.driver(&volume.driver_name)?
            .volumes()?
            .mount_point(&volume.uuid)
    }
}

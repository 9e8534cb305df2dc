//! Convoy volume daemon
//!
//! Manages persistent volumes through pluggable storage drivers: a
//! device-mapper thin pool, plain directories, DigitalOcean block storage and
//! Longhorn replica stacks. Snapshots can be backed up to an object store
//! (`vfs://` or `s3://`), incrementally for block drivers.

pub mod config;
pub mod daemon;
pub mod devmapper;
pub mod digitalocean;
pub mod driver;
pub mod error;
pub mod longhorn;
pub mod objectstore;
pub mod store;
pub mod util;
pub mod vfs;

pub use config::{Config, DaemonConfig};
pub use daemon::{Command, Daemon, DaemonOptions};
pub use driver::{Capability, ConvoyDriver};
pub use error::{Error, Result};

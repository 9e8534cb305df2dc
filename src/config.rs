//! Configuration file parsing
//!
//! Two layers: an optional TOML file given with `--config`, and the daemon
//! record `convoy.cfg` persisted under the root on first start.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::driver::{self, Opts};
use crate::store::Record;
use crate::util;

/// Commands may not be given less time than this
pub const MIN_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::InvalidArgument(e.to_string())
    }
}

/// Contents of the `--config` file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Driver options per driver, e.g. `[drivers.devicemapper]`
    #[serde(default)]
    pub drivers: BTreeMap<String, BTreeMap<String, String>>,
}

/// `[daemon]` table; every key mirrors a command-line flag
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DaemonSection {
    pub root: Option<String>,
    pub drivers: Option<Vec<String>>,
    pub socket: Option<String>,
    pub debug: Option<bool>,
    pub log: Option<String>,
    pub mnt_ns: Option<String>,
    pub ignore_docker_delete: Option<bool>,
    pub create_on_docker_mount: Option<bool>,
    pub cmd_timeout: Option<String>,
}

/// Parse a command timeout, rejecting anything under a minute
pub fn parse_cmd_timeout(value: &str) -> Result<Duration, ConfigError> {
    let timeout = util::parse_duration(value)
        .map_err(|e| ConfigError::Invalid(format!("cmd timeout {:?}: {}", value, e)))?;
    if timeout < MIN_CMD_TIMEOUT {
        return Err(ConfigError::Invalid(format!(
            "cmd timeout {} is below the minimum of 1m",
            value
        )));
    }
    Ok(timeout)
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(drivers) = &self.daemon.drivers {
            if drivers.is_empty() {
                return Err(ConfigError::Invalid("driver list is empty".into()));
            }
            for name in drivers {
                if !driver::is_registered(name) {
                    return Err(ConfigError::Invalid(format!("unknown driver {}", name)));
                }
            }
        }
        for name in self.drivers.keys() {
            if !driver::is_registered(name) {
                return Err(ConfigError::Invalid(format!(
                    "options given for unknown driver {}",
                    name
                )));
            }
        }
        if let Some(timeout) = &self.daemon.cmd_timeout {
            parse_cmd_timeout(timeout)?;
        }
        Ok(())
    }

    /// Options of every `[drivers.*]` table, flattened into one map
    pub fn driver_opts(&self) -> Opts {
        self.drivers
            .values()
            .flat_map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// Daemon record persisted as `<root>/convoy.cfg`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DaemonConfig {
    pub root: String,
    pub driver_list: Vec<String>,
    pub default_driver: String,
    #[serde(rename = "MountNamespaceFD")]
    pub mount_namespace_fd: String,
    pub ignore_docker_delete: bool,
    pub create_on_docker_mount: bool,
    /// Human duration such as "1m" or "2m30s"
    pub cmd_timeout: String,
}

impl Record for DaemonConfig {
    const PREFIX: &'static str = "convoy";
    const SUFFIX: &'static str = ".cfg";

    fn id(&self) -> &str {
        ""
    }
}

impl DaemonConfig {
    pub fn cmd_timeout(&self) -> Result<Duration, ConfigError> {
        if self.cmd_timeout.is_empty() {
            return Ok(util::DEFAULT_CMD_TIMEOUT);
        }
        parse_cmd_timeout(&self.cmd_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[daemon]
root = "/var/lib/convoy"
drivers = ["devicemapper", "vfs"]
debug = true
cmd-timeout = "2m30s"

[drivers.devicemapper]
"dm.datadev" = "/dev/sdb"
"dm.metadatadev" = "/dev/sdc"

[drivers.vfs]
"vfs.path" = "/opt/volumes"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.daemon.root.as_deref(), Some("/var/lib/convoy"));
        assert_eq!(config.daemon.debug, Some(true));
        let opts = config.driver_opts();
        assert_eq!(opts["dm.datadev"], "/dev/sdb");
        assert_eq!(opts["vfs.path"], "/opt/volumes");
        assert_eq!(opts.len(), 3);
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").unwrap();
        assert!(config.daemon.drivers.is_none());
        assert!(config.driver_opts().is_empty());
    }

    #[test]
    fn test_invalid_configs() {
        for bad in [
            "[daemon]\ndrivers = []",
            "[daemon]\ndrivers = [\"ebs\"]",
            "[drivers.glusterfs]\n\"gfs.servers\" = \"a\"",
            "[daemon]\ncmd-timeout = \"30s\"",
            "[daemon]\ncmd-timeout = \"soon\"",
        ] {
            assert!(
                matches!(Config::parse(bad), Err(ConfigError::Invalid(_))),
                "{}",
                bad
            );
        }
        assert!(matches!(
            Config::parse("[daemon]\nport = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_daemon_config_timeout() {
        let mut config = DaemonConfig::default();
        assert_eq!(config.cmd_timeout().unwrap(), Duration::from_secs(60));
        config.cmd_timeout = "90s".into();
        assert_eq!(config.cmd_timeout().unwrap(), Duration::from_secs(90));
        config.cmd_timeout = "10s".into();
        assert!(config.cmd_timeout().is_err());
    }
}

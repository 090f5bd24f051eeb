// ABOUTME: Configuration for the root switcher.
// ABOUTME: An optional TOML file overrides the built-in device layout; every key has a default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rootswitch.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file: String,
    /// tracing filter directive, e.g. "info" or "rootswitch=debug".
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/initramfs"),
            file: "initramfs.debug".into(),
            level: "info".into(),
        }
    }
}

impl LogConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Layer store directory of the host application, relative to a sysroot.
    pub hostapp_layer_root: String,
    pub hostapp_label: String,
    pub hostext_label: String,
    /// Where the old root ends up after the pivot, relative to the new root.
    pub pivot_path: PathBuf,
    pub scratch_path: PathBuf,
    pub host_extensions: bool,
    /// Kernel command line token that disables host extensions.
    pub nohostext_marker: String,
    pub data_partition_link: PathBuf,
    /// Mount point of the data partition, relative to the new root.
    pub data_dir: String,
    /// Layer store directory on the data partition.
    pub data_layer_root: String,
    /// Data partition filesystem. Detected with the new root's `lsblk` when unset.
    pub data_fstype: Option<String>,
    pub init: PathBuf,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostapp_layer_root: "balena".into(),
            hostapp_label: "io.balena.features.hostapp".into(),
            hostext_label: "io.balena.features.host-extension".into(),
            pivot_path: PathBuf::from("/mnt/sysroot/active"),
            scratch_path: PathBuf::from("/dev/shm"),
            host_extensions: true,
            nohostext_marker: "balena.nohostext".into(),
            data_partition_link: PathBuf::from("/dev/disk/by-state/resin-data"),
            data_dir: "resin-data".into(),
            data_layer_root: "docker".into(),
            data_fstype: None,
            init: PathBuf::from("/sbin/init"),
            log: LogConfig::default(),
        }
    }
}

pub fn parse_config(toml_str: &str) -> Result<Config> {
    toml::from_str(toml_str).context("failed to parse rootswitch config")
}

/// Load `path`, falling back to the defaults when the file does not exist.
pub fn load(path: &Path) -> Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text).with_context(|| format!("failed to parse {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.data_fstype, None);
        assert_eq!(config.init, PathBuf::from("/sbin/init"));
        assert_eq!(config.log.path(), PathBuf::from("/tmp/initramfs/initramfs.debug"));
    }

    #[test]
    fn parse_overrides() {
        let toml = r#"
            data_fstype = "f2fs"
            host_extensions = false
            init = "/lib/systemd/systemd"

            [log]
            level = "debug"
        "#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.data_fstype.as_deref(), Some("f2fs"));
        assert!(!config.host_extensions);
        assert_eq!(config.init, PathBuf::from("/lib/systemd/systemd"));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.file, "initramfs.debug");
        assert_eq!(config.pivot_path, PathBuf::from("/mnt/sysroot/active"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_config("pivot_dir = \"/x\"").is_err());
        assert!(parse_config("this is not valid toml {{{{").is_err());
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = load(Path::new("/nonexistent/rootswitch.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootswitch.toml");
        std::fs::write(&path, "data_dir = \"data\"\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.data_dir, "data");
    }
}

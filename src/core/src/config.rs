use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RootfsError};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the store (volumes, images, cache, metadata)
    pub store_path: PathBuf,

    /// Backing filesystem driver
    pub driver: DriverKind,

    /// UID mappings applied to unpacked layers
    pub uid_mappings: Vec<IdMappingSpec>,

    /// GID mappings applied to unpacked layers
    pub gid_mappings: Vec<IdMappingSpec>,

    /// External tool locations
    pub tools: ToolsConfig,

    /// Seconds to wait for a store lock before giving up
    pub lock_timeout_secs: u64,

    /// Blob cache behaviour
    pub cache: CacheConfig,

    /// Garbage collection defaults
    pub clean: CleanConfig,

    /// Registry access
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/a3s-rootfs"),
            driver: DriverKind::Btrfs,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            tools: ToolsConfig::default(),
            lock_timeout_secs: 300,
            cache: CacheConfig::default(),
            clean: CleanConfig::default(),
            registry: RegistryConfig::default(),
            log_level: LogLevel::Warn,
        }
    }
}

impl StoreConfig {
    /// Load a configuration file (YAML). Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RootfsError::ConfigError(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: StoreConfig = serde_yaml::from_str(&data).map_err(|e| {
            RootfsError::ConfigError(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), "Loaded store configuration");
        Ok(config)
    }

    /// Lock wait bound as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Whether unpacking needs a user namespace.
    pub fn has_id_mappings(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }
}

/// Backing filesystem driver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// btrfs subvolumes and snapshots
    Btrfs,
    /// Plain directories, snapshots by recursive copy
    Dir,
}

impl FromStr for DriverKind {
    type Err = RootfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "btrfs" => Ok(DriverKind::Btrfs),
            "dir" | "directory" => Ok(DriverKind::Dir),
            other => Err(RootfsError::ConfigError(format!(
                "unknown filesystem driver '{}' (expected btrfs or dir)",
                other
            ))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Btrfs => write!(f, "btrfs"),
            DriverKind::Dir => write!(f, "dir"),
        }
    }
}

/// A contiguous ID range mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingSpec {
    /// First ID inside the namespace
    pub namespace_id: u32,
    /// First ID on the host
    pub host_id: u32,
    /// Number of IDs in the range
    pub size: u32,
}

impl IdMappingSpec {
    pub fn new(namespace_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            namespace_id,
            host_id,
            size,
        }
    }
}

/// Parses `nsID:hostID:size`.
impl FromStr for IdMappingSpec {
    type Err = RootfsError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(RootfsError::ConfigError(format!(
                "invalid id mapping '{}': expected nsID:hostID:size",
                s
            )));
        }

        let parse = |field: &str, name: &str| {
            field.parse::<u32>().map_err(|_| {
                RootfsError::ConfigError(format!("invalid {} '{}' in id mapping '{}'", name, field, s))
            })
        };

        let mapping = IdMappingSpec {
            namespace_id: parse(parts[0], "namespace id")?,
            host_id: parse(parts[1], "host id")?,
            size: parse(parts[2], "size")?,
        };

        if mapping.size == 0 {
            return Err(RootfsError::ConfigError(format!(
                "invalid id mapping '{}': size must be positive",
                s
            )));
        }

        Ok(mapping)
    }
}

impl fmt::Display for IdMappingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub newuidmap: PathBuf,
    pub newgidmap: PathBuf,
    pub tar: PathBuf,
    pub btrfs: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            newuidmap: PathBuf::from("newuidmap"),
            newgidmap: PathBuf::from("newgidmap"),
            tar: PathBuf::from("tar"),
            btrfs: PathBuf::from("btrfs"),
        }
    }
}

/// Blob cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Re-hash cached blobs on every hit
    pub verify_on_hit: bool,
}

/// Garbage collection defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    /// Only collect when volume usage exceeds this many bytes
    pub threshold_bytes: Option<u64>,

    /// Base images whose volumes survive collection
    pub keep_images: Vec<String>,
}

/// Registry access configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = RootfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(RootfsError::ConfigError(format!("unknown log level '{}'", other))),
        }
    }
}

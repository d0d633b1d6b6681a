use std::fmt;

use thiserror::Error;

/// Stage of a base image source fetch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStage {
    Manifest,
    Config,
    Blob,
}

impl fmt::Display for SourceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStage::Manifest => write!(f, "manifest"),
            SourceStage::Config => write!(f, "config"),
            SourceStage::Blob => write!(f, "blob"),
        }
    }
}

/// A3S Rootfs error types
#[derive(Error, Debug)]
pub enum RootfsError {
    /// Image, volume or dependency record is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// External tool (tar, newuidmap, btrfs, the unpack child) exited unsuccessfully
    #[error("{tool} failed ({status}): {output}")]
    ExternalTool {
        tool: String,
        status: String,
        output: String,
    },

    /// Base image source failed to provide a manifest, config or blob
    #[error("Source error: failed to fetch {stage} for {reference}: {message}")]
    Source {
        stage: SourceStage,
        reference: String,
        message: String,
    },

    /// Base image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// A layer failed to unpack; wraps the underlying cause
    #[error("Layer {chain_id} failed: {source}")]
    Layer {
        chain_id: String,
        #[source]
        source: Box<RootfsError>,
    },

    /// Unpacking error not attributable to an external tool
    #[error("Unpack error: {0}")]
    UnpackError(String),

    /// ID mapping could not be applied to the unpack child
    #[error("ID mapping failed for pid {pid}: {source}")]
    IdMapping {
        pid: u32,
        #[source]
        source: Box<RootfsError>,
    },

    /// Volume driver error
    #[error("Volume error: {0}")]
    VolumeError(String),

    /// Cached or persisted content failed integrity expectations
    #[error("Corrupted {what}: {message}")]
    Corrupted { what: String, message: String },

    /// Blob cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Lock acquisition error
    #[error("Lock error: {key} - {message}")]
    LockError { key: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Operation cancelled through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Garbage collection could not destroy every unreferenced volume
    #[error("Garbage collection failed to destroy {} volume(s): {}", .failures.len(), .failures.join("; "))]
    Collection { failures: Vec<String> },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RootfsError {
    /// Build a not-found error for the given resource kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RootfsError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error (or the error it wraps) reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        match self {
            RootfsError::NotFound { .. } => true,
            RootfsError::Layer { source, .. } | RootfsError::IdMapping { source, .. } => {
                source.is_not_found()
            }
            RootfsError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether this error reports corrupted content.
    pub fn is_corrupted(&self) -> bool {
        match self {
            RootfsError::Corrupted { .. } => true,
            RootfsError::Layer { source, .. } => source.is_corrupted(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RootfsError {
    fn from(err: serde_json::Error) -> Self {
        RootfsError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RootfsError {
    fn from(err: serde_yaml::Error) -> Self {
        RootfsError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Rootfs operations
pub type Result<T> = std::result::Result<T, RootfsError>;

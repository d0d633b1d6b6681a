//! Base image sources.
//!
//! A [`Source`] serves the three things a pull needs: the manifest (layer
//! blob digests), the image config (diff IDs plus opaque metadata) and the
//! raw layer blobs. Which adapter handles a reference is decided by its
//! scheme: `docker://` or a bare name goes to a registry, an absolute path
//! or `file://` URL to a local tarball.

mod local;
mod reference;
mod registry;

pub use local::LocalTarSource;
pub use reference::{ImageReference, DOCKER_SCHEME};
pub use registry::{RegistryAuth, RegistrySource};

use std::path::PathBuf;
use std::sync::Arc;

use a3s_rootfs_core::config::RegistryConfig;
use a3s_rootfs_core::error::{Result, RootfsError, SourceStage};
use a3s_rootfs_core::image::BaseImageInfo;
use async_trait::async_trait;
use serde::Deserialize;

use crate::digest::{layer_infos, LayerDescriptor};

/// Scheme prefix for local tarball references.
pub const FILE_SCHEME: &str = "file://";

/// Layer list of an image, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub layers: Vec<LayerDescriptor>,
    pub config_digest: String,
}

/// Image configuration: the diff IDs the pipeline needs plus the raw document.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Digests of the uncompressed layer tars, positionally matching the manifest layers
    pub diff_ids: Vec<String>,
    /// The whole config, passed through uninterpreted
    pub raw: serde_json::Value,
}

/// The part of a config document the pipeline interprets. Everything else,
/// `history` included, is optional and stays in `raw`.
#[derive(Deserialize)]
struct ConfigRootfs {
    rootfs: RootfsSection,
}

#[derive(Deserialize)]
struct RootfsSection {
    #[serde(default)]
    diff_ids: Vec<String>,
}

impl ImageConfig {
    /// Parse an OCI/Docker image config document.
    pub fn from_slice(reference: &str, data: &[u8]) -> Result<Self> {
        let config_error = |e: serde_json::Error| RootfsError::Source {
            stage: SourceStage::Config,
            reference: reference.to_string(),
            message: format!("Failed to parse image config: {}", e),
        };

        let raw: serde_json::Value = serde_json::from_slice(data).map_err(config_error)?;
        let parsed = ConfigRootfs::deserialize(&raw).map_err(config_error)?;

        Ok(Self {
            diff_ids: parsed.rootfs.diff_ids,
            raw,
        })
    }
}

/// Provider of manifests, configs and layer blobs for base image references.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetch the layer list and config digest.
    async fn manifest(&self, reference: &str) -> Result<Manifest>;

    /// Fetch and parse the image config.
    async fn config(&self, reference: &str, config_digest: &str) -> Result<ImageConfig>;

    /// Fetch one raw (usually compressed) layer blob.
    async fn blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>>;
}

/// Resolve a reference into its layer chain and config.
pub async fn resolve(source: &dyn Source, reference: &str) -> Result<BaseImageInfo> {
    let manifest = source.manifest(reference).await?;
    let config = source.config(reference, &manifest.config_digest).await?;

    let layers = layer_infos(&manifest.layers, &config.diff_ids).map_err(|e| {
        RootfsError::Source {
            stage: SourceStage::Config,
            reference: reference.to_string(),
            message: e.to_string(),
        }
    })?;

    tracing::debug!(
        reference = %reference,
        layers = layers.len(),
        config = %manifest.config_digest,
        "Resolved base image"
    );

    Ok(BaseImageInfo {
        layers,
        config: config.raw,
    })
}

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Registry(ImageReference),
    LocalTar(PathBuf),
}

impl SourceKind {
    /// Classify a reference by its scheme.
    pub fn parse(reference: &str) -> Result<Self> {
        if let Some(path) = reference.strip_prefix(FILE_SCHEME) {
            return Ok(SourceKind::LocalTar(PathBuf::from(path)));
        }
        if reference.starts_with('/') {
            return Ok(SourceKind::LocalTar(PathBuf::from(reference)));
        }
        Ok(SourceKind::Registry(ImageReference::parse(reference)?))
    }

    /// Stable spelling of the reference, used to key dependency records.
    pub fn canonical(&self) -> String {
        match self {
            SourceKind::Registry(r) => r.full_reference(),
            SourceKind::LocalTar(path) => format!("{}{}", FILE_SCHEME, path.display()),
        }
    }
}

/// Canonical form of `reference`, so `alpine` and
/// `docker.io/library/alpine:latest` share one dependency record.
pub fn canonical_reference(reference: &str) -> Result<String> {
    Ok(SourceKind::parse(reference)?.canonical())
}

/// Build the source adapter that serves `reference`.
pub fn open(reference: &str, registry: &RegistryConfig) -> Result<Arc<dyn Source>> {
    match SourceKind::parse(reference)? {
        SourceKind::Registry(_) => Ok(Arc::new(RegistrySource::new(
            registry,
            RegistryAuth::from_env(),
        ))),
        SourceKind::LocalTar(_) => Ok(Arc::new(LocalTarSource::new())),
    }
}

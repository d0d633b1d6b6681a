//! Local tarball source.
//!
//! A tarball on disk (plain or gzip) is served as a single-layer base image.
//! The blob digest is the hash of the file as stored and the diff ID the
//! hash of its uncompressed tar stream. The config is synthesized from those
//! and is stable for an unchanged file.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError, SourceStage};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ImageConfig, Manifest, Source, SourceKind};
use crate::compression::decompressed;
use crate::digest::{sha256_digest, LayerDescriptor, SHA256_PREFIX};

/// Serves `/path/to/rootfs.tar[.gz]` and `file://` references.
#[derive(Debug, Default)]
pub struct LocalTarSource;

/// Digests of a local tarball.
struct TarballDigests {
    blob_digest: String,
    diff_id: String,
    size: i64,
}

impl LocalTarSource {
    pub fn new() -> Self {
        Self
    }

    fn path(reference: &str, stage: SourceStage) -> Result<PathBuf> {
        match SourceKind::parse(reference)? {
            SourceKind::LocalTar(path) => Ok(path),
            SourceKind::Registry(_) => Err(RootfsError::Source {
                stage,
                reference: reference.to_string(),
                message: "not a local tarball reference".to_string(),
            }),
        }
    }

    async fn digests(reference: &str, stage: SourceStage) -> Result<TarballDigests> {
        let path = Self::path(reference, stage)?;
        let owned_ref = reference.to_string();
        tokio::task::spawn_blocking(move || hash_tarball(&path))
            .await
            .map_err(|e| RootfsError::Other(format!("Hashing task failed: {}", e)))?
            .map_err(|e| RootfsError::Source {
                stage,
                reference: owned_ref,
                message: e.to_string(),
            })
    }

    /// Config document for a tarball with the given diff ID.
    fn synthesize_config(diff_id: &str) -> serde_json::Value {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        serde_json::json!({
            "architecture": arch,
            "os": "linux",
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [diff_id] },
        })
    }
}

#[async_trait]
impl Source for LocalTarSource {
    async fn manifest(&self, reference: &str) -> Result<Manifest> {
        let digests = Self::digests(reference, SourceStage::Manifest).await?;
        let config = Self::synthesize_config(&digests.diff_id);

        tracing::debug!(
            reference = %reference,
            blob = %digests.blob_digest,
            diff_id = %digests.diff_id,
            "Hashed local tarball"
        );

        Ok(Manifest {
            layers: vec![LayerDescriptor {
                digest: digests.blob_digest,
                size: digests.size,
            }],
            config_digest: sha256_digest(config.to_string().as_bytes()),
        })
    }

    async fn config(&self, reference: &str, config_digest: &str) -> Result<ImageConfig> {
        let digests = Self::digests(reference, SourceStage::Config).await?;
        let config = Self::synthesize_config(&digests.diff_id);
        let data = config.to_string();

        if sha256_digest(data.as_bytes()) != config_digest {
            return Err(RootfsError::Source {
                stage: SourceStage::Config,
                reference: reference.to_string(),
                message: "tarball changed since its manifest was read".to_string(),
            });
        }

        ImageConfig::from_slice(reference, data.as_bytes())
    }

    async fn blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>> {
        let path = Self::path(reference, SourceStage::Blob)?;
        let data = tokio::fs::read(&path).await.map_err(|e| RootfsError::Source {
            stage: SourceStage::Blob,
            reference: reference.to_string(),
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        if digest.starts_with(SHA256_PREFIX) && sha256_digest(&data) != digest {
            return Err(RootfsError::Source {
                stage: SourceStage::Blob,
                reference: reference.to_string(),
                message: format!("{} no longer matches {}", path.display(), digest),
            });
        }
        Ok(data)
    }
}

fn hash_tarball(path: &Path) -> std::io::Result<TarballDigests> {
    let wrap = |e: std::io::Error| {
        std::io::Error::new(e.kind(), format!("Failed to read {}: {}", path.display(), e))
    };

    let mut blob_hasher = Sha256::new();
    let mut file = File::open(path).map_err(wrap)?;
    let size = hash_stream(&mut file, &mut blob_hasher).map_err(wrap)?;

    let mut diff_hasher = Sha256::new();
    let mut stream = decompressed(File::open(path).map_err(wrap)?).map_err(wrap)?;
    hash_stream(&mut stream, &mut diff_hasher).map_err(wrap)?;

    Ok(TarballDigests {
        blob_digest: format!("{}{}", SHA256_PREFIX, hex::encode(blob_hasher.finalize())),
        diff_id: format!("{}{}", SHA256_PREFIX, hex::encode(diff_hasher.finalize())),
        size: size as i64,
    })
}

fn hash_stream(reader: &mut dyn Read, hasher: &mut Sha256) -> std::io::Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

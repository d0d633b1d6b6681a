//! Base image puller.
//!
//! Resolves a reference into its layer chain and materializes one volume per
//! chain ID, root first. Layers already on disk are reused. Each missing
//! layer is unpacked into a temporary `<chainID>-incomplete-<uuid>` volume
//! and only renamed to its chain ID once extraction succeeded, so a volume
//! named by a chain ID is always complete. The dependency record is written
//! last.

use std::sync::Arc;

use a3s_rootfs_core::config::IdMappingSpec;
use a3s_rootfs_core::error::{Result, RootfsError};
use a3s_rootfs_core::image::{BaseImageInfo, LayerInfo};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::BlobCache;
use crate::cancel::cancellable;
use crate::deps::{base_image_owner, DependencyManager};
use crate::source::{canonical_reference, resolve, Source};
use crate::unpack::{LayerUnpacker, UnpackSpec};
use crate::volume::VolumeDriver;

/// Marker between a chain ID and the random suffix of an in-progress volume.
pub const INCOMPLETE_MARKER: &str = "-incomplete-";

/// ID mappings applied to every unpacked layer.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub uid_mappings: Vec<IdMappingSpec>,
    pub gid_mappings: Vec<IdMappingSpec>,
}

/// Outcome of a pull.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Canonical reference the dependency record is keyed by
    pub reference: String,
    pub info: BaseImageInfo,
    /// Chain IDs whose volumes this pull created
    pub created: Vec<String>,
}

impl PulledImage {
    /// Chain IDs that were already on disk.
    pub fn reused(&self) -> usize {
        self.info.layers.len() - self.created.len()
    }
}

/// Name of the temporary volume a layer is unpacked into.
pub fn incomplete_volume_id(chain_id: &str) -> String {
    format!("{}{}{}", chain_id, INCOMPLETE_MARKER, Uuid::new_v4().simple())
}

/// Whether `id` names a volume left over from an interrupted unpack.
pub fn is_incomplete_volume(id: &str) -> bool {
    id.contains(INCOMPLETE_MARKER)
}

/// Pulls base images into layer volumes.
pub struct BaseImagePuller {
    source: Arc<dyn Source>,
    cache: Arc<BlobCache>,
    driver: Arc<dyn VolumeDriver>,
    unpacker: Arc<dyn LayerUnpacker>,
    deps: DependencyManager,
}

impl BaseImagePuller {
    pub fn new(
        source: Arc<dyn Source>,
        cache: Arc<BlobCache>,
        driver: Arc<dyn VolumeDriver>,
        unpacker: Arc<dyn LayerUnpacker>,
        deps: DependencyManager,
    ) -> Self {
        Self {
            source,
            cache,
            driver,
            unpacker,
            deps,
        }
    }

    /// Pull `reference`, creating missing layer volumes and recording the
    /// chain as `baseimage:<reference>` dependencies.
    pub async fn pull(
        &self,
        reference: &str,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<PulledImage> {
        let canonical = canonical_reference(reference)?;
        let info = cancellable(
            cancel,
            &format!("resolving {}", reference),
            resolve(self.source.as_ref(), reference),
        )
        .await?;

        tracing::info!(
            reference = %canonical,
            layers = info.layers.len(),
            "Pulling base image"
        );

        let mut created = Vec::new();
        for layer in &info.layers {
            let was_created = self
                .pull_layer(reference, layer, options, cancel)
                .await
                .map_err(|e| RootfsError::Layer {
                    chain_id: layer.chain_id.clone(),
                    source: Box::new(e),
                })?;
            if was_created {
                created.push(layer.chain_id.clone());
            }
        }

        // Every listed volume exists by now
        self.deps
            .register(&base_image_owner(&canonical), &info.chain_ids())?;

        tracing::info!(
            reference = %canonical,
            created = created.len(),
            reused = info.layers.len() - created.len(),
            "Base image ready"
        );

        Ok(PulledImage {
            reference: canonical,
            info,
            created,
        })
    }

    /// Make sure `layer`'s volume exists. Returns whether it was created here.
    async fn pull_layer(
        &self,
        reference: &str,
        layer: &LayerInfo,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.driver.volume_exists(&layer.chain_id) {
            tracing::debug!(chain_id = %layer.chain_id, "Reusing layer volume");
            return Ok(false);
        }

        let source = self.source.clone();
        let blob = cancellable(
            cancel,
            &format!("fetching blob {}", layer.blob_id),
            self.cache.fetch_or_stream(&layer.blob_id, || async move {
                source.blob(reference, &layer.blob_id).await
            }),
        )
        .await?;

        let temp_id = incomplete_volume_id(&layer.chain_id);
        let target = match self
            .driver
            .create_volume(layer.parent_chain_id.as_deref(), &temp_id)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                self.discard(&temp_id).await;
                return Err(e);
            }
        };

        let spec = UnpackSpec {
            blob_path: blob.path,
            target,
            uid_mappings: options.uid_mappings.clone(),
            gid_mappings: options.gid_mappings.clone(),
        };

        if let Err(e) = self.unpacker.unpack(&spec, cancel).await {
            self.discard(&temp_id).await;
            if e.is_corrupted() {
                tracing::warn!(blob = %layer.blob_id, "Evicting undecodable blob from cache");
                if let Err(evict) = self.cache.invalidate(&layer.blob_id) {
                    tracing::warn!(blob = %layer.blob_id, error = %evict, "Failed to evict blob");
                }
            }
            return Err(e);
        }

        match self.driver.move_volume(&temp_id, &layer.chain_id).await {
            Ok(()) => {
                tracing::debug!(
                    chain_id = %layer.chain_id,
                    parent = ?layer.parent_chain_id,
                    size = blob.size,
                    "Created layer volume"
                );
                Ok(true)
            }
            // Another puller committed the same chain ID first
            Err(_) if self.driver.volume_exists(&layer.chain_id) => {
                tracing::debug!(chain_id = %layer.chain_id, "Layer volume created concurrently");
                self.discard(&temp_id).await;
                Ok(false)
            }
            Err(e) => {
                self.discard(&temp_id).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, temp_id: &str) {
        match self.driver.destroy_volume(temp_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(volume = %temp_id, error = %e, "Failed to remove incomplete volume")
            }
        }
    }
}

//! Volume garbage collection.
//!
//! Every volume starts out as a candidate. Volumes listed by a live image's
//! dependency record, or by a base image the caller wants kept warm, are
//! struck from the candidates; the rest are destroyed. The blob cache is
//! emptied on every pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use a3s_rootfs_core::error::{Result, RootfsError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::BlobCache;
use crate::deps::{base_image_owner, image_owner, DependencyManager};
use crate::source::canonical_reference;
use crate::volume::VolumeDriver;

/// What one collection pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    /// Volumes destroyed, sorted
    pub destroyed: Vec<String>,
    /// Volumes still referenced
    pub retained: usize,
    /// Blob cache entries removed
    pub blobs_removed: usize,
}

/// Reclaims volumes no live image depends on.
///
/// Callers must keep image creation out while a pass runs, e.g. by holding
/// the global store lock exclusively.
pub struct GarbageCollector {
    driver: Arc<dyn VolumeDriver>,
    deps: DependencyManager,
    cache: Arc<BlobCache>,
}

impl GarbageCollector {
    pub fn new(driver: Arc<dyn VolumeDriver>, deps: DependencyManager, cache: Arc<BlobCache>) -> Self {
        Self {
            driver,
            deps,
            cache,
        }
    }

    /// Run one pass.
    ///
    /// `images` are the ids of every existing image; a missing or unreadable
    /// record for any of them aborts the pass before anything is destroyed.
    /// `keep_images` are base image references whose volumes survive; those
    /// are best effort.
    pub async fn collect(
        &self,
        images: &[String],
        keep_images: &[String],
        cancel: &CancellationToken,
    ) -> Result<CollectionReport> {
        let volumes = self.driver.volumes().await?;
        let mut orphans: BTreeSet<String> = volumes.into_iter().collect();
        let total = orphans.len();

        for image in images {
            for chain_id in self.deps.dependencies(&image_owner(image))? {
                orphans.remove(&chain_id);
            }
        }

        for reference in keep_images {
            match self.keep_list_dependencies(reference) {
                Ok(chain_ids) => {
                    for chain_id in chain_ids {
                        orphans.remove(&chain_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "Skipping keep-list entry");
                }
            }
        }

        tracing::info!(
            volumes = total,
            unreferenced = orphans.len(),
            "Collecting unreferenced volumes"
        );

        let mut report = CollectionReport {
            retained: total - orphans.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();

        for id in &orphans {
            if cancel.is_cancelled() {
                return Err(RootfsError::Cancelled(format!(
                    "garbage collection after destroying {} volume(s)",
                    report.destroyed.len()
                )));
            }
            match self.driver.destroy_volume(id).await {
                Ok(()) => {
                    tracing::debug!(volume = %id, "Destroyed unreferenced volume");
                    report.destroyed.push(id.clone());
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(volume = %id, "Volume already gone");
                }
                Err(e) => {
                    tracing::warn!(volume = %id, error = %e, "Failed to destroy volume");
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        let cleaned = self.cache.clean();
        if !failures.is_empty() {
            if let Err(e) = cleaned {
                tracing::warn!(error = %e, "Failed to clean blob cache");
            }
            return Err(RootfsError::Collection { failures });
        }
        report.blobs_removed = cleaned?;

        tracing::info!(
            destroyed = report.destroyed.len(),
            retained = report.retained,
            blobs = report.blobs_removed,
            "Garbage collection finished"
        );
        Ok(report)
    }

    fn keep_list_dependencies(&self, reference: &str) -> Result<Vec<String>> {
        let canonical = canonical_reference(reference)?;
        self.deps.dependencies(&base_image_owner(&canonical))
    }
}

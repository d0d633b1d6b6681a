//! A3S Rootfs Runtime - container rootfs store engine.
//!
//! Pulls layered base images into content-addressed copy-on-write volumes,
//! unpacks untrusted layers inside a user namespace gated by a control pipe,
//! tracks which volumes each image depends on, and garbage-collects the rest.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod cancel;
pub mod compression;
pub mod deps;
pub mod digest;
pub mod fs;
pub mod gc;
pub mod idmap;
pub mod image;
pub mod lock;
pub mod puller;
pub mod source;
pub mod store;
pub mod unpack;
pub mod volume;

// Re-export common types
pub use cache::{BlobCache, CachedBlob};
pub use cancel::cancellable;
pub use deps::{base_image_owner, image_owner, DependencyManager};
pub use digest::{chain_id, chain_ids, sha256_digest};
pub use gc::{CollectionReport, GarbageCollector};
pub use idmap::{CommandIdMapper, IdMapper};
pub use image::{ImageManager, ImageRecord, ImageStats, ImageStore, StoreUsage};
pub use lock::{LockGuard, LockMode, Locksmith, GLOBAL_LOCK};
pub use puller::{BaseImagePuller, PullOptions, PulledImage};
pub use source::{ImageReference, LocalTarSource, RegistryAuth, RegistrySource, Source};
pub use store::StoreLayout;
pub use unpack::{
    run_unpack_child, ChildOutcome, LayerUnpacker, NamespacedUnpacker, ReexecCommand,
    TarExtractor, UnpackSpec, CONTROL_FD, UNPACK_COMMAND,
};
pub use volume::{BtrfsDriver, DirectoryDriver, Driver, VolumeDriver};

/// A3S Rootfs Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

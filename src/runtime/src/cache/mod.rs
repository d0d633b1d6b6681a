//! Blob cache.
//!
//! `BlobCache`: content-addressed, at-most-once-fetch cache for raw layer
//! blobs, keyed by digest and shared by every pull against the store.

pub mod blob_cache;

pub use blob_cache::{BlobCache, CachedBlob};

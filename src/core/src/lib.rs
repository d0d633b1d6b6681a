//! A3S Rootfs Core - Foundational Types
//!
//! This crate provides the types shared by the rootfs store runtime and CLI:
//! the base image data model, the error taxonomy and the store configuration.

pub mod config;
pub mod error;
pub mod image;

// Re-export commonly used types
pub use config::{DriverKind, IdMappingSpec, LogLevel, StoreConfig};
pub use error::{Result, RootfsError, SourceStage};
pub use image::{BaseImageInfo, LayerInfo};

/// A3S Rootfs version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! A3S Rootfs CLI - container rootfs store.

pub mod commands;
pub mod output;

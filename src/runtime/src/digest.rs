//! Content addressing for layer volumes.
//!
//! A volume is named by its chain ID: a hash chain over the diff IDs of every
//! layer from the root up to and including the layer itself. Two images that
//! share a layer prefix therefore share the volumes for that prefix.

use a3s_rootfs_core::error::{Result, RootfsError};
use a3s_rootfs_core::image::LayerInfo;
use sha2::{Digest, Sha256};

/// Digest algorithm prefix used for every identifier.
pub const SHA256_PREFIX: &str = "sha256:";

/// Hash bytes into a `sha256:<hex>` digest string.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(data)))
}

/// Chain ID of a layer given its parent's chain ID.
///
/// The root layer hashes its diff ID alone; every other layer hashes
/// `"<parent chain ID> <diff ID>"`.
pub fn chain_id(parent_chain_id: Option<&str>, diff_id: &str) -> String {
    match parent_chain_id {
        None => sha256_digest(diff_id.as_bytes()),
        Some(parent) => sha256_digest(format!("{} {}", parent, diff_id).as_bytes()),
    }
}

/// Chain IDs for an ordered (root first) list of diff IDs.
pub fn chain_ids<S: AsRef<str>>(diff_ids: &[S]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = chain_id(ids.last().map(String::as_str), diff_id.as_ref());
        ids.push(next);
    }
    ids
}

/// Compressed layer as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub size: i64,
}

/// Pair manifest layers with config diff IDs and compute their chain IDs.
///
/// `diff_ids[i]` must describe `layers[i]`.
pub fn layer_infos(layers: &[LayerDescriptor], diff_ids: &[String]) -> Result<Vec<LayerInfo>> {
    if layers.len() != diff_ids.len() {
        return Err(RootfsError::Corrupted {
            what: "image config".to_string(),
            message: format!(
                "manifest lists {} layers but config lists {} diff IDs",
                layers.len(),
                diff_ids.len()
            ),
        });
    }

    let mut infos: Vec<LayerInfo> = Vec::with_capacity(layers.len());
    for (layer, diff_id) in layers.iter().zip(diff_ids) {
        let parent = infos.last().map(|l| l.chain_id.clone());
        infos.push(LayerInfo {
            blob_id: layer.digest.clone(),
            chain_id: chain_id(parent.as_deref(), diff_id),
            parent_chain_id: parent,
            size: layer.size,
            diff_id: diff_id.clone(),
        });
    }

    Ok(infos)
}

/// Convert an identifier to a flat file or directory name.
///
/// Strips the `sha256:` prefix; other algorithm prefixes keep their name
/// with ':' replaced by '_'.
pub fn id_to_name(id: &str) -> String {
    match id.strip_prefix(SHA256_PREFIX) {
        Some(hex) => hex.to_string(),
        None => id.replace(':', "_"),
    }
}

/// Inverse of [`id_to_name`] for names it produced from `sha256:` ids.
pub fn name_to_id(name: &str) -> String {
    if name.contains('_') {
        name.replacen('_', ":", 1)
    } else {
        format!("{}{}", SHA256_PREFIX, name)
    }
}

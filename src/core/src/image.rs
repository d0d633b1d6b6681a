//! Base image data model.
//!
//! A base image is an ordered chain of layers, root first. Each layer is
//! addressed twice: by the digest of its compressed blob (what the source
//! serves) and by its chain ID (what the volume on disk is named after).

use serde::{Deserialize, Serialize};

/// One layer of a base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Digest of the compressed blob served by the source
    pub blob_id: String,
    /// Content address of the volume produced by this layer
    pub chain_id: String,
    /// Chain ID of the layer below, `None` for the root layer
    pub parent_chain_id: Option<String>,
    /// Compressed blob size in bytes
    pub size: i64,
    /// Digest of the uncompressed tar stream
    pub diff_id: String,
}

/// A resolved base image: its layers (root first) and opaque configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseImageInfo {
    pub layers: Vec<LayerInfo>,
    /// Image configuration, passed through without interpretation
    pub config: serde_json::Value,
}

impl BaseImageInfo {
    /// Chain IDs of every layer, root first.
    pub fn chain_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.chain_id.clone()).collect()
    }

    /// The topmost layer, whose volume holds the complete filesystem.
    pub fn leaf(&self) -> Option<&LayerInfo> {
        self.layers.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(chain_id: &str, parent: Option<&str>) -> LayerInfo {
        LayerInfo {
            blob_id: format!("blob-{}", chain_id),
            chain_id: chain_id.to_string(),
            parent_chain_id: parent.map(|p| p.to_string()),
            size: 10,
            diff_id: format!("diff-{}", chain_id),
        }
    }

    #[test]
    fn test_chain_ids_in_order() {
        let info = BaseImageInfo {
            layers: vec![layer("sha256:a", None), layer("sha256:b", Some("sha256:a"))],
            config: serde_json::json!({}),
        };
        assert_eq!(info.chain_ids(), vec!["sha256:a", "sha256:b"]);
        assert_eq!(info.leaf().unwrap().chain_id, "sha256:b");
    }

    #[test]
    fn test_empty_image_has_no_leaf() {
        let info = BaseImageInfo {
            layers: Vec::new(),
            config: serde_json::Value::Null,
        };
        assert!(info.leaf().is_none());
        assert!(info.chain_ids().is_empty());
    }

    #[test]
    fn test_layer_info_serialization() {
        let original = layer("sha256:b", Some("sha256:a"));
        let json = serde_json::to_string(&original).unwrap();
        let parsed: LayerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}

//! Registry-backed source using the `oci-distribution` client.
//!
//! Multi-arch indexes resolve to `linux/<host arch>`. Registries listed as
//! insecure are spoken to over plain HTTP.

use a3s_rootfs_core::config::RegistryConfig;
use a3s_rootfs_core::error::{Result, RootfsError, SourceStage};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::reference::ImageReference;
use super::{ImageConfig, Manifest, Source};
use crate::digest::{sha256_digest, LayerDescriptor, SHA256_PREFIX};

/// Credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls manifests, configs and blobs from OCI/Docker registries.
pub struct RegistrySource {
    client: Client,
    auth: RegistryAuth,
}

impl RegistrySource {
    pub fn new(config: &RegistryConfig, auth: RegistryAuth) -> Self {
        let protocol = if config.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure_registries.clone())
        };

        let client = Client::new(ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        });

        Self { client, auth }
    }

    fn error(stage: SourceStage, reference: &str, message: String) -> RootfsError {
        RootfsError::Source {
            stage,
            reference: reference.to_string(),
            message,
        }
    }

    /// Authenticate for pulls against the reference's registry.
    async fn authenticate(&self, oci_ref: &Reference, stage: SourceStage, reference: &str) -> Result<()> {
        self.client
            .auth(oci_ref, &self.auth.to_oci_auth(), RegistryOperation::Pull)
            .await
            .map_err(|e| Self::error(stage, reference, format!("Failed to authenticate: {}", e)))?;
        Ok(())
    }

    async fn pull_verified(
        &self,
        reference: &str,
        digest: &str,
        stage: SourceStage,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference, stage)?;
        self.authenticate(&oci_ref, stage, reference).await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| Self::error(stage, reference, format!("Failed to pull {}: {}", digest, e)))?;

        if digest.starts_with(SHA256_PREFIX) {
            let actual = sha256_digest(&data);
            if actual != digest {
                return Err(RootfsError::Corrupted {
                    what: format!("{} {}", stage, digest),
                    message: format!("registry served content hashing to {}", actual),
                });
            }
        }

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            size = data.len(),
            "Pulled {}",
            stage
        );
        Ok(data)
    }
}

#[async_trait]
impl Source for RegistrySource {
    async fn manifest(&self, reference: &str) -> Result<Manifest> {
        let oci_ref = to_oci_reference(reference, SourceStage::Manifest)?;

        tracing::info!(reference = %reference, "Fetching manifest");
        let (manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| {
                Self::error(
                    SourceStage::Manifest,
                    reference,
                    format!("Failed to pull manifest: {}", e),
                )
            })?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            layers = manifest.layers.len(),
            "Fetched manifest"
        );

        Ok(Manifest {
            layers: manifest
                .layers
                .iter()
                .map(|layer| LayerDescriptor {
                    digest: layer.digest.clone(),
                    size: layer.size,
                })
                .collect(),
            config_digest: manifest.config.digest.clone(),
        })
    }

    async fn config(&self, reference: &str, config_digest: &str) -> Result<ImageConfig> {
        let data = self
            .pull_verified(reference, config_digest, SourceStage::Config)
            .await?;
        ImageConfig::from_slice(reference, &data)
    }

    async fn blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>> {
        self.pull_verified(reference, digest, SourceStage::Blob).await
    }
}

fn to_oci_reference(reference: &str, stage: SourceStage) -> Result<Reference> {
    let parsed = ImageReference::parse(reference)?;
    let ref_str = parsed.full_reference();
    ref_str.parse::<Reference>().map_err(|e| RootfsError::Source {
        stage,
        reference: reference.to_string(),
        message: format!("Invalid OCI reference '{}': {}", ref_str, e),
    })
}

/// Select the linux image matching the host CPU architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

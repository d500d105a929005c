//! Registry-backed image store.
//!
//! Pulls gadget images from OCI registries with validation, size limits and
//! timeout enforcement, caching content in a local [`BlobStore`]. Multi-arch
//! images are resolved to the host platform before layers are fetched.

use crate::constants::{
    IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_LAYER_SIZE, MAX_MANIFEST_SIZE,
    MAX_METADATA_SIZE,
};
use crate::error::{Error, Result};
use crate::oci::{BlobStore, Descriptor, ImageManifest, ImageOptions, ImageStore, PullPolicy};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// An [`ImageStore`] pulling from OCI registries into a blob store.
pub struct RegistryImageStore {
    storage: Arc<BlobStore>,
    /// Reference → resolved manifest for images present locally.
    index: RwLock<HashMap<String, ImageManifest>>,
}

impl RegistryImageStore {
    pub fn new(storage: Arc<BlobStore>) -> Self {
        Self {
            storage,
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<BlobStore> {
        &self.storage
    }

    fn resolved(&self, reference: &str) -> Option<ImageManifest> {
        self.index.read().expect("index lock poisoned").get(reference).cloned()
    }

    async fn pull(&self, image_ref: &str, opts: &ImageOptions) -> Result<ImageManifest> {
        validate_reference(image_ref)?;
        info!(image = image_ref, "pulling gadget image");

        let reference: Reference = image_ref
            .parse()
            .map_err(|e| Error::InvalidImageReference {
                reference: image_ref.to_string(),
                reason: format!("{}", e),
            })?;

        let protocol = if opts.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        let auth = registry_auth(opts, reference.registry())?;

        let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            client.pull_manifest(&reference, &auth).await
        })
        .await
        .map_err(|_| Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: format!("manifest pull timed out after {:?}", IMAGE_PULL_TIMEOUT),
        })?
        .map_err(|e| classify_pull_error(image_ref, e))?;

        let image = resolve_for_host(&client, &reference, &auth, manifest, image_ref).await?;

        let resolved = convert_manifest(digest, &image)?;
        self.pull_blobs(&client, &reference, &resolved, image_ref).await?;

        let mut index = self.index.write().expect("index lock poisoned");
        index.insert(image_ref.to_string(), resolved.clone());
        Ok(resolved)
    }

    async fn pull_blobs(
        &self,
        client: &Client,
        reference: &Reference,
        manifest: &ImageManifest,
        image_ref: &str,
    ) -> Result<()> {
        if manifest.layers.len() > MAX_LAYERS {
            return Err(Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!(
                    "too many layers: {} > {}",
                    manifest.layers.len(),
                    MAX_LAYERS
                ),
            });
        }

        let mut wanted = vec![(&manifest.config, MAX_METADATA_SIZE)];
        wanted.extend(manifest.layers.iter().map(|l| (l, MAX_LAYER_SIZE)));

        for (desc, limit) in wanted {
            if self.storage.has_blob(&desc.digest) {
                debug!(digest = %desc.digest, "blob already cached");
                continue;
            }
            if desc.size > limit as u64 {
                return Err(Error::ImageTooLarge {
                    size: desc.size,
                    limit: limit as u64,
                });
            }

            debug!(digest = %desc.digest, size = desc.size, "pulling blob");
            let oci_desc = OciDescriptor {
                digest: desc.digest.clone(),
                size: desc.size as i64,
                media_type: desc.media_type.clone(),
                urls: None,
                annotations: None,
            };

            let mut data = Vec::new();
            tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
                client.pull_blob(reference, &oci_desc, &mut data).await
            })
            .await
            .map_err(|_| Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("blob {} pull timed out", desc.digest),
            })?
            .map_err(|e| Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("pulling blob {}: {}", desc.digest, e),
            })?;

            self.storage.put_blob(&desc.digest, &data)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ImageStore for RegistryImageStore {
    async fn ensure(
        &self,
        reference: &str,
        opts: &ImageOptions,
        policy: PullPolicy,
    ) -> Result<()> {
        let present = self.resolved(reference).is_some();
        match (policy, present) {
            (PullPolicy::Never, false) => Err(Error::PullDisabled(reference.to_string())),
            (PullPolicy::Never, true) | (PullPolicy::Missing, true) => Ok(()),
            (PullPolicy::Missing, false) | (PullPolicy::Always, _) => {
                self.pull(reference, opts).await.map(|_| ())
            }
        }
    }

    async fn manifest_for_host(&self, reference: &str) -> Result<ImageManifest> {
        self.resolved(reference)
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))
    }

    async fn read_content(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.storage.get_blob(&desc.digest)
    }
}

/// Validates reference length and character set before it reaches the
/// registry client.
fn validate_reference(image_ref: &str) -> Result<()> {
    if image_ref.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image_ref.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !image_ref.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '/'
            || c == ':'
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '@'
    }) {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

fn classify_pull_error(image_ref: &str, err: oci_distribution::errors::OciDistributionError) -> Error {
    let text = err.to_string();
    if text.contains("404") || text.to_lowercase().contains("not found") {
        Error::ImageNotFound(image_ref.to_string())
    } else {
        Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: text,
        }
    }
}

/// Reads registry credentials from a docker-config-style JSON file.
///
/// The pull secret takes precedence over the auth file; with neither,
/// access is anonymous.
fn registry_auth(opts: &ImageOptions, registry: &str) -> Result<RegistryAuth> {
    let path = opts.pull_secret.as_deref().or(opts.auth_file.as_deref());
    let Some(path) = path else {
        return Ok(RegistryAuth::Anonymous);
    };
    auth_from_file(path, registry)
}

fn auth_from_file(path: &Path, registry: &str) -> Result<RegistryAuth> {
    let raw = std::fs::read(path)?;
    let doc: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| Error::InvalidParam {
            key: "authfile".to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;

    let Some(entry) = doc
        .get("auths")
        .and_then(|auths| auths.get(registry))
        .and_then(|e| e.get("auth"))
        .and_then(|a| a.as_str())
    else {
        debug!(registry, "no credentials in auth file, using anonymous");
        return Ok(RegistryAuth::Anonymous);
    };

    let decoded = BASE64.decode(entry).map_err(|e| Error::InvalidParam {
        key: "authfile".to_string(),
        reason: format!("invalid auth entry for {}: {}", registry, e),
    })?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::InvalidParam {
        key: "authfile".to_string(),
        reason: format!("auth entry for {} is not UTF-8", registry),
    })?;
    let (user, pass) = decoded.split_once(':').ok_or_else(|| Error::InvalidParam {
        key: "authfile".to_string(),
        reason: format!("auth entry for {} is not user:pass", registry),
    })?;
    Ok(RegistryAuth::Basic(user.to_string(), pass.to_string()))
}

fn host_platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        _ => "linux",
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        _ => "amd64",
    };
    (os, arch)
}

/// Resolves a manifest to a single-platform image manifest, following
/// multi-arch indexes to the entry matching the host.
async fn resolve_for_host(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
    image_ref: &str,
) -> Result<OciImageManifest> {
    match manifest {
        OciManifest::Image(img) => Ok(img),
        OciManifest::ImageIndex(index) => {
            let (target_os, target_arch) = host_platform();

            let matching = index.manifests.iter().find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == target_os && p.architecture == target_arch)
            });

            let desc = matching.ok_or_else(|| Error::NoPlatform {
                reference: image_ref.to_string(),
                platform: format!("{}/{}", target_os, target_arch),
            })?;

            if desc.size as usize > MAX_MANIFEST_SIZE {
                return Err(Error::ImageTooLarge {
                    size: desc.size as u64,
                    limit: MAX_MANIFEST_SIZE as u64,
                });
            }

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                reference.registry(),
                reference.repository(),
                desc.digest
            )
            .parse()
            .map_err(|e| Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("building digest reference: {}", e),
            })?;

            let (platform_manifest, _) = client
                .pull_manifest(&digest_ref, auth)
                .await
                .map_err(|e| Error::ImagePullFailed {
                    reference: image_ref.to_string(),
                    reason: format!("pulling platform manifest: {}", e),
                })?;

            match platform_manifest {
                OciManifest::Image(img) => Ok(img),
                OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
                    reference: image_ref.to_string(),
                    reason: "nested image index not supported".to_string(),
                }),
            }
        }
    }
}

fn convert_manifest(digest: String, image: &OciImageManifest) -> Result<ImageManifest> {
    let config_size = image.config.size as u64;
    if config_size > MAX_METADATA_SIZE as u64 {
        return Err(Error::ImageTooLarge {
            size: config_size,
            limit: MAX_METADATA_SIZE as u64,
        });
    }

    Ok(ImageManifest {
        digest,
        config: convert_descriptor(&image.config),
        layers: image.layers.iter().map(convert_descriptor).collect(),
        annotations: image.annotations.clone().unwrap_or_default(),
    })
}

fn convert_descriptor(desc: &OciDescriptor) -> Descriptor {
    Descriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size as u64,
        annotations: desc.annotations.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reference_validation() {
        assert!(validate_reference("ghcr.io/gadget/dns:latest").is_ok());
        assert!(validate_reference("registry.example.com:5000/g@sha256:abc").is_ok());
        assert!(validate_reference("").is_err());
        assert!(validate_reference("bad ref").is_err());
        assert!(validate_reference(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn never_policy_without_local_copy_fails() {
        let dir = TempDir::new().unwrap();
        let store =
            RegistryImageStore::new(Arc::new(BlobStore::with_path(dir.path().into()).unwrap()));
        let err = store
            .ensure(
                "ghcr.io/gadget/dns:latest",
                &ImageOptions::default(),
                PullPolicy::Never,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PullDisabled(_)));
    }

    #[tokio::test]
    async fn manifest_requires_ensure() {
        let dir = TempDir::new().unwrap();
        let store =
            RegistryImageStore::new(Arc::new(BlobStore::with_path(dir.path().into()).unwrap()));
        let err = store.manifest_for_host("missing:latest").await.unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }

    #[test]
    fn auth_file_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.json");
        let auth = BASE64.encode("user:secret");
        std::fs::write(
            &path,
            format!(r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#, auth),
        )
        .unwrap();

        match auth_from_file(&path, "ghcr.io").unwrap() {
            RegistryAuth::Basic(user, pass) => {
                assert_eq!(user, "user");
                assert_eq!(pass, "secret");
            }
            _ => panic!("expected basic auth"),
        }

        assert!(matches!(
            auth_from_file(&path, "docker.io").unwrap(),
            RegistryAuth::Anonymous
        ));
    }
}

//! In-memory image store.
//!
//! Backs tests and embedders that distribute gadget images out of band.
//! Images are inserted fully resolved; `ensure` only enforces the pull
//! policy against what is present.

use crate::error::{Error, Result};
use crate::oci::{digest_of, Descriptor, ImageManifest, ImageOptions, ImageStore, PullPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Stored {
    manifest: ImageManifest,
    blobs: HashMap<String, Vec<u8>>,
}

/// An [`ImageStore`] holding fully resolved images in memory.
#[derive(Default)]
pub struct MemoryImageStore {
    images: RwLock<HashMap<String, Stored>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a resolved image: metadata document plus raw layers.
    ///
    /// Descriptors and the manifest digest are derived from the content, so
    /// everything a consumer reads back is properly content-addressed.
    /// Returns the manifest for further adjustment (e.g. signing followed by
    /// [`MemoryImageStore::replace_manifest`]).
    pub fn put_image(
        &self,
        reference: &str,
        metadata: &[u8],
        layers: &[(&str, &[u8])],
    ) -> ImageManifest {
        let mut blobs = HashMap::new();

        let config = Descriptor {
            media_type: crate::constants::GADGET_METADATA_MEDIA_TYPE.to_string(),
            digest: digest_of(metadata),
            size: metadata.len() as u64,
            annotations: HashMap::new(),
        };
        blobs.insert(config.digest.clone(), metadata.to_vec());

        let mut layer_descs = Vec::new();
        for (media_type, content) in layers {
            let desc = Descriptor {
                media_type: media_type.to_string(),
                digest: digest_of(content),
                size: content.len() as u64,
                annotations: HashMap::new(),
            };
            blobs.insert(desc.digest.clone(), content.to_vec());
            layer_descs.push(desc);
        }

        // manifest digest over the descriptor digests, stable per content
        let mut manifest_body = config.digest.clone();
        for l in &layer_descs {
            manifest_body.push(' ');
            manifest_body.push_str(&l.digest);
        }
        let manifest = ImageManifest {
            digest: digest_of(manifest_body.as_bytes()),
            config,
            layers: layer_descs,
            annotations: HashMap::new(),
        };

        let mut images = self.images.write().expect("image lock poisoned");
        images.insert(
            reference.to_string(),
            Stored {
                manifest: manifest.clone(),
                blobs,
            },
        );
        manifest
    }

    /// Replaces the stored manifest of `reference`, e.g. after signing.
    pub fn replace_manifest(&self, reference: &str, manifest: ImageManifest) {
        let mut images = self.images.write().expect("image lock poisoned");
        if let Some(stored) = images.get_mut(reference) {
            stored.manifest = manifest;
        }
    }

    pub fn remove_image(&self, reference: &str) {
        self.images.write().expect("image lock poisoned").remove(reference);
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn ensure(
        &self,
        reference: &str,
        _opts: &ImageOptions,
        policy: PullPolicy,
    ) -> Result<()> {
        let present = self
            .images
            .read()
            .expect("image lock poisoned")
            .contains_key(reference);
        match (present, policy) {
            (true, _) => Ok(()),
            (false, PullPolicy::Never) => Err(Error::PullDisabled(reference.to_string())),
            (false, _) => Err(Error::ImageNotFound(reference.to_string())),
        }
    }

    async fn manifest_for_host(&self, reference: &str) -> Result<ImageManifest> {
        self.images
            .read()
            .expect("image lock poisoned")
            .get(reference)
            .map(|s| s.manifest.clone())
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))
    }

    async fn read_content(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let images = self.images.read().expect("image lock poisoned");
        images
            .values()
            .find_map(|s| s.blobs.get(&desc.digest))
            .cloned()
            .ok_or_else(|| Error::BlobNotFound {
                digest: desc.digest.clone(),
            })
    }
}

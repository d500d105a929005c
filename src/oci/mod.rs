//! Gadget image access.
//!
//! The runtime consumes a deliberately small interface over OCI registries:
//! resolve an image reference, iterate the layers of the manifest matching
//! the host platform, and read descriptor content. [`RegistryImageStore`]
//! implements it against real registries; [`MemoryImageStore`] backs tests
//! and embedders that bring their own distribution channel.

mod client;
mod memory;
mod store;
pub mod verify;

pub use client::RegistryImageStore;
pub use memory::MemoryImageStore;
pub use store::{digest_of, BlobStore};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Reference to a piece of image content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub annotations: HashMap<String, String>,
}

/// The manifest of a gadget image, resolved for the host platform.
#[derive(Debug, Clone, Default)]
pub struct ImageManifest {
    /// Digest of the manifest document itself.
    pub digest: String,
    /// The config descriptor: the gadget metadata document (YAML).
    pub config: Descriptor,
    /// Layers in manifest order.
    pub layers: Vec<Descriptor>,
    pub annotations: HashMap<String, String>,
}

/// When to pull a gadget image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Always pull, even when a local copy exists.
    Always,
    /// Pull only when the image is absent locally.
    #[default]
    Missing,
    /// Never pull; fail when the image is absent locally.
    Never,
}

impl PullPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Missing => "missing",
            Self::Never => "never",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(Self::Always),
            "missing" => Ok(Self::Missing),
            "never" => Ok(Self::Never),
            other => Err(Error::UnsupportedValue {
                key: "pull".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options controlling image access.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Path to a docker-config-style authentication file.
    pub auth_file: Option<PathBuf>,
    /// Path to a docker-config-style pull secret, taking precedence over
    /// `auth_file`.
    pub pull_secret: Option<PathBuf>,
    /// Allow plain-HTTP registries.
    pub insecure: bool,
}

/// The registry surface the runtime depends on.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Makes `reference` available locally according to `policy`.
    async fn ensure(
        &self,
        reference: &str,
        opts: &ImageOptions,
        policy: PullPolicy,
    ) -> Result<()>;

    /// Returns the manifest of `reference` for the host platform.
    ///
    /// The image must have been ensured first.
    async fn manifest_for_host(&self, reference: &str) -> Result<ImageManifest>;

    /// Reads the content a descriptor points at.
    async fn read_content(&self, desc: &Descriptor) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_parses_known_values() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert_eq!(PullPolicy::Never.to_string(), "never");
    }

    #[test]
    fn pull_policy_rejects_unknown_values() {
        let err = "sometimes".parse::<PullPolicy>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}

//! Content-addressed blob storage for gadget images.
//!
//! Manifests, metadata documents and program layers are stored by their
//! SHA-256 digest in a sharded directory layout:
//!
//! ```text
//! <base>/blobs/sha256/ab/abcd1234...
//! ```
//!
//! Content is verified against the digest before storage and writes are
//! atomic (temp file + rename), so a crash never leaves a corrupt blob.

use crate::constants::BLOB_STORE_DIR;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Computes the canonical `sha256:<hex>` digest of `data`.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Content-addressed blob store.
///
/// Safe to share across threads; every operation is independent and writes
/// to the same blob converge on identical content.
pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store under the default location
    /// (`$HOME/.gadgetrun/blobs`, falling back to the working directory).
    pub fn new() -> Result<Self> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let base = home
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gadgetrun")
            .join(BLOB_STORE_DIR);
        Self::with_path(base)
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        info!(path = %base_dir.display(), "blob store initialized");
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Reads a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only SHA-256 digests are accepted, so every stored blob is verified.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
        if algo != "sha256" {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                computed: format!("unsupported algorithm '{}'", algo),
            });
        }

        let computed = hex::encode(Sha256::digest(data));
        if computed != expected {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                computed: format!("sha256:{}", computed),
            });
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!(digest, "blob already stored");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // unique temp name so concurrent writers of the same blob never
        // collide; the final rename is atomic and the content is identical
        let temp_path = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp_path, data)?;
        if let Err(err) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        debug!(digest, size = data.len(), "blob stored");
        Ok(())
    }

    /// Removes a blob. Missing blobs are not an error.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Maps a digest to its storage path.
    ///
    /// The digest is sanitized before building the path: the algorithm must
    /// be a known hash name and the hash hex-only, so a hostile digest can
    /// never escape the store directory.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!(algo, "unknown digest algorithm, defaulting to sha256");
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe_hash.len() != hash.len() {
            warn!(hash, "digest contained non-hex characters");
        }
        if safe_hash.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        let shard = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(shard).join(&safe_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(dir.path().join("blobs")).unwrap();

        let data = b"gadget wasm program";
        let digest = digest_of(data);
        assert!(!store.has_blob(&digest));

        store.put_blob(&digest, data).unwrap();
        assert!(store.has_blob(&digest));
        assert_eq!(store.get_blob(&digest).unwrap(), data);
    }

    #[test]
    fn put_rejects_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(dir.path().join("blobs")).unwrap();

        let err = store
            .put_blob(&digest_of(b"expected"), b"different")
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[test]
    fn hostile_digest_cannot_escape_store() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(dir.path().join("blobs")).unwrap();

        let path = store.blob_path("sha256:../../etc/passwd");
        assert!(path.starts_with(store.base_dir()));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(dir.path().join("blobs")).unwrap();

        let data = b"x";
        let digest = digest_of(data);
        store.put_blob(&digest, data).unwrap();
        store.remove_blob(&digest).unwrap();
        store.remove_blob(&digest).unwrap();
        assert!(!store.has_blob(&digest));
    }
}

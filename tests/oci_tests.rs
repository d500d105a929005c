//! Tests for the OCI handler: pull policy, verification, metadata
//! extraction and layer dispatch.

use gadgetrun::constants::{EBPF_PROGRAM_MEDIA_TYPE, WASM_PROGRAM_MEDIA_TYPE};
use gadgetrun::oci::verify::SigningKey;
use gadgetrun::{
    default_registry, Error, ErrorKind, GadgetContext, MemoryImageStore, ParamValues,
};
use std::sync::Arc;

const METADATA: &str = "name: test_gadget\ndescription: minimal gadget\n";

/// A guest that only carries the lifecycle exports.
const TRIVIAL_GUEST: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "init") (result i32) (i32.const 0))
  (func (export "start") (result i32) (i32.const 0))
  (func (export "stop") (result i32) (i32.const 0)))
"#;

fn no_verify() -> ParamValues {
    let mut params = ParamValues::new();
    params.set("oci.verify-image", "false");
    params
}

fn gadget_ctx(images: Arc<MemoryImageStore>, image: &str) -> Arc<GadgetContext> {
    GadgetContext::new(image, Arc::new(default_registry(images)))
}

// =============================================================================
// Pull Policy Tests
// =============================================================================

#[tokio::test]
async fn test_pull_never_with_absent_image_fails() {
    let images = Arc::new(MemoryImageStore::new());
    let ctx = gadget_ctx(images, "ghcr.io/gadget/absent:latest");

    let mut params = no_verify();
    params.set("oci.pull", "never");
    let err = ctx.prepare(&params).await.unwrap_err();
    assert!(matches!(err, Error::PullDisabled(_)));
    assert_eq!(err.kind(), ErrorKind::Image);
}

#[tokio::test]
async fn test_unknown_pull_policy_is_config_error() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    let mut params = no_verify();
    params.set("oci.pull", "sometimes");
    let err = ctx.prepare(&params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

// =============================================================================
// Verification Tests
// =============================================================================

#[tokio::test]
async fn test_signed_image_verifies_with_matching_key() {
    let images = Arc::new(MemoryImageStore::new());
    let manifest = images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );

    let key = SigningKey::generate().unwrap();
    let mut signed = manifest;
    key.sign_manifest(&mut signed);
    images.replace_manifest("img", signed);

    let ctx = gadget_ctx(images, "img");
    let mut params = ParamValues::new();
    params.set("oci.public-key", key.public_key_b64());
    ctx.prepare(&params).await.unwrap();
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_key_fails_verification() {
    let images = Arc::new(MemoryImageStore::new());
    let manifest = images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let signer = SigningKey::generate().unwrap();
    let mut signed = manifest;
    signer.sign_manifest(&mut signed);
    images.replace_manifest("img", signed);

    let other = SigningKey::generate().unwrap();
    let ctx = gadget_ctx(images, "img");
    let mut params = ParamValues::new();
    params.set("oci.public-key", other.public_key_b64());
    let err = ctx.prepare(&params).await.unwrap_err();
    assert!(matches!(err, Error::ImageUnverified { .. }));
}

#[tokio::test]
async fn test_unsigned_image_fails_when_verification_enabled() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );

    let key = SigningKey::generate().unwrap();
    let ctx = gadget_ctx(images, "img");
    let mut params = ParamValues::new();
    params.set("oci.public-key", key.public_key_b64());
    let err = ctx.prepare(&params).await.unwrap_err();
    assert!(matches!(err, Error::ImageUnverified { .. }));
}

// =============================================================================
// Metadata Tests
// =============================================================================

#[tokio::test]
async fn test_metadata_lands_on_context_raw_and_parsed() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    ctx.prepare(&no_verify()).await.unwrap();
    assert_eq!(ctx.metadata_raw().unwrap(), METADATA.as_bytes());
    let parsed = ctx.metadata().unwrap();
    assert_eq!(parsed.name, "test_gadget");
    assert_eq!(parsed.description, "minimal gadget");
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_metadata_is_fatal() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        b"{{{ not yaml",
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    let err = ctx.prepare(&no_verify()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Metadata);
    assert!(ctx.is_cancelled(), "fatal errors cancel the context");
}

#[tokio::test]
async fn test_nameless_metadata_passes_when_validation_disabled() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        b"description: no name here\n",
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    let mut params = no_verify();
    let err = ctx.prepare(&params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Metadata);

    // a fresh context with validation disabled accepts it
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        b"description: no name here\n",
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");
    params.set("oci.validate-metadata", "false");
    ctx.prepare(&params).await.unwrap();
    ctx.stop().await.unwrap();
}

// =============================================================================
// Layer Dispatch Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_layer_is_skipped() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[
            ("application/vnd.example.mystery.v1+binary", b"????".as_slice()),
            (WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes()),
        ],
    );
    let ctx = gadget_ctx(images, "img");

    ctx.prepare(&no_verify()).await.unwrap();
    ctx.start().await.unwrap();
    ctx.stop().await.unwrap();
}

/// A guest whose `start` export reports failure.
const FAILING_START_GUEST: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "init") (result i32) (i32.const 0))
  (func (export "start") (result i32) (i32.const 1)))
"#;

#[tokio::test]
async fn test_start_fails_when_no_instance_survives() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, FAILING_START_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    ctx.prepare(&no_verify()).await.unwrap();
    let err = ctx.start().await.unwrap_err();
    assert!(matches!(err, Error::NoValidLayers));
    assert_eq!(err.kind(), ErrorKind::Operator);
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_image_without_known_layers_fails() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(EBPF_PROGRAM_MEDIA_TYPE, b"\x7fELF".as_slice())],
    );
    let ctx = gadget_ctx(images, "img");

    let err = ctx.prepare(&no_verify()).await.unwrap_err();
    assert!(matches!(err, Error::NoValidLayers));
    assert_eq!(err.kind(), ErrorKind::Operator);
}

#[tokio::test]
async fn test_extra_params_are_published() {
    let images = Arc::new(MemoryImageStore::new());
    images.put_image(
        "img",
        METADATA.as_bytes(),
        &[(WASM_PROGRAM_MEDIA_TYPE, TRIVIAL_GUEST.as_bytes())],
    );
    let ctx = gadget_ctx(images, "img");

    ctx.prepare(&no_verify()).await.unwrap();
    let keys: Vec<String> = ctx.extra_params().into_iter().map(|d| d.key).collect();
    assert!(
        keys.iter().any(|k| k == "oci.wasm.allow-host-fs"),
        "wasm params published with operator prefixes, got {:?}",
        keys
    );
    ctx.stop().await.unwrap();
}

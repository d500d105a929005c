//! Constants for the gadget runtime.
//!
//! All limits, timeouts, media types and keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum OCI image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single gadget layer (64 MiB).
/// Gadget layers are wasm programs or kernel objects, not rootfs archives.
pub const MAX_LAYER_SIZE: usize = 64 * 1024 * 1024;

/// Maximum number of layers in a gadget image.
pub const MAX_LAYERS: usize = 16;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum metadata (config blob) size (1 MiB).
pub const MAX_METADATA_SIZE: usize = 1024 * 1024;

// =============================================================================
// Wasm Sandbox Limits
// =============================================================================

/// Maximum wasm program size (32 MiB).
pub const MAX_WASM_PROGRAM_SIZE: usize = 32 * 1024 * 1024;

/// Default linear memory limit per wasm instance (64 MiB).
pub const DEFAULT_WASM_MEMORY_BYTES: usize = 64 * 1024 * 1024;

/// Maximum nesting depth of guest-initiated emissions per instance.
pub const MAX_REENTRY_DEPTH: u32 = 8;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Time budget for the guest `stop` export before force-termination.
pub const GUEST_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time budget for stopping all operators on context teardown.
pub const OPERATOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Media Types
// =============================================================================

/// Media type of the gadget metadata document (the manifest config blob).
pub const GADGET_METADATA_MEDIA_TYPE: &str = "application/vnd.gadget.config.v1+yaml";

/// Media type of a wasm program layer.
pub const WASM_PROGRAM_MEDIA_TYPE: &str = "application/vnd.gadget.wasm.program.v1+binary";

/// Media type of a compiled kernel object layer.
pub const EBPF_PROGRAM_MEDIA_TYPE: &str = "application/vnd.gadget.ebpf.program.v1+binary";

// =============================================================================
// Image Verification
// =============================================================================

/// Manifest annotation carrying the Ed25519 signature over the manifest digest.
pub const SIGNATURE_ANNOTATION: &str = "io.gadget.signature.v1";

// =============================================================================
// Operator Defaults
// =============================================================================

/// Priority of the OCI handler. Runs before most operators.
pub const OCI_HANDLER_PRIORITY: i32 = -1000;

// =============================================================================
// Metadata Defaults
// =============================================================================

/// Default column width for fields whose width cannot be derived.
pub const DEFAULT_COLUMN_WIDTH: u32 = 16;

// =============================================================================
// Storage Paths
// =============================================================================

/// Subdirectory for OCI blob storage.
pub const BLOB_STORE_DIR: &str = "blobs";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

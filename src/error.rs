//! Error types for the gadget runtime.

use std::path::PathBuf;

/// Result type alias for gadget runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error category tags.
///
/// Every [`Error`] variant maps to exactly one kind; consumers dispatch on
/// the kind rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid parameter or unsupported enum value.
    Config,
    /// Pull, verification, manifest or platform failure.
    Image,
    /// Invalid gadget metadata or program type information.
    Metadata,
    /// Non-wasm operator instantiation or lifecycle failure.
    Operator,
    /// Wasm guest trap, OOM, non-zero init/start, stop timeout.
    Guest,
    /// Host-call contract violation: bad handle, bad string, kind mismatch.
    Abi,
    /// Context cancellation.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Config => "CONFIG",
            Self::Image => "IMAGE",
            Self::Metadata => "METADATA",
            Self::Operator => "OPERATOR",
            Self::Guest => "GUEST",
            Self::Abi => "ABI",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(tag)
    }
}

/// Errors that can occur in the gadget runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid parameter value.
    #[error("invalid value for parameter '{key}': {reason}")]
    InvalidParam { key: String, reason: String },

    /// Unsupported enum value for a parameter.
    #[error("unsupported value '{value}' for parameter '{key}'")]
    UnsupportedValue { key: String, value: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image absent locally and pulling is disabled.
    #[error("image '{0}' not present locally and pull policy is 'never'")]
    PullDisabled(String),

    /// Image not found in the registry.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Image signature verification failed.
    #[error("image '{reference}' could not be verified: {reason}")]
    ImageUnverified { reference: String, reason: String },

    /// No manifest matches the host platform.
    #[error("no manifest for platform {platform} in '{reference}'")]
    NoPlatform { reference: String, platform: String },

    /// Image or blob exceeds size limits.
    #[error("image content exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Blob content does not match its digest.
    #[error("digest mismatch for {digest}: computed {computed}")]
    DigestMismatch { digest: String, computed: String },

    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Metadata document could not be parsed.
    #[error("invalid gadget metadata: {0}")]
    InvalidMetadata(String),

    /// Metadata references something absent from the program type info.
    #[error("metadata validation failed: {0}")]
    MetadataValidation(String),

    /// Embedded gadget identifier does not follow the naming convention.
    #[error("invalid gadget identifier '{0}'")]
    BadIdentifier(String),

    // =========================================================================
    // Operator Errors
    // =========================================================================
    /// Operator instantiation failed.
    #[error("instantiating operator '{name}': {reason}")]
    OperatorInstantiation { name: String, reason: String },

    /// Operator lifecycle call failed.
    #[error("operator '{name}' failed during {phase}: {reason}")]
    OperatorLifecycle {
        name: String,
        phase: String,
        reason: String,
    },

    /// No layer produced a valid operator instance.
    #[error("image doesn't contain valid gadget layers")]
    NoValidLayers,

    // =========================================================================
    // Guest Errors
    // =========================================================================
    /// The wasm guest trapped.
    #[error("guest trapped: {0}")]
    GuestTrap(String),

    /// A guest lifecycle export returned non-zero.
    #[error("guest '{export}' returned {code}")]
    GuestFailed { export: String, code: u32 },

    /// The guest exceeded a resource limit.
    #[error("guest exceeded resource limits: {0}")]
    GuestResources(String),

    /// The guest `stop` export exceeded its time budget.
    #[error("guest stop timed out after {0:?}")]
    GuestStopTimeout(std::time::Duration),

    /// The guest program could not be compiled or linked.
    #[error("loading guest program: {0}")]
    GuestLoad(String),

    // =========================================================================
    // ABI Errors
    // =========================================================================
    /// A host call received an unknown or stale handle.
    #[error("unknown handle {0}")]
    BadHandle(u32),

    /// A string reference pointed outside guest memory.
    #[error("bad string reference: {0}")]
    BadString(String),

    /// Field accessed with the wrong kind.
    #[error("field '{field}' is {actual:?}, accessed as {requested:?}")]
    KindMismatch {
        field: String,
        actual: crate::datasource::FieldKind,
        requested: crate::datasource::FieldKind,
    },

    /// Field kind is reserved and not yet implemented.
    #[error("field kind {0:?} is not supported")]
    UnsupportedKind(crate::datasource::FieldKind),

    /// Schema mutation after the first emission.
    #[error("data source '{0}' is frozen")]
    SchemaFrozen(String),

    /// Field name already present in the schema.
    #[error("field '{field}' already exists on data source '{data_source}'")]
    DuplicateField { data_source: String, field: String },

    /// Field not found in the schema.
    #[error("field '{field}' not found on data source '{data_source}'")]
    FieldNotFound { data_source: String, field: String },

    /// Data source name already registered.
    #[error("data source '{0}' already exists")]
    DataSourceExists(String),

    /// String larger than the field's static size.
    #[error("string too long for field: {len} > {max}")]
    StringTooLong { len: usize, max: usize },

    /// Guest-initiated emission nested too deeply.
    #[error("emission recursion limit reached ({0})")]
    ReentryLimit(u32),

    /// All 2^32 handle slots are live.
    #[error("handle table exhausted")]
    HandleExhausted,

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// The gadget context was cancelled.
    #[error("gadget context cancelled")]
    Cancelled,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the stable category tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParam { .. } | Self::UnsupportedValue { .. } => ErrorKind::Config,

            Self::InvalidImageReference { .. }
            | Self::PullDisabled(_)
            | Self::ImageNotFound(_)
            | Self::ImagePullFailed { .. }
            | Self::ImageUnverified { .. }
            | Self::NoPlatform { .. }
            | Self::ImageTooLarge { .. }
            | Self::BlobNotFound { .. }
            | Self::DigestMismatch { .. }
            | Self::StorageInitFailed { .. }
            | Self::Io(_) => ErrorKind::Image,

            Self::InvalidMetadata(_) | Self::MetadataValidation(_) | Self::BadIdentifier(_) => {
                ErrorKind::Metadata
            }

            Self::OperatorInstantiation { .. }
            | Self::OperatorLifecycle { .. }
            | Self::NoValidLayers => ErrorKind::Operator,

            Self::GuestTrap(_)
            | Self::GuestFailed { .. }
            | Self::GuestResources(_)
            | Self::GuestStopTimeout(_)
            | Self::GuestLoad(_) => ErrorKind::Guest,

            Self::BadHandle(_)
            | Self::BadString(_)
            | Self::KindMismatch { .. }
            | Self::UnsupportedKind(_)
            | Self::SchemaFrozen(_)
            | Self::DuplicateField { .. }
            | Self::FieldNotFound { .. }
            | Self::DataSourceExists(_)
            | Self::StringTooLong { .. }
            | Self::ReentryLimit(_)
            | Self::HandleExhausted => ErrorKind::Abi,

            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error aborts the gadget context before `Start`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Image | ErrorKind::Metadata | ErrorKind::Cancelled
        )
    }
}

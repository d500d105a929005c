//! # gadgetrun
//!
//! **Observability gadget runtime**
//!
//! This crate loads self-contained "gadget" images from an OCI registry,
//! decodes their embedded metadata and code layers, and executes them in
//! process to produce structured event streams. A gadget bundles a YAML
//! metadata document plus executable layers; the most important layer is a
//! WebAssembly program that subscribes to event streams, reads and mutates
//! typed fields, and emits new events.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            gadgetrun                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Image Resolver ──► OCI Handler ──► (per layer) ──► Image Operators │
//! │                                                          │          │
//! │                                                          ▼          │
//! │                                                   Wasm Operator     │
//! │                                                   (wasmtime + env   │
//! │                                                    host-call ABI)   │
//! │                                                          │          │
//! │  ┌───────────────────────────────────────────────────────┴───────┐  │
//! │  │                     Data-Source Bus                           │  │
//! │  │        (typed schema + priority pub/sub + records)            │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! │                                                                     │
//! │  GadgetContext: sources │ vars │ metadata │ cancellation │ operators│
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   prepare(params)          start()              cancel / stop()
//!        │                      │                        │
//!        ▼                      ▼                        ▼
//!  Instantiated ────────► Prepared ────────► Started ────────► Stopped
//!  (pull, verify,        (guest init,       (guest start,    (guest stop
//!   metadata, layer       subscriptions)     emissions)       ≤ 5 s, then
//!   dispatch)                                                 force kill)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gadgetrun::{default_registry, GadgetContext, MemoryImageStore, ParamValues};
//! use std::sync::Arc;
//!
//! let images = Arc::new(MemoryImageStore::new());
//! // ... publish a gadget image into `images` ...
//!
//! let registry = Arc::new(default_registry(images));
//! let ctx = GadgetContext::new("ghcr.io/gadget/dns:latest", registry);
//!
//! ctx.prepare(&ParamValues::new()).await?;
//! ctx.start().await?;
//! // event streams flow; consumers subscribe via ctx.data_sources()
//! ctx.stop().await?;
//! ```
//!
//! # Sandbox Model
//!
//! Guests run default-deny: no host file system (unless
//! `wasm.allow-host-fs` is set, read-only), stdout/stderr piped to the host
//! logger, 64 MiB memory limit, optional fuel metering, bounded `stop`
//! with force-termination. Host objects cross the boundary only through
//! the handle table; every handle has a declared owner and all handles die
//! with the instance.

pub mod constants;
pub mod context;
pub mod datasource;
pub mod error;
pub mod handles;
pub mod metadata;
pub mod oci;
pub mod operators;
pub mod params;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use context::{GadgetContext, Var};
pub use datasource::{
    Data, DataSource, DataSourceKind, Field, FieldAccessor, FieldKind, FieldValue,
};
pub use error::{Error, ErrorKind, Result};
pub use handles::{HandleObject, HandleOwner, HandleTable};
pub use metadata::{GadgetMetadata, ProgramInfo};
pub use oci::{
    BlobStore, Descriptor, ImageManifest, ImageOptions, ImageStore, MemoryImageStore, PullPolicy,
    RegistryImageStore,
};
pub use operators::oci::{default_registry, OciHandler, PROGRAM_INFO_VAR};
pub use operators::wasm::{WasmOperator, WasmOperatorInstance};
pub use operators::{
    DataOperator, DataOperatorInstance, ImageOperator, ImageOperatorInstance, InstanceState,
    OperatorRegistry,
};
pub use params::{ParamDesc, ParamValues, TypeHint};

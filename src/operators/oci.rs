//! The OCI handler: turns an image reference into composed operator
//! instances.
//!
//! Runs before most operators (priority -1000). Instantiation ensures and
//! verifies the image, extracts the metadata document onto the context, and
//! dispatches each manifest layer to the image operator registered for its
//! media type; layers with no registered operator are skipped. Lifecycle
//! calls fan out to the image operator instances in manifest order, and
//! `stop` reaches every prepared instance even when some have failed.

use crate::constants::{MAX_METADATA_SIZE, OCI_HANDLER_PRIORITY};
use crate::context::GadgetContext;
use crate::error::{Error, Result};
use crate::metadata::{GadgetMetadata, ProgramInfo};
use crate::oci::{verify::verify_manifest, ImageOptions, ImageStore, PullPolicy};
use crate::operators::{
    DataOperator, DataOperatorInstance, ImageOperatorInstance, OperatorRegistry,
};
use crate::params::{ParamDesc, ParamValues, TypeHint};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Context variable under which a kernel-layer operator publishes the
/// program's type information ([`ProgramInfo`]) for metadata validation.
pub const PROGRAM_INFO_VAR: &str = "program-info";

const PARAM_AUTHFILE: &str = "authfile";
const PARAM_VALIDATE_METADATA: &str = "validate-metadata";
const PARAM_INSECURE: &str = "insecure";
const PARAM_PULL: &str = "pull";
const PARAM_PULL_SECRET: &str = "pull-secret";
const PARAM_VERIFY_IMAGE: &str = "verify-image";
const PARAM_PUBLIC_KEY: &str = "public-key";

/// The OCI handler data operator.
pub struct OciHandler {
    images: Arc<dyn ImageStore>,
}

impl OciHandler {
    pub fn new(images: Arc<dyn ImageStore>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl DataOperator for OciHandler {
    fn name(&self) -> &str {
        "oci"
    }

    fn priority(&self) -> i32 {
        OCI_HANDLER_PRIORITY
    }

    fn instance_params(&self) -> Vec<ParamDesc> {
        vec![
            ParamDesc::new(PARAM_AUTHFILE)
                .with_title("Auth file")
                .with_description("Path of the registry authentication file"),
            ParamDesc::new(PARAM_VALIDATE_METADATA)
                .with_title("Validate metadata")
                .with_description("Validate the gadget metadata before running the gadget")
                .with_default("true")
                .with_type_hint(TypeHint::Bool),
            ParamDesc::new(PARAM_INSECURE)
                .with_title("Insecure connection")
                .with_description("Allow connections to HTTP only registries")
                .with_default("false")
                .with_type_hint(TypeHint::Bool),
            ParamDesc::new(PARAM_PULL)
                .with_title("Pull policy")
                .with_description("Specify when the gadget image should be pulled")
                .with_default(PullPolicy::Missing.as_str())
                .with_possible_values([
                    PullPolicy::Always.as_str(),
                    PullPolicy::Missing.as_str(),
                    PullPolicy::Never.as_str(),
                ]),
            ParamDesc::new(PARAM_PULL_SECRET)
                .with_title("Pull secret")
                .with_description("Docker-config file with the secret to pull the gadget image"),
            ParamDesc::new(PARAM_VERIFY_IMAGE)
                .with_title("Verify image")
                .with_description("Verify the image using the provided public key")
                .with_default("true")
                .with_type_hint(TypeHint::Bool),
            ParamDesc::new(PARAM_PUBLIC_KEY)
                .with_title("Public key")
                .with_description("Public key used to verify the image"),
        ]
    }

    async fn instantiate(
        &self,
        ctx: &Arc<GadgetContext>,
        params: ParamValues,
    ) -> Result<Arc<dyn DataOperatorInstance>> {
        let image = ctx.image_name().to_string();
        if image.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: image,
                reason: "image name is empty".to_string(),
            });
        }
        let descs = self.instance_params();

        let opts = ImageOptions {
            auth_file: non_empty_path(params.resolve(PARAM_AUTHFILE, &descs)),
            pull_secret: non_empty_path(params.resolve(PARAM_PULL_SECRET, &descs)),
            insecure: params.resolve_bool(PARAM_INSECURE, &descs)?,
        };
        let policy: PullPolicy = params.resolve_enum(PARAM_PULL, &descs)?.parse()?;
        let verify = params.resolve_bool(PARAM_VERIFY_IMAGE, &descs)?;
        let validate = params.resolve_bool(PARAM_VALIDATE_METADATA, &descs)?;

        self.images.ensure(&image, &opts, policy).await?;
        let manifest = self.images.manifest_for_host(&image).await?;

        if verify {
            let public_key = params.resolve(PARAM_PUBLIC_KEY, &descs);
            verify_manifest(&manifest, &image, public_key)?;
        } else {
            debug!(image = %image, "image verification disabled");
        }

        // the config descriptor is the gadget metadata document
        let raw = self.images.read_content(&manifest.config).await?;
        if raw.len() > MAX_METADATA_SIZE {
            return Err(Error::ImageTooLarge {
                size: raw.len() as u64,
                limit: MAX_METADATA_SIZE as u64,
            });
        }
        let metadata = GadgetMetadata::from_yaml(&raw)?;

        let validation = validate_metadata(ctx, &metadata);
        if validate {
            validation?;
        } else if let Err(err) = validation {
            warn!(error = %err, "metadata validation skipped by request");
        }

        ctx.set_metadata_raw(raw);
        ctx.publish_params(metadata.param_descs());
        ctx.set_metadata(metadata);

        // dispatch layers to their operators
        let mut instances: Vec<Arc<dyn ImageOperatorInstance>> = Vec::new();
        for layer in &manifest.layers {
            debug!(media_type = %layer.media_type, digest = %layer.digest, "layer");
            let Some(op) = ctx.operators().image_operator_for(&layer.media_type) else {
                debug!(media_type = %layer.media_type, "no operator for layer, skipping");
                continue;
            };
            let op_params = params.extract_prefixed(op.name());
            match op.instantiate(ctx, layer.clone(), op_params).await {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => debug!(operator = op.name(), "layer skipped by operator"),
                Err(err) => {
                    error!(operator = op.name(), error = %err, "instantiating operator");
                }
            }
        }

        if instances.is_empty() {
            return Err(Error::NoValidLayers);
        }

        Ok(Arc::new(OciHandlerInstance {
            instances,
            prepared: Mutex::new(Vec::new()),
            extra_params: Mutex::new(Vec::new()),
        }))
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn validate_metadata(ctx: &Arc<GadgetContext>, metadata: &GadgetMetadata) -> Result<()> {
    match ctx.var_as::<ProgramInfo>(PROGRAM_INFO_VAR) {
        Some(info) => metadata.validate(&info),
        // no kernel layer published type info; only structural checks apply
        None if metadata.name.is_empty() => {
            Err(Error::InvalidMetadata("gadget name is required".to_string()))
        }
        None => Ok(()),
    }
}

/// A live OCI handler bound to one gadget context.
pub struct OciHandlerInstance {
    instances: Vec<Arc<dyn ImageOperatorInstance>>,
    /// Indices of instances that prepared successfully.
    prepared: Mutex<Vec<usize>>,
    extra_params: Mutex<Vec<ParamDesc>>,
}

impl OciHandlerInstance {
    /// Image operator instances in manifest order.
    pub fn image_instances(&self) -> &[Arc<dyn ImageOperatorInstance>] {
        &self.instances
    }
}

#[async_trait]
impl DataOperatorInstance for OciHandlerInstance {
    fn name(&self) -> &str {
        "oci"
    }

    fn extra_params(&self) -> Vec<ParamDesc> {
        self.extra_params.lock().expect("param lock poisoned").clone()
    }

    async fn prepare(&self, ctx: &Arc<GadgetContext>) -> Result<()> {
        let mut prepared = Vec::new();
        let mut extra = Vec::new();
        for (idx, instance) in self.instances.iter().enumerate() {
            match instance.prepare(ctx).await {
                Ok(()) => {
                    extra.extend(
                        instance
                            .extra_params()
                            .into_iter()
                            .map(|d| d.prefixed(instance.name())),
                    );
                    prepared.push(idx);
                }
                Err(err) => {
                    error!(operator = instance.name(), error = %err, "preparing operator");
                }
            }
        }
        if prepared.is_empty() {
            return Err(Error::NoValidLayers);
        }
        *self.prepared.lock().expect("prepared lock poisoned") = prepared;
        *self.extra_params.lock().expect("param lock poisoned") = extra;
        Ok(())
    }

    async fn start(&self, ctx: &Arc<GadgetContext>) -> Result<()> {
        let prepared = self.prepared.lock().expect("prepared lock poisoned").clone();
        let mut started = 0usize;
        for idx in prepared {
            let instance = &self.instances[idx];
            match instance.start(ctx).await {
                Ok(()) => started += 1,
                Err(err) => {
                    error!(operator = instance.name(), error = %err, "starting operator");
                }
            }
        }
        // stop() still reaches every prepared instance, started or not
        if started == 0 {
            return Err(Error::NoValidLayers);
        }
        Ok(())
    }

    async fn stop(&self, ctx: &Arc<GadgetContext>) -> Result<()> {
        let prepared = self.prepared.lock().expect("prepared lock poisoned").clone();
        let mut first_err = None;
        for idx in prepared {
            let instance = &self.instances[idx];
            if let Err(err) = instance.stop(ctx).await {
                error!(operator = instance.name(), error = %err, "stopping operator");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Builds a registry wired with the default operators: the OCI handler and
/// the wasm operator, both over `images`.
pub fn default_registry(images: Arc<dyn ImageStore>) -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    registry.register_data_operator(Arc::new(OciHandler::new(Arc::clone(&images))));
    registry.register_image_operator(Arc::new(crate::operators::wasm::WasmOperator::new(images)));
    registry
}

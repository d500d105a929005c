//! The gadget context: process-lifetime state of one gadget execution.
//!
//! The context owns the data-source registry, the variable bag, the raw and
//! parsed metadata, the cancellation signal and the set of operator
//! instances. Operator instances hold only a weak back-pointer; the context
//! owns them, never the other way around.

use crate::constants::OPERATOR_STOP_TIMEOUT;
use crate::datasource::{DataSource, DataSourceKind, DataSourceRegistry};
use crate::error::{Error, Result};
use crate::metadata::GadgetMetadata;
use crate::operators::{DataOperatorInstance, OperatorRegistry};
use crate::params::{ParamDesc, ParamValues};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An opaque value in the context's variable bag.
pub type Var = Arc<dyn Any + Send + Sync>;

/// Context bound to one gadget execution.
pub struct GadgetContext {
    image_name: String,
    operators: Arc<OperatorRegistry>,
    data_sources: DataSourceRegistry,
    vars: RwLock<HashMap<String, Var>>,
    metadata_raw: RwLock<Option<Vec<u8>>>,
    metadata: RwLock<Option<GadgetMetadata>>,
    extra_params: RwLock<Vec<ParamDesc>>,
    instances: RwLock<Vec<Arc<dyn DataOperatorInstance>>>,
    cancel: CancellationToken,
    /// Back-reference handed to operators; they hold it weakly.
    self_weak: std::sync::Weak<GadgetContext>,
}

impl GadgetContext {
    /// Creates a context for `image_name` with the injected operator
    /// registry.
    pub fn new(image_name: impl Into<String>, operators: Arc<OperatorRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            image_name: image_name.into(),
            operators,
            data_sources: DataSourceRegistry::default(),
            vars: RwLock::new(HashMap::new()),
            metadata_raw: RwLock::new(None),
            metadata: RwLock::new(None),
            extra_params: RwLock::new(Vec::new()),
            instances: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            self_weak: self_weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("gadget context alive")
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn operators(&self) -> &Arc<OperatorRegistry> {
        &self.operators
    }

    // =========================================================================
    // Data Sources
    // =========================================================================

    /// Creates and registers a new data source. Fails with an `ABI` error
    /// if the name is taken, and with `CANCELLED` after cancellation.
    pub fn register_data_source(
        &self,
        kind: DataSourceKind,
        name: &str,
    ) -> Result<Arc<DataSource>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.data_sources
            .register(kind, name, self.cancel.child_token())
    }

    pub fn get_data_source(&self, name: &str) -> Option<Arc<DataSource>> {
        self.data_sources.get(name)
    }

    /// Snapshot of all registered data sources.
    pub fn data_sources(&self) -> HashMap<String, Arc<DataSource>> {
        self.data_sources.snapshot()
    }

    // =========================================================================
    // Variables
    // =========================================================================

    /// Stores an opaque value under `name`, replacing any previous value.
    pub fn set_var(&self, name: &str, value: Var) {
        self.vars
            .write()
            .expect("var lock poisoned")
            .insert(name.to_string(), value);
    }

    pub fn var(&self, name: &str) -> Option<Var> {
        self.vars.read().expect("var lock poisoned").get(name).cloned()
    }

    /// Typed lookup into the variable bag.
    pub fn var_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.var(name).and_then(|v| v.downcast::<T>().ok())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Stores the raw metadata document for serialization to consumers.
    pub fn set_metadata_raw(&self, raw: Vec<u8>) {
        *self.metadata_raw.write().expect("metadata lock poisoned") = Some(raw);
    }

    pub fn metadata_raw(&self) -> Option<Vec<u8>> {
        self.metadata_raw.read().expect("metadata lock poisoned").clone()
    }

    pub fn set_metadata(&self, metadata: GadgetMetadata) {
        *self.metadata.write().expect("metadata lock poisoned") = Some(metadata);
    }

    pub fn metadata(&self) -> Option<GadgetMetadata> {
        self.metadata.read().expect("metadata lock poisoned").clone()
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Publishes parameter descriptors collected from operator instances.
    pub fn publish_params(&self, params: Vec<ParamDesc>) {
        self.extra_params
            .write()
            .expect("param lock poisoned")
            .extend(params);
    }

    pub fn extra_params(&self) -> Vec<ParamDesc> {
        self.extra_params.read().expect("param lock poisoned").clone()
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// The context's cancellation token. Operators watch child tokens.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Instantiates and prepares all registered data operators in priority
    /// order.
    ///
    /// `CONFIG`, `IMAGE` and `METADATA` failures are fatal and abort the
    /// context. `OPERATOR` failures omit the failing instance; if no
    /// instance survives, the context fails.
    pub async fn prepare(&self, params: &ParamValues) -> Result<()> {
        let this = self.arc();
        let mut prepared = Vec::new();

        for op in self.operators.data_operators() {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let op_params = params.extract_prefixed(op.name());
            let instance = match op.instantiate(&this, op_params).await {
                Ok(instance) => instance,
                Err(err) if err.is_fatal() => {
                    error!(operator = op.name(), error = %err, "fatal instantiation failure");
                    self.cancel();
                    return Err(err);
                }
                Err(err) => {
                    warn!(operator = op.name(), error = %err, "operator omitted");
                    continue;
                }
            };

            match instance.prepare(&this).await {
                Ok(()) => {
                    let published: Vec<ParamDesc> = instance
                        .extra_params()
                        .into_iter()
                        .map(|d| d.prefixed(op.name()))
                        .collect();
                    self.publish_params(published);
                    prepared.push(instance);
                }
                Err(err) if err.is_fatal() => {
                    error!(operator = op.name(), error = %err, "fatal prepare failure");
                    self.cancel();
                    return Err(err);
                }
                Err(err) => {
                    warn!(operator = op.name(), error = %err, "operator omitted after prepare failure");
                }
            }
        }

        if prepared.is_empty() {
            self.cancel();
            return Err(Error::NoValidLayers);
        }

        *self.instances.write().expect("instance lock poisoned") = prepared;
        Ok(())
    }

    /// Starts all prepared operators. Freezes every data source first: from
    /// here on the schemas are immutable.
    pub async fn start(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let this = self.arc();
        self.data_sources.freeze_all();

        let instances = self.instances.read().expect("instance lock poisoned").clone();
        let mut started = 0usize;
        for instance in &instances {
            match instance.start(&this).await {
                Ok(()) => started += 1,
                Err(err) => {
                    warn!(operator = instance.name(), error = %err, "start failed, instance omitted");
                }
            }
        }

        if started == 0 {
            self.cancel();
            return Err(Error::NoValidLayers);
        }
        info!(image = %self.image_name, operators = started, "gadget started");
        Ok(())
    }

    /// Stops every instance, each under a bounded timeout. Invoked for all
    /// instances even when some fail.
    pub async fn stop(&self) -> Result<()> {
        self.cancel();
        let this = self.arc();
        let instances: Vec<_> = std::mem::take(
            &mut *self.instances.write().expect("instance lock poisoned"),
        );

        let mut first_err = None;
        for instance in instances.iter().rev() {
            match tokio::time::timeout(OPERATOR_STOP_TIMEOUT, instance.stop(&this)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(operator = instance.name(), error = %err, "stop failed");
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    let err = Error::OperatorLifecycle {
                        name: instance.name().to_string(),
                        phase: "stop".to_string(),
                        reason: format!("timed out after {:?}", OPERATOR_STOP_TIMEOUT),
                    };
                    error!(operator = instance.name(), "stop timed out");
                    first_err.get_or_insert(err);
                }
            }
        }
        debug!(image = %self.image_name, "gadget stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drives the full lifecycle: prepare, start, wait for cancellation,
    /// stop.
    pub async fn run(&self, params: &ParamValues) -> Result<()> {
        self.prepare(params).await?;
        self.start().await?;
        self.cancel.cancelled().await;
        self.stop().await
    }
}

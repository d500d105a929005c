//! Operators: the composable units a gadget execution is made of.
//!
//! *Image operators* are bound to one OCI layer, selected by the layer's
//! media type (the wasm operator is the most important one). *Data
//! operators* participate in the gadget lifecycle independent of layers;
//! the OCI handler itself is a data operator that instantiates and drives
//! the image operators.
//!
//! The registry mapping media types to operators is a value injected into
//! each gadget context, not process-global state; tests compose local
//! registries.

pub mod oci;
pub mod wasm;

use crate::context::GadgetContext;
use crate::error::Result;
use crate::oci::Descriptor;
use crate::params::{ParamDesc, ParamValues};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle state of an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Instantiated,
    Prepared,
    Started,
    Stopped,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instantiated => write!(f, "instantiated"),
            Self::Prepared => write!(f, "prepared"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Image Operators
// =============================================================================

/// An operator handling gadget image layers of one media type.
#[async_trait]
pub trait ImageOperator: Send + Sync {
    fn name(&self) -> &str;

    /// The layer media type this operator consumes.
    fn media_type(&self) -> &str;

    /// Creates an instance bound to one layer. Returning `Ok(None)` skips
    /// the layer without failing the image.
    async fn instantiate(
        &self,
        ctx: &Arc<GadgetContext>,
        layer: Descriptor,
        params: ParamValues,
    ) -> Result<Option<Arc<dyn ImageOperatorInstance>>>;
}

/// A live operator bound to one image layer.
#[async_trait]
pub trait ImageOperatorInstance: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> InstanceState;

    /// Parameters discovered at instantiation time, published on the context.
    fn extra_params(&self) -> Vec<ParamDesc> {
        Vec::new()
    }

    async fn prepare(&self, ctx: &Arc<GadgetContext>) -> Result<()>;

    async fn start(&self, ctx: &Arc<GadgetContext>) -> Result<()>;

    async fn stop(&self, ctx: &Arc<GadgetContext>) -> Result<()>;
}

// =============================================================================
// Data Operators
// =============================================================================

/// An operator that participates in every gadget execution, subscribing to
/// or producing data sources.
#[async_trait]
pub trait DataOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Lifecycle ordering; lower priorities run first.
    fn priority(&self) -> i32 {
        0
    }

    /// Parameters this operator accepts, addressed as `<name>.<key>`.
    fn instance_params(&self) -> Vec<ParamDesc> {
        Vec::new()
    }

    async fn instantiate(
        &self,
        ctx: &Arc<GadgetContext>,
        params: ParamValues,
    ) -> Result<Arc<dyn DataOperatorInstance>>;
}

/// A live data operator within one gadget context.
#[async_trait]
pub trait DataOperatorInstance: Send + Sync {
    fn name(&self) -> &str;

    fn extra_params(&self) -> Vec<ParamDesc> {
        Vec::new()
    }

    async fn prepare(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Operators available to a gadget context.
///
/// Constructed per context (or shared between contexts) and injected at
/// construction time.
#[derive(Default)]
pub struct OperatorRegistry {
    image_ops: HashMap<String, Arc<dyn ImageOperator>>,
    data_ops: Vec<Arc<dyn DataOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an image operator under its media type. The last
    /// registration for a media type wins.
    pub fn register_image_operator(&mut self, op: Arc<dyn ImageOperator>) {
        self.image_ops.insert(op.media_type().to_string(), op);
    }

    pub fn register_data_operator(&mut self, op: Arc<dyn DataOperator>) {
        self.data_ops.push(op);
    }

    /// Looks up the image operator registered for a layer media type.
    pub fn image_operator_for(&self, media_type: &str) -> Option<Arc<dyn ImageOperator>> {
        self.image_ops.get(media_type).cloned()
    }

    /// Data operators in priority order (stable for equal priorities).
    pub fn data_operators(&self) -> Vec<Arc<dyn DataOperator>> {
        let mut ops = self.data_ops.clone();
        ops.sort_by_key(|op| op.priority());
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedOp(&'static str, i32);

    #[async_trait]
    impl DataOperator for NamedOp {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }

        async fn instantiate(
            &self,
            _ctx: &Arc<GadgetContext>,
            _params: ParamValues,
        ) -> Result<Arc<dyn DataOperatorInstance>> {
            unimplemented!("registry test only")
        }
    }

    #[test]
    fn data_operators_sort_by_priority_stably() {
        let mut registry = OperatorRegistry::new();
        registry.register_data_operator(Arc::new(NamedOp("b", 0)));
        registry.register_data_operator(Arc::new(NamedOp("oci", -1000)));
        registry.register_data_operator(Arc::new(NamedOp("c", 0)));

        let ops = registry.data_operators();
        let names: Vec<&str> = ops.iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["oci", "b", "c"]);
    }
}

//! The wasm operator: sandboxed guest programs as first-class operators.
//!
//! Each wasm layer of a gadget image becomes one instance embedding a
//! [`wasmtime`] guest. The guest participates through the `env` host-call
//! surface (see [`datasource`] and [`fields`]) and the lifecycle exports
//! `init`, `start` and `stop`, each of which must return 0. `stop` runs
//! under a bounded deadline; on timeout the instance is force-terminated
//! via epoch interruption.
//!
//! Sandbox defaults deny everything: no host file system unless
//! `allow-host-fs` is set, stdout/stderr piped to the host logger, memory
//! capped at 64 MiB, optional fuel metering.

pub(crate) mod marshal;
pub(crate) mod reentry;

mod datasource;
mod fields;

use crate::constants::{
    DEFAULT_WASM_MEMORY_BYTES, GUEST_STOP_TIMEOUT, MAX_REENTRY_DEPTH, MAX_WASM_PROGRAM_SIZE,
    WASM_PROGRAM_MEDIA_TYPE,
};
use crate::context::GadgetContext;
use crate::datasource::{Data, DataSource};
use crate::error::{Error, ErrorKind, Result};
use crate::handles::{HandleObject, HandleOwner, HandleTable};
use crate::oci::{Descriptor, ImageStore};
use crate::operators::{ImageOperator, ImageOperatorInstance, InstanceState};
use crate::params::{ParamDesc, ParamValues, TypeHint};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wasmtime::{
    Config, Engine, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    TypedFunc,
};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

const PARAM_ALLOW_HOST_FS: &str = "allow-host-fs";
const PARAM_MEMORY_LIMIT: &str = "memory-limit";
const PARAM_FUEL: &str = "fuel";

/// Capacity of the guest stdout/stderr capture pipes.
const STDIO_PIPE_CAPACITY: usize = 64 * 1024;

static INSTANCE_IDS: AtomicU64 = AtomicU64::new(1);

fn instance_params() -> Vec<ParamDesc> {
    vec![
        ParamDesc::new(PARAM_ALLOW_HOST_FS)
            .with_title("Allow host filesystem")
            .with_description("Expose the host root read-only to the guest")
            .with_default("false")
            .with_type_hint(TypeHint::Bool),
        ParamDesc::new(PARAM_MEMORY_LIMIT)
            .with_title("Memory limit")
            .with_description("Linear memory limit for the guest, in bytes")
            .with_default(DEFAULT_WASM_MEMORY_BYTES.to_string())
            .with_type_hint(TypeHint::Uint),
        ParamDesc::new(PARAM_FUEL)
            .with_title("Fuel")
            .with_description("Execution fuel for the guest; empty means unmetered")
            .with_type_hint(TypeHint::Uint),
    ]
}

/// The operator handling wasm program layers.
pub struct WasmOperator {
    images: Arc<dyn ImageStore>,
}

impl WasmOperator {
    pub fn new(images: Arc<dyn ImageStore>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl ImageOperator for WasmOperator {
    fn name(&self) -> &str {
        "wasm"
    }

    fn media_type(&self) -> &str {
        WASM_PROGRAM_MEDIA_TYPE
    }

    async fn instantiate(
        &self,
        ctx: &Arc<GadgetContext>,
        layer: Descriptor,
        params: ParamValues,
    ) -> Result<Option<Arc<dyn ImageOperatorInstance>>> {
        let instance =
            WasmOperatorInstance::new(ctx, layer, Arc::clone(&self.images), &params)?;
        Ok(Some(instance))
    }
}

fn parse_uint(params: &ParamValues, key: &str, descs: &[ParamDesc]) -> Result<Option<u64>> {
    let raw = params.resolve(key, descs);
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u64>().map(Some).map_err(|_| Error::InvalidParam {
        key: key.to_string(),
        reason: format!("expected an unsigned integer, got '{}'", raw),
    })
}

/// Sandbox configuration of one wasm instance.
#[derive(Debug, Clone)]
struct SandboxConfig {
    allow_host_fs: bool,
    memory_bytes: usize,
    fuel: Option<u64>,
}

/// State reachable from host calls.
pub(crate) struct HostState {
    pub(crate) shared: Arc<InstanceShared>,
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// The live guest: store, instance and cached exports.
pub(crate) struct GuestRuntime {
    store: Store<HostState>,
    instance: Instance,
    ds_callback: Option<TypedFunc<(u64, u32, u32), ()>>,
    engine: Engine,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
}

/// State shared between the operator instance, host calls and subscriber
/// closures.
pub(crate) struct InstanceShared {
    pub(crate) id: u64,
    pub(crate) ctx: Weak<GadgetContext>,
    pub(crate) handles: Arc<HandleTable>,
    depth: AtomicU32,
    /// Set when a nested (re-entrant) callback trapped; the emit host call
    /// converts it into a trap of the outer activation.
    failed: AtomicBool,
    state: Mutex<InstanceState>,
    guest: Mutex<Option<GuestRuntime>>,
}

impl InstanceShared {
    pub(crate) fn state(&self) -> InstanceState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// True when a nested callback trapped and the failure has not yet been
    /// converted into a trap of the outer activation.
    pub(crate) fn take_failure(&self) -> bool {
        self.failed.swap(false, Ordering::SeqCst)
    }

    /// Invokes the guest's `dsCallback` export for one emission.
    ///
    /// Dispatch goes through the innermost re-entry frame when the guest
    /// itself is emitting, and through the guest lock otherwise. Short-lived
    /// source/record handles are allocated for the duration of the call.
    pub(crate) fn invoke_callback(
        &self,
        cb_id: u64,
        source: &Arc<DataSource>,
        data: &Data,
    ) -> Result<()> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst);
        let _depth_guard = DepthGuard(&self.depth);
        if depth >= MAX_REENTRY_DEPTH {
            warn!(instance = self.id, "emission recursion limit reached");
            return Err(Error::ReentryLimit(MAX_REENTRY_DEPTH));
        }

        let ds_handle = self
            .handles
            .add(HandleObject::DataSource(Arc::clone(source)), HandleOwner::Callback);
        let data_handle = self
            .handles
            .add(HandleObject::Data(data.clone()), HandleOwner::Callback);
        if ds_handle == 0 || data_handle == 0 {
            self.handles.release_callback_handles(&[ds_handle, data_handle]);
            return Err(Error::HandleExhausted);
        }

        let result = match reentry::with_active(self.id, |invoker| {
            invoker.ds_callback(cb_id, ds_handle, data_handle)
        }) {
            Some(result) => {
                if let Err(err) = &result {
                    if err.kind() == ErrorKind::Guest {
                        // can't tear down here: the store is borrowed
                        // up-stack; the emit host call traps the outer
                        // activation instead
                        self.failed.store(true, Ordering::SeqCst);
                    }
                }
                result
            }
            None => self.invoke_via_lock(cb_id, ds_handle, data_handle),
        };

        self.handles.release_callback_handles(&[ds_handle, data_handle]);
        result
    }

    fn invoke_via_lock(&self, cb_id: u64, ds_handle: u32, data_handle: u32) -> Result<()> {
        let mut guard = self.guest.lock().expect("guest lock poisoned");
        let Some(runtime) = guard.as_mut() else {
            debug!(instance = self.id, "callback after stop, ignoring");
            return Ok(());
        };
        let Some(ref callback) = runtime.ds_callback else {
            warn!(instance = self.id, "guest does not export dsCallback");
            return Ok(());
        };

        match callback.call(&mut runtime.store, (cb_id, ds_handle, data_handle)) {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = map_guest_err(err);
                if err.kind() == ErrorKind::Guest {
                    error!(instance = self.id, error = %err, "guest failed, terminating instance");
                    teardown(&mut guard, &self.handles);
                    self.set_state(InstanceState::Stopped);
                }
                Err(err)
            }
        }
    }
}

struct DepthGuard<'a>(&'a AtomicU32);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drops the guest runtime, drains its stdio into the host logger and
/// invalidates every outstanding handle.
fn teardown(guard: &mut Option<GuestRuntime>, handles: &HandleTable) {
    if let Some(runtime) = guard.take() {
        let stdout = runtime.stdout.contents();
        if !stdout.is_empty() {
            info!(stream = "stdout", "guest: {}", String::from_utf8_lossy(&stdout).trim_end());
        }
        let stderr = runtime.stderr.contents();
        if !stderr.is_empty() {
            warn!(stream = "stderr", "guest: {}", String::from_utf8_lossy(&stderr).trim_end());
        }
    }
    handles.clear();
}

pub(crate) fn map_guest_err(err: wasmtime::Error) -> Error {
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => Error::GuestStopTimeout(GUEST_STOP_TIMEOUT),
        Some(Trap::OutOfFuel) => Error::GuestResources("fuel exhausted".to_string()),
        Some(trap) => Error::GuestTrap(trap.to_string()),
        None => Error::GuestTrap(err.to_string()),
    }
}

/// A wasm operator instance bound to one image layer.
pub struct WasmOperatorInstance {
    layer: Descriptor,
    images: Arc<dyn ImageStore>,
    sandbox: SandboxConfig,
    shared: Arc<InstanceShared>,
}

impl std::fmt::Debug for WasmOperatorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmOperatorInstance")
            .field("layer", &self.layer)
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl WasmOperatorInstance {
    /// Creates an instance bound to one wasm layer.
    pub fn new(
        ctx: &Arc<GadgetContext>,
        layer: Descriptor,
        images: Arc<dyn ImageStore>,
        params: &ParamValues,
    ) -> Result<Arc<Self>> {
        let descs = instance_params();
        let sandbox = SandboxConfig {
            allow_host_fs: params.resolve_bool(PARAM_ALLOW_HOST_FS, &descs)?,
            memory_bytes: parse_uint(params, PARAM_MEMORY_LIMIT, &descs)?
                .unwrap_or(DEFAULT_WASM_MEMORY_BYTES as u64) as usize,
            fuel: parse_uint(params, PARAM_FUEL, &descs)?,
        };

        Ok(Arc::new(Self {
            layer,
            images,
            sandbox,
            shared: Arc::new(InstanceShared {
                id: INSTANCE_IDS.fetch_add(1, Ordering::Relaxed),
                ctx: Arc::downgrade(ctx),
                handles: Arc::new(HandleTable::new()),
                depth: AtomicU32::new(0),
                failed: AtomicBool::new(false),
                state: Mutex::new(InstanceState::Instantiated),
                guest: Mutex::new(None),
            }),
        }))
    }

    /// Live handle count; zero after stop.
    pub fn live_handles(&self) -> usize {
        self.shared.handles.live_count()
    }

    fn load(&self, program: &[u8]) -> Result<()> {
        if program.len() > MAX_WASM_PROGRAM_SIZE {
            return Err(Error::GuestLoad(format!(
                "program too large: {} > {} bytes",
                program.len(),
                MAX_WASM_PROGRAM_SIZE
            )));
        }

        let mut config = Config::new();
        config.epoch_interruption(true);
        config.wasm_memory64(false);
        if self.sandbox.fuel.is_some() {
            config.consume_fuel(true);
        }
        let engine =
            Engine::new(&config).map_err(|e| Error::GuestLoad(format!("engine: {}", e)))?;

        let stdout = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);
        let mut wasi = WasiCtxBuilder::new();
        wasi.stdout(stdout.clone()).stderr(stderr.clone());
        if self.sandbox.allow_host_fs {
            wasi.preopened_dir("/", "/", DirPerms::READ, FilePerms::READ)
                .map_err(|e| Error::GuestLoad(format!("exposing host fs: {}", e)))?;
        }
        let wasi = wasi.build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.sandbox.memory_bytes)
            .build();

        let mut store = Store::new(
            &engine,
            HostState {
                shared: Arc::clone(&self.shared),
                wasi,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        if let Some(fuel) = self.sandbox.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| Error::GuestLoad(format!("fuel: {}", e)))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| Error::GuestLoad(format!("wasi: {}", e)))?;
        datasource::add_to_linker(&mut linker)?;
        fields::add_to_linker(&mut linker)?;

        let module = Module::new(&engine, program)
            .map_err(|e| Error::GuestLoad(format!("compiling program: {}", e)))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(map_guest_err)?;

        // wasi reactor convention
        if let Ok(initialize) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            initialize.call(&mut store, ()).map_err(map_guest_err)?;
        }

        instance
            .get_typed_func::<u32, u32>(&mut store, "malloc")
            .map_err(|_| Error::GuestLoad("guest does not export malloc".to_string()))?;
        let ds_callback = instance
            .get_typed_func::<(u64, u32, u32), ()>(&mut store, "dsCallback")
            .ok();

        let mut guard = self.shared.guest.lock().expect("guest lock poisoned");
        *guard = Some(GuestRuntime {
            store,
            instance,
            ds_callback,
            engine,
            stdout,
            stderr,
        });
        Ok(())
    }

    /// Calls an optional nullary guest export returning `u32`.
    fn call_export_sync(
        shared: &InstanceShared,
        name: &'static str,
        require_zero: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut guard = shared.guest.lock().expect("guest lock poisoned");
        let Some(runtime) = guard.as_mut() else {
            return Ok(());
        };
        let Ok(func) = runtime
            .instance
            .get_typed_func::<(), u32>(&mut runtime.store, name)
        else {
            debug!(export = name, "guest export absent, skipping");
            return Ok(());
        };

        let watchdog = timeout.map(|t| Watchdog::arm(runtime.engine.clone(), t));
        let result = func.call(&mut runtime.store, ());
        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        match result {
            Ok(0) => Ok(()),
            Ok(_) if !require_zero => Ok(()),
            Ok(code) => Err(Error::GuestFailed {
                export: name.to_string(),
                code,
            }),
            Err(err) => Err(map_guest_err(err)),
        }
    }

    async fn call_export(
        &self,
        name: &'static str,
        require_zero: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            Self::call_export_sync(&shared, name, require_zero, timeout)
        })
        .await
        .map_err(|e| Error::GuestTrap(format!("lifecycle task failed: {}", e)))?
    }

    fn teardown(&self) {
        let mut guard = self.shared.guest.lock().expect("guest lock poisoned");
        teardown(&mut guard, &self.shared.handles);
        self.shared.set_state(InstanceState::Stopped);
    }
}

#[async_trait]
impl ImageOperatorInstance for WasmOperatorInstance {
    fn name(&self) -> &str {
        "wasm"
    }

    fn state(&self) -> InstanceState {
        self.shared.state()
    }

    fn extra_params(&self) -> Vec<ParamDesc> {
        instance_params()
    }

    /// Compiles and links the guest, then drives its `init` export.
    /// Subscriptions are typically registered from `init`.
    async fn prepare(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        let program = self.images.read_content(&self.layer).await?;
        debug!(
            digest = %self.layer.digest,
            size = program.len(),
            "loading wasm program"
        );

        if let Err(err) = self.load(&program) {
            self.teardown();
            return Err(err);
        }
        if let Err(err) = self.call_export("init", true, None).await {
            self.teardown();
            return Err(err);
        }
        self.shared.set_state(InstanceState::Prepared);
        Ok(())
    }

    async fn start(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        if self.shared.state() != InstanceState::Prepared {
            return Err(Error::OperatorLifecycle {
                name: "wasm".to_string(),
                phase: "start".to_string(),
                reason: format!("instance is {}", self.shared.state()),
            });
        }
        if let Err(err) = self.call_export("start", true, None).await {
            self.teardown();
            return Err(err);
        }
        self.shared.set_state(InstanceState::Started);
        info!(instance = self.shared.id, "wasm instance started");
        Ok(())
    }

    /// Calls the guest `stop` export under [`GUEST_STOP_TIMEOUT`], then
    /// frees the sandbox and invalidates all handles. On timeout the guest
    /// is force-terminated.
    async fn stop(&self, _ctx: &Arc<GadgetContext>) -> Result<()> {
        if self.shared.state() == InstanceState::Stopped {
            return Ok(());
        }
        let result = self
            .call_export("stop", false, Some(GUEST_STOP_TIMEOUT))
            .await;
        self.teardown();
        result
    }
}

/// Force-terminates a guest call that outlives its deadline by bumping the
/// engine epoch.
struct Watchdog {
    done: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(engine: Engine, timeout: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&done);
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if !signal.load(Ordering::SeqCst) {
                engine.increment_epoch();
            }
        });
        Self { done }
    }

    fn disarm(self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

//! Data-source host calls exported to the guest in module `env`.
//!
//! Failure semantics are uniform: a bad handle, bad string reference or bus
//! error logs a warning and returns 0 (or an error code where the signature
//! has one); the guest is never trapped by its own bad arguments. The one
//! exception is a guest that traps inside a nested callback; that failure
//! is terminal and propagated as a trap of the emitting activation.

use crate::datasource::{DataSourceKind, FieldKind};
use crate::error::{Error, Result};
use crate::handles::{HandleObject, HandleOwner};
use crate::operators::wasm::{marshal, reentry, HostState};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Extern, Linker};

fn link_err(err: wasmtime::Error) -> Error {
    Error::GuestLoad(err.to_string())
}

/// Registers `xlog` and the data-source functions.
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "xlog",
            |mut caller: Caller<'_, HostState>, level: u32, msg: u64| {
                let message = match marshal::read_guest_string(&mut caller, msg) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "xlog: reading message");
                        return;
                    }
                };
                // Panic..Trace = 0..6
                match level {
                    0 | 1 | 2 => error!(guest = true, "{}", message),
                    3 => warn!(guest = true, "{}", message),
                    4 => info!(guest = true, "{}", message),
                    5 => debug!(guest = true, "{}", message),
                    _ => trace!(guest = true, "{}", message),
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "newDataSource",
            |mut caller: Caller<'_, HostState>, name: u64| -> u32 {
                let name = match marshal::read_guest_string(&mut caller, name) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(error = %err, "newDataSource: reading name");
                        return 0;
                    }
                };
                let shared = Arc::clone(&caller.data().shared);
                let Some(ctx) = shared.ctx.upgrade() else {
                    warn!("newDataSource: gadget context gone");
                    return 0;
                };
                match ctx.register_data_source(DataSourceKind::EventStream, &name) {
                    Ok(source) => shared
                        .handles
                        .add(HandleObject::DataSource(source), HandleOwner::Instance),
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "newDataSource failed");
                        0
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "getDataSource",
            |mut caller: Caller<'_, HostState>, name: u64| -> u32 {
                let name = match marshal::read_guest_string(&mut caller, name) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(error = %err, "getDataSource: reading name");
                        return 0;
                    }
                };
                let shared = Arc::clone(&caller.data().shared);
                let Some(ctx) = shared.ctx.upgrade() else {
                    warn!("getDataSource: gadget context gone");
                    return 0;
                };
                match ctx.get_data_source(&name) {
                    Some(source) => shared
                        .handles
                        .add(HandleObject::DataSource(source), HandleOwner::Instance),
                    None => {
                        debug!(source = %name, "getDataSource: not found");
                        0
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceSubscribe",
            |mut caller: Caller<'_, HostState>, ds: u32, prio: u32, cb_id: u64| {
                let shared = Arc::clone(&caller.data().shared);
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceSubscribe: unknown data source");
                    return;
                };
                if caller.get_export("dsCallback").and_then(Extern::into_func).is_none() {
                    warn!("dataSourceSubscribe: guest does not export dsCallback");
                    return;
                }

                // weak: the source owns this closure, a strong ref would
                // keep it alive forever
                let subscriber = Arc::clone(&shared);
                let subscribed_source = Arc::downgrade(&source);
                let result = source.subscribe(
                    move |_, data| {
                        let Some(src) = subscribed_source.upgrade() else {
                            return Ok(());
                        };
                        subscriber.invoke_callback(cb_id, &src, data)
                    },
                    prio as i32,
                );
                if let Err(err) = result {
                    warn!(tag = %err.kind(), error = %err, "dataSourceSubscribe failed");
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceGetField",
            |mut caller: Caller<'_, HostState>, ds: u32, name: u64| -> u32 {
                let name = match marshal::read_guest_string(&mut caller, name) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(error = %err, "dataSourceGetField: reading name");
                        return 0;
                    }
                };
                let shared = &caller.data().shared;
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceGetField: unknown data source");
                    return 0;
                };
                match source.get_field(&name) {
                    Ok(accessor) => shared
                        .handles
                        .add(HandleObject::Field(accessor), HandleOwner::Instance),
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "dataSourceGetField failed");
                        0
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceAddField",
            |mut caller: Caller<'_, HostState>, ds: u32, name: u64, kind: u32| -> u32 {
                let name = match marshal::read_guest_string(&mut caller, name) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(error = %err, "dataSourceAddField: reading name");
                        return 0;
                    }
                };
                let shared = &caller.data().shared;
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceAddField: unknown data source");
                    return 0;
                };
                match source.add_field(&name, FieldKind::from_u32(kind)) {
                    Ok(accessor) => shared
                        .handles
                        .add(HandleObject::Field(accessor), HandleOwner::Instance),
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "dataSourceAddField failed");
                        0
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceNewData",
            |caller: Caller<'_, HostState>, ds: u32| -> u32 {
                let shared = &caller.data().shared;
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceNewData: unknown data source");
                    return 0;
                };
                shared
                    .handles
                    .add(HandleObject::Data(source.new_data()), HandleOwner::Instance)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceEmitAndRelease",
            |mut caller: Caller<'_, HostState>, ds: u32, data: u32| -> wasmtime::Result<u32> {
                let shared = Arc::clone(&caller.data().shared);
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceEmitAndRelease: unknown data source");
                    return Ok(1);
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "dataSourceEmitAndRelease: unknown record");
                    return Ok(1);
                };
                // the record handle dies with the emission, success or not
                shared.handles.remove(data);

                let result = {
                    let mut invoker = reentry_invoker::CallerInvoker::new(&mut caller);
                    let _frame = reentry::push_frame(shared.id, &mut invoker);
                    source.emit_and_release(record)
                };

                if shared.take_failure() {
                    // a nested callback trapped; terminate the emitting
                    // activation as well
                    return Err(wasmtime::Error::msg("guest trapped in nested callback"));
                }
                match result {
                    Ok(()) => Ok(0),
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "dataSourceEmitAndRelease failed");
                        Ok(1)
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "dataSourceRelease",
            |caller: Caller<'_, HostState>, ds: u32, data: u32| {
                let shared = &caller.data().shared;
                let Some(source) = shared.handles.get_data_source(ds) else {
                    warn!(handle = ds, "dataSourceRelease: unknown data source");
                    return;
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "dataSourceRelease: unknown record");
                    return;
                };
                shared.handles.remove(data);
                source.release(record);
            },
        )
        .map_err(link_err)?;

    Ok(())
}

/// The [`reentry::GuestInvoker`] backed by an in-flight host call.
mod reentry_invoker {
    use super::*;

    pub(crate) struct CallerInvoker<'a, 'b> {
        caller: &'a mut Caller<'b, HostState>,
    }

    impl<'a, 'b> CallerInvoker<'a, 'b> {
        pub(crate) fn new(caller: &'a mut Caller<'b, HostState>) -> Self {
            Self { caller }
        }
    }

    impl reentry::GuestInvoker for CallerInvoker<'_, '_> {
        fn ds_callback(&mut self, cb_id: u64, ds: u32, data: u32) -> Result<()> {
            let func = self
                .caller
                .get_export("dsCallback")
                .and_then(Extern::into_func)
                .ok_or_else(|| Error::GuestTrap("dsCallback not exported".to_string()))?;
            let typed = func
                .typed::<(u64, u32, u32), ()>(&mut *self.caller)
                .map_err(|e| Error::GuestTrap(format!("dsCallback signature: {}", e)))?;
            typed
                .call(&mut *self.caller, (cb_id, ds, data))
                .map_err(crate::operators::wasm::map_guest_err)
        }
    }
}

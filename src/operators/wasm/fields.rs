//! Field-accessor host calls exported to the guest in module `env`.

use crate::datasource::FieldKind;
use crate::error::{Error, Result};
use crate::operators::wasm::{marshal, HostState};
use tracing::warn;
use wasmtime::{Caller, Linker};

fn link_err(err: wasmtime::Error) -> Error {
    Error::GuestLoad(err.to_string())
}

/// Registers the field-accessor functions.
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "fieldAccessorGet",
            |caller: Caller<'_, HostState>, field: u32, data: u32, kind: u32| -> u64 {
                let shared = &caller.data().shared;
                let Some(accessor) = shared.handles.get_field(field) else {
                    warn!(handle = field, "fieldAccessorGet: unknown field");
                    return 0;
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "fieldAccessorGet: unknown record");
                    return 0;
                };
                accessor.get_bits(&record, FieldKind::from_u32(kind))
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "fieldAccessorSet",
            |caller: Caller<'_, HostState>, field: u32, data: u32, kind: u32, value: u64| {
                let shared = &caller.data().shared;
                let Some(accessor) = shared.handles.get_field(field) else {
                    warn!(handle = field, "fieldAccessorSet: unknown field");
                    return;
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "fieldAccessorSet: unknown record");
                    return;
                };
                accessor.set_bits(&record, FieldKind::from_u32(kind), value);
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "fieldAccessorGetString",
            |mut caller: Caller<'_, HostState>, field: u32, data: u32| -> u64 {
                let shared = std::sync::Arc::clone(&caller.data().shared);
                let Some(accessor) = shared.handles.get_field(field) else {
                    warn!(handle = field, "fieldAccessorGetString: unknown field");
                    return 0;
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "fieldAccessorGetString: unknown record");
                    return 0;
                };
                let value = accessor.string(&record);
                match marshal::write_guest_bytes(&mut caller, value.as_bytes()) {
                    Ok(str_ref) => str_ref,
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "fieldAccessorGetString failed");
                        0
                    }
                }
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            "env",
            "fieldAccessorSetString",
            |mut caller: Caller<'_, HostState>, field: u32, data: u32, value: u64| {
                let shared = std::sync::Arc::clone(&caller.data().shared);
                let Some(accessor) = shared.handles.get_field(field) else {
                    warn!(handle = field, "fieldAccessorSetString: unknown field");
                    return;
                };
                let Some(record) = shared.handles.get_data(data) else {
                    warn!(handle = data, "fieldAccessorSetString: unknown record");
                    return;
                };
                let value = match marshal::read_guest_string(&mut caller, value) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(tag = %err.kind(), error = %err, "fieldAccessorSetString: reading string");
                        return;
                    }
                };
                if let Err(err) = accessor.set_string(&record, &value) {
                    warn!(tag = %err.kind(), error = %err, "fieldAccessorSetString failed");
                }
            },
        )
        .map_err(link_err)?;

    Ok(())
}

//! String and memory marshalling across the host/guest boundary.
//!
//! A *string reference* is a 64-bit value encoding `(length << 32) | pointer`
//! into the guest's linear memory. Host→guest strings are written into
//! memory obtained from the guest's exported `malloc`; the guest owns and
//! frees those buffers. All pointer arithmetic against guest memory lives in
//! this module.

use crate::error::{Error, Result};
use crate::operators::wasm::HostState;
use wasmtime::{Caller, Extern, Memory};

/// Upper bound for a single marshalled string (1 MiB).
const MAX_STRING_LEN: u32 = 1024 * 1024;

/// Splits a string reference into `(pointer, length)`.
pub(crate) fn split_str_ref(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

/// Builds a string reference from `(pointer, length)`.
pub(crate) fn encode_str_ref(ptr: u32, len: u32) -> u64 {
    ((len as u64) << 32) | ptr as u64
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| Error::BadString("guest exports no linear memory".to_string()))
}

/// Copies a guest string into host memory. The guest retains ownership of
/// its buffer.
pub(crate) fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    str_ref: u64,
) -> Result<String> {
    let (ptr, len) = split_str_ref(str_ref);
    if len == 0 {
        return Ok(String::new());
    }
    if len > MAX_STRING_LEN {
        return Err(Error::BadString(format!(
            "string length {} exceeds {} bytes",
            len, MAX_STRING_LEN
        )));
    }
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let bytes = data
        .get(ptr as usize..(ptr as usize) + (len as usize))
        .ok_or_else(|| {
            Error::BadString(format!(
                "string at {:#x}+{} outside guest memory",
                ptr, len
            ))
        })?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::BadString(format!("string at {:#x} is not UTF-8", ptr)))
}

/// Writes `bytes` into guest memory allocated through the guest's `malloc`
/// export and returns the string reference. The guest owns the buffer.
pub(crate) fn write_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
) -> Result<u64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() as u64 > MAX_STRING_LEN as u64 {
        return Err(Error::BadString(format!(
            "string length {} exceeds {} bytes",
            bytes.len(),
            MAX_STRING_LEN
        )));
    }

    let malloc = caller
        .get_export("malloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| Error::BadString("guest exports no malloc".to_string()))?;
    let malloc = malloc
        .typed::<u32, u32>(&mut *caller)
        .map_err(|e| Error::BadString(format!("guest malloc has wrong signature: {}", e)))?;

    let ptr = malloc
        .call(&mut *caller, bytes.len() as u32)
        .map_err(|e| Error::BadString(format!("guest malloc failed: {}", e)))?;
    if ptr == 0 {
        return Err(Error::BadString("guest malloc returned null".to_string()));
    }

    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, ptr as usize, bytes)
        .map_err(|_| {
            Error::BadString(format!(
                "allocation at {:#x}+{} outside guest memory",
                ptr,
                bytes.len()
            ))
        })?;

    Ok(encode_str_ref(ptr, bytes.len() as u32))
}

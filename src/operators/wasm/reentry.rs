//! Re-entrant guest dispatch.
//!
//! When a guest callback calls `dataSourceEmitAndRelease`, the same
//! instance's other subscribers must run synchronously, but the guest store
//! is already exclusively borrowed by the call chain above us. The only
//! legal path back into the guest is the [`wasmtime::Caller`] of the
//! in-flight host call, so the emit host call pushes an erased invoker frame
//! onto a per-thread stack, and the instance's subscriber closures use the
//! innermost frame for their instance instead of locking the guest runtime.
//!
//! Frames are strictly stack-scoped: the guard pops on drop, and a frame's
//! pointer is only dereferenced while no nested frame for the same instance
//! exists (the nested emit pushes its own). This module contains the crate's
//! only `unsafe` code.

use crate::error::Result;
use std::cell::RefCell;

/// A way back into a specific guest while its store is borrowed up-stack.
pub(crate) trait GuestInvoker {
    fn ds_callback(&mut self, cb_id: u64, ds: u32, data: u32) -> Result<()>;
}

struct Frame {
    instance: u64,
    invoker: *mut dyn GuestInvoker,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frame on drop.
pub(crate) struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Pushes a dispatch frame for `instance` for the lifetime of the returned
/// guard.
pub(crate) fn push_frame(instance: u64, invoker: &mut (dyn GuestInvoker + '_)) -> FrameGuard {
    // SAFETY: the pointer is only stored for the lifetime of the guard,
    // which the caller holds on its stack below `invoker`; `with_active`
    // dereferences it only on this thread, while the guard is alive.
    let erased = unsafe {
        std::mem::transmute::<*mut (dyn GuestInvoker + '_), *mut (dyn GuestInvoker + 'static)>(
            invoker as *mut _,
        )
    };
    FRAMES.with(|frames| {
        frames.borrow_mut().push(Frame {
            instance,
            invoker: erased,
        });
    });
    FrameGuard { _private: () }
}

/// Runs `f` with the innermost frame for `instance`, if one is active on
/// this thread.
pub(crate) fn with_active<R>(
    instance: u64,
    f: impl FnOnce(&mut dyn GuestInvoker) -> R,
) -> Option<R> {
    let ptr = FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.instance == instance)
            .map(|frame| frame.invoker)
    })?;
    // SAFETY: the frame is alive (its guard sits on this thread's stack) and
    // nothing else dereferences it while `f` runs: any nested dispatch for
    // the same instance goes through a newer frame pushed by the nested host
    // call, which `find` from the top would return instead.
    Some(f(unsafe { &mut *ptr }))
}

//! The handle table bridging host objects into the wasm sandbox.
//!
//! Guests refer to host objects (data sources, field accessors, records,
//! callbacks) through non-zero `u32` handles. Zero is reserved as
//! "invalid / not found". Every handle has a declared owner: handles scoped
//! to a single guest callback are freed when the callback returns, the rest
//! live until the instance stops and the table is cleared.

use crate::datasource::{Data, DataSource, FieldAccessor};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A host object reachable from the guest.
#[derive(Clone)]
pub enum HandleObject {
    DataSource(Arc<DataSource>),
    Field(FieldAccessor),
    Data(Data),
}

impl std::fmt::Debug for HandleObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataSource(ds) => f.debug_tuple("DataSource").field(&ds.name()).finish(),
            Self::Field(acc) => f.debug_tuple("Field").field(&acc.name()).finish(),
            Self::Data(_) => f.write_str("Data"),
        }
    }
}

/// Lifetime scope of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOwner {
    /// Lives until the instance stops.
    Instance,
    /// Valid only for the duration of one guest callback invocation.
    Callback,
}

struct Entry {
    object: HandleObject,
    owner: HandleOwner,
}

struct Slots {
    entries: HashMap<u32, Entry>,
    next: u32,
}

/// `u32 → object` map shared between host calls and callback dispatch.
///
/// Allocation is monotonically increasing with wrap-around, skipping 0 and
/// live entries. When all slots are live, allocation fails with handle 0.
pub struct HandleTable {
    slots: RwLock<Slots>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: HashMap::new(),
                next: 0,
            }),
        }
    }

    /// Registers `object` and returns its handle, or 0 on exhaustion.
    pub fn add(&self, object: HandleObject, owner: HandleOwner) -> u32 {
        let mut slots = self.slots.write().expect("handle lock poisoned");
        if slots.entries.len() == u32::MAX as usize {
            warn!("handle table exhausted");
            return 0;
        }
        let id = loop {
            slots.next = slots.next.wrapping_add(1);
            if slots.next == 0 {
                // 0 is reserved
                continue;
            }
            if !slots.entries.contains_key(&slots.next) {
                break slots.next;
            }
        };
        slots.entries.insert(id, Entry { object, owner });
        id
    }

    /// Looks up a handle. Returns `None` (and the caller logs) for 0, stale
    /// or foreign ids.
    pub fn get(&self, id: u32) -> Option<HandleObject> {
        if id == 0 {
            return None;
        }
        let slots = self.slots.read().expect("handle lock poisoned");
        slots.entries.get(&id).map(|e| e.object.clone())
    }

    pub fn get_data_source(&self, id: u32) -> Option<Arc<DataSource>> {
        match self.get(id) {
            Some(HandleObject::DataSource(ds)) => Some(ds),
            _ => None,
        }
    }

    pub fn get_field(&self, id: u32) -> Option<FieldAccessor> {
        match self.get(id) {
            Some(HandleObject::Field(acc)) => Some(acc),
            _ => None,
        }
    }

    pub fn get_data(&self, id: u32) -> Option<Data> {
        match self.get(id) {
            Some(HandleObject::Data(data)) => Some(data),
            _ => None,
        }
    }

    /// Frees one handle.
    pub fn remove(&self, id: u32) {
        let mut slots = self.slots.write().expect("handle lock poisoned");
        slots.entries.remove(&id);
    }

    /// Frees all callback-scoped handles. Invoked when a guest callback
    /// returns.
    pub fn release_callback_handles(&self, ids: &[u32]) {
        let mut slots = self.slots.write().expect("handle lock poisoned");
        for id in ids {
            match slots.entries.get(id) {
                Some(entry) if entry.owner == HandleOwner::Callback => {
                    slots.entries.remove(id);
                }
                Some(_) => warn!(handle = id, "refusing to free instance-owned handle"),
                None => {}
            }
        }
    }

    /// Drops every entry. Invoked on instance stop; all outstanding handles
    /// become invalid.
    pub fn clear(&self) {
        let mut slots = self.slots.write().expect("handle lock poisoned");
        slots.entries.clear();
    }

    pub fn live_count(&self) -> usize {
        self.slots.read().expect("handle lock poisoned").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DataSourceKind, FieldKind};
    use tokio_util::sync::CancellationToken;

    fn sample_source() -> Arc<DataSource> {
        crate::datasource::DataSource::new(
            DataSourceKind::EventStream,
            "t",
            CancellationToken::new(),
        )
    }

    #[test]
    fn handles_start_nonzero_and_resolve() {
        let table = HandleTable::new();
        let ds = sample_source();
        let id = table.add(HandleObject::DataSource(Arc::clone(&ds)), HandleOwner::Instance);
        assert_ne!(id, 0);
        assert!(Arc::ptr_eq(&table.get_data_source(id).unwrap(), &ds));
    }

    #[test]
    fn zero_and_stale_handles_miss() {
        let table = HandleTable::new();
        assert!(table.get(0).is_none());

        let ds = sample_source();
        let id = table.add(HandleObject::DataSource(ds), HandleOwner::Instance);
        table.remove(id);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn typed_lookup_rejects_wrong_variant() {
        let table = HandleTable::new();
        let ds = sample_source();
        let acc = ds.add_field("pid", FieldKind::Uint32).unwrap();
        let id = table.add(HandleObject::Field(acc), HandleOwner::Instance);
        assert!(table.get_field(id).is_some());
        assert!(table.get_data_source(id).is_none());
        assert!(table.get_data(id).is_none());
    }

    #[test]
    fn allocation_skips_live_entries_on_wrap() {
        let table = HandleTable::new();
        let ds = sample_source();
        let kept = table.add(HandleObject::DataSource(Arc::clone(&ds)), HandleOwner::Instance);

        // force the counter to sit just before the live handle
        {
            let mut slots = table.slots.write().unwrap();
            slots.next = kept.wrapping_sub(1);
        }
        let next = table.add(HandleObject::DataSource(ds), HandleOwner::Instance);
        assert_ne!(next, kept);
        assert_ne!(next, 0);
    }

    #[test]
    fn callback_scope_is_enforced() {
        let table = HandleTable::new();
        let ds = sample_source();
        let scoped = table.add(
            HandleObject::DataSource(Arc::clone(&ds)),
            HandleOwner::Callback,
        );
        let durable = table.add(HandleObject::DataSource(ds), HandleOwner::Instance);

        table.release_callback_handles(&[scoped, durable]);
        assert!(table.get(scoped).is_none());
        assert!(table.get(durable).is_some(), "instance handles survive");
    }

    #[test]
    fn clear_empties_the_table() {
        let table = HandleTable::new();
        let ds = sample_source();
        table.add(HandleObject::DataSource(Arc::clone(&ds)), HandleOwner::Instance);
        table.add(HandleObject::DataSource(ds), HandleOwner::Callback);
        assert_eq!(table.live_count(), 2);
        table.clear();
        assert_eq!(table.live_count(), 0);
    }
}

//! Record storage.
//!
//! A [`Data`] is one event instance flowing through a data source: a fixed
//! byte buffer sized to the source's layout plus out-of-line slots for
//! variable-length strings. Records are shared handles that cross the
//! sandbox boundary through the handle table, so the buffers sit behind
//! short-lived internal locks. The data source serializes the subscriber
//! chain, so these locks are uncontended in practice.

use std::sync::{Arc, Mutex};

/// One record of a data source.
///
/// Cheap to clone; all clones refer to the same storage. Values are stored
/// little-endian.
#[derive(Debug, Clone)]
pub struct Data {
    inner: Arc<DataInner>,
}

#[derive(Debug)]
struct DataInner {
    fixed: Mutex<Vec<u8>>,
    strings: Mutex<Vec<String>>,
}

impl Data {
    /// Allocates a zero-initialized record.
    pub(crate) fn alloc(fixed_len: usize, string_slots: usize) -> Self {
        Self {
            inner: Arc::new(DataInner {
                fixed: Mutex::new(vec![0u8; fixed_len]),
                strings: Mutex::new(vec![String::new(); string_slots]),
            }),
        }
    }

    /// Zeroes the record and resizes it to the current layout, for pool reuse.
    pub(crate) fn reset(&self, fixed_len: usize, string_slots: usize) {
        let mut fixed = self.inner.fixed.lock().expect("record lock poisoned");
        fixed.clear();
        fixed.resize(fixed_len, 0);
        let mut strings = self.inner.strings.lock().expect("record lock poisoned");
        strings.clear();
        strings.resize(string_slots, String::new());
    }

    /// True if this handle is the only reference to the storage.
    pub(crate) fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Identity comparison: two handles to the same record.
    pub fn ptr_eq(&self, other: &Data) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Size of the fixed storage in bytes.
    pub fn len(&self) -> usize {
        self.inner.fixed.lock().expect("record lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to 8 bytes at `offset`. Returns `None` when out of bounds.
    pub(crate) fn read_fixed(&self, offset: usize, len: usize) -> Option<[u8; 8]> {
        debug_assert!(len <= 8);
        let fixed = self.inner.fixed.lock().expect("record lock poisoned");
        let slice = fixed.get(offset..offset.checked_add(len)?)?;
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(slice);
        Some(buf)
    }

    /// Reads an arbitrary span at `offset`. Returns `None` when out of bounds.
    pub(crate) fn read_fixed_vec(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let fixed = self.inner.fixed.lock().expect("record lock poisoned");
        fixed.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Writes `bytes` at `offset`. Returns false when out of bounds.
    pub(crate) fn write_fixed(&self, offset: usize, bytes: &[u8]) -> bool {
        let mut fixed = self.inner.fixed.lock().expect("record lock poisoned");
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        match fixed.get_mut(offset..end) {
            Some(slice) => {
                slice.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Reads an out-of-line string slot.
    pub(crate) fn string_slot(&self, slot: usize) -> Option<String> {
        let strings = self.inner.strings.lock().expect("record lock poisoned");
        strings.get(slot).cloned()
    }

    /// Writes an out-of-line string slot. Returns false when out of bounds.
    pub(crate) fn set_string_slot(&self, slot: usize, value: String) -> bool {
        let mut strings = self.inner.strings.lock().expect("record lock poisoned");
        match strings.get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed() {
        let data = Data::alloc(16, 2);
        assert_eq!(data.len(), 16);
        assert_eq!(data.read_fixed_vec(0, 16).unwrap(), vec![0u8; 16]);
        assert_eq!(data.string_slot(1).unwrap(), "");
    }

    #[test]
    fn bounds_are_checked() {
        let data = Data::alloc(4, 1);
        assert!(data.read_fixed(2, 4).is_none());
        assert!(!data.write_fixed(3, &[1, 2]));
        assert!(data.string_slot(1).is_none());
        assert!(!data.set_string_slot(5, "x".into()));
    }

    #[test]
    fn reset_clears_and_resizes() {
        let data = Data::alloc(4, 1);
        data.write_fixed(0, &[1, 2, 3, 4]);
        data.set_string_slot(0, "keep?".into());

        data.reset(8, 2);
        assert_eq!(data.len(), 8);
        assert_eq!(data.read_fixed_vec(0, 8).unwrap(), vec![0u8; 8]);
        assert_eq!(data.string_slot(0).unwrap(), "");
        assert_eq!(data.string_slot(1).unwrap(), "");
    }

    #[test]
    fn uniqueness_tracks_clones() {
        let data = Data::alloc(4, 0);
        assert!(data.is_unique());
        let clone = data.clone();
        assert!(!data.is_unique());
        drop(clone);
        assert!(data.is_unique());
    }
}

//! Typed fields and accessors over record storage.
//!
//! A [`Field`] is a named, typed slot in a data source's schema. A
//! [`FieldAccessor`] is the small value object handed to operators to read
//! and mutate that slot on any record of the source. Kind mismatches are
//! rejected at the accessor boundary: getters return a sentinel zero and log
//! a warning, setters are a logged no-op. Storage is never corrupted.

use crate::datasource::data::Data;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::warn;

/// Slot marker for fields without out-of-line string storage.
pub(crate) const NO_SLOT: u32 = u32::MAX;

/// Kind of a field value.
///
/// Discriminants are wire-stable: they cross the wasm ABI as `u32` and must
/// not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FieldKind {
    Invalid = 0,
    /// Reserved. Get/Set on a Bool field reports an unsupported kind.
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Uint8 = 6,
    Uint16 = 7,
    Uint32 = 8,
    Uint64 = 9,
    Float32 = 10,
    Float64 = 11,
    String = 12,
    CString = 13,
}

impl FieldKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Bool,
            2 => Self::Int8,
            3 => Self::Int16,
            4 => Self::Int32,
            5 => Self::Int64,
            6 => Self::Uint8,
            7 => Self::Uint16,
            8 => Self::Uint32,
            9 => Self::Uint64,
            10 => Self::Float32,
            11 => Self::Float64,
            12 => Self::String,
            13 => Self::CString,
            _ => Self::Invalid,
        }
    }

    /// Fixed storage size in bytes. Zero means variable-length.
    pub fn size(self) -> usize {
        match self {
            Self::Invalid | Self::String | Self::CString => 0,
            Self::Bool | Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    /// True for the two textual kinds.
    pub fn is_string(self) -> bool {
        matches!(self, Self::String | Self::CString)
    }
}

/// A named, typed slot within a data source's schema.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    pub kind: FieldKind,
    /// Byte offset into the record's fixed storage.
    pub offset: u32,
    /// Static size in bytes; 0 means variable-length (out-of-line).
    pub size: u32,
    /// Index of the out-of-line string slot, or [`NO_SLOT`].
    pub(crate) string_slot: u32,
}

impl Field {
    pub fn accessor(&self) -> FieldAccessor {
        FieldAccessor {
            name: Arc::clone(&self.name),
            kind: self.kind,
            offset: self.offset,
            size: self.size,
            slot: self.string_slot,
        }
    }
}

/// Tagged value crossing the accessor boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Int8(_) => FieldKind::Int8,
            Self::Int16(_) => FieldKind::Int16,
            Self::Int32(_) => FieldKind::Int32,
            Self::Int64(_) => FieldKind::Int64,
            Self::Uint8(_) => FieldKind::Uint8,
            Self::Uint16(_) => FieldKind::Uint16,
            Self::Uint32(_) => FieldKind::Uint32,
            Self::Uint64(_) => FieldKind::Uint64,
            Self::Float32(_) => FieldKind::Float32,
            Self::Float64(_) => FieldKind::Float64,
            Self::String(_) => FieldKind::String,
        }
    }
}

/// Typed access into a specific offset of a record.
///
/// Cheap to clone and safe to hold across records: an accessor is bound to a
/// schema slot, not to any particular record.
#[derive(Debug, Clone)]
pub struct FieldAccessor {
    name: Arc<str>,
    kind: FieldKind,
    offset: u32,
    size: u32,
    slot: u32,
}

impl FieldAccessor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Static size of the field; 0 means variable-length.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    // =========================================================================
    // Raw bit access (wasm ABI surface)
    // =========================================================================

    /// Reads the field as raw bits for `requested`. Returns 0 and logs a
    /// warning on kind mismatch, unsupported kind, or out-of-bounds access.
    pub fn get_bits(&self, data: &Data, requested: FieldKind) -> u64 {
        if requested == FieldKind::Bool || self.kind == FieldKind::Bool {
            warn!(field = %self.name, "bool fields are reserved");
            return 0;
        }
        if requested != self.kind {
            warn!(
                field = %self.name,
                actual = ?self.kind,
                requested = ?requested,
                "field kind mismatch on read"
            );
            return 0;
        }
        let width = self.kind.size();
        if width == 0 {
            warn!(field = %self.name, "string field read through scalar accessor");
            return 0;
        }
        match data.read_fixed(self.offset as usize, width) {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf[..width].copy_from_slice(&bytes[..width]);
                // sign-extend signed kinds so the bits round-trip as i64
                let raw = u64::from_le_bytes(buf);
                match self.kind {
                    FieldKind::Int8 => raw as u8 as i8 as i64 as u64,
                    FieldKind::Int16 => raw as u16 as i16 as i64 as u64,
                    FieldKind::Int32 => raw as u32 as i32 as i64 as u64,
                    _ => raw,
                }
            }
            None => {
                warn!(field = %self.name, offset = self.offset, "field read out of bounds");
                0
            }
        }
    }

    /// Writes raw bits for `requested`. Logs and leaves the record unchanged
    /// on kind mismatch or unsupported kind.
    pub fn set_bits(&self, data: &Data, requested: FieldKind, bits: u64) {
        if requested == FieldKind::Bool || self.kind == FieldKind::Bool {
            warn!(field = %self.name, "bool fields are reserved");
            return;
        }
        if requested != self.kind {
            warn!(
                field = %self.name,
                actual = ?self.kind,
                requested = ?requested,
                "field kind mismatch on write"
            );
            return;
        }
        let width = self.kind.size();
        if width == 0 {
            warn!(field = %self.name, "string field written through scalar accessor");
            return;
        }
        let bytes = bits.to_le_bytes();
        if !data.write_fixed(self.offset as usize, &bytes[..width]) {
            warn!(field = %self.name, offset = self.offset, "field write out of bounds");
        }
    }

    // =========================================================================
    // Typed access
    // =========================================================================

    pub fn int8(&self, data: &Data) -> i8 {
        self.get_bits(data, FieldKind::Int8) as i8
    }

    pub fn set_int8(&self, data: &Data, value: i8) {
        self.set_bits(data, FieldKind::Int8, value as u8 as u64);
    }

    pub fn int16(&self, data: &Data) -> i16 {
        self.get_bits(data, FieldKind::Int16) as i16
    }

    pub fn set_int16(&self, data: &Data, value: i16) {
        self.set_bits(data, FieldKind::Int16, value as u16 as u64);
    }

    pub fn int32(&self, data: &Data) -> i32 {
        self.get_bits(data, FieldKind::Int32) as i32
    }

    pub fn set_int32(&self, data: &Data, value: i32) {
        self.set_bits(data, FieldKind::Int32, value as u32 as u64);
    }

    pub fn int64(&self, data: &Data) -> i64 {
        self.get_bits(data, FieldKind::Int64) as i64
    }

    pub fn set_int64(&self, data: &Data, value: i64) {
        self.set_bits(data, FieldKind::Int64, value as u64);
    }

    pub fn uint8(&self, data: &Data) -> u8 {
        self.get_bits(data, FieldKind::Uint8) as u8
    }

    pub fn set_uint8(&self, data: &Data, value: u8) {
        self.set_bits(data, FieldKind::Uint8, value as u64);
    }

    pub fn uint16(&self, data: &Data) -> u16 {
        self.get_bits(data, FieldKind::Uint16) as u16
    }

    pub fn set_uint16(&self, data: &Data, value: u16) {
        self.set_bits(data, FieldKind::Uint16, value as u64);
    }

    pub fn uint32(&self, data: &Data) -> u32 {
        self.get_bits(data, FieldKind::Uint32) as u32
    }

    pub fn set_uint32(&self, data: &Data, value: u32) {
        self.set_bits(data, FieldKind::Uint32, value as u64);
    }

    pub fn uint64(&self, data: &Data) -> u64 {
        self.get_bits(data, FieldKind::Uint64)
    }

    pub fn set_uint64(&self, data: &Data, value: u64) {
        self.set_bits(data, FieldKind::Uint64, value);
    }

    pub fn float32(&self, data: &Data) -> f32 {
        f32::from_bits(self.get_bits(data, FieldKind::Float32) as u32)
    }

    pub fn set_float32(&self, data: &Data, value: f32) {
        self.set_bits(data, FieldKind::Float32, value.to_bits() as u64);
    }

    pub fn float64(&self, data: &Data) -> f64 {
        f64::from_bits(self.get_bits(data, FieldKind::Float64))
    }

    pub fn set_float64(&self, data: &Data, value: f64) {
        self.set_bits(data, FieldKind::Float64, value.to_bits());
    }

    // =========================================================================
    // String access
    // =========================================================================

    /// Reads the field as a string.
    ///
    /// Static `String` fields trim trailing NUL padding; `CString` fields cut
    /// at the first NUL. Non-string fields warn and return an empty string.
    pub fn string(&self, data: &Data) -> String {
        if !self.kind.is_string() {
            warn!(field = %self.name, kind = ?self.kind, "scalar field read as string");
            return String::new();
        }
        if self.size > 0 {
            let Some(raw) = data.read_fixed_vec(self.offset as usize, self.size as usize) else {
                warn!(field = %self.name, "string read out of bounds");
                return String::new();
            };
            let end = match self.kind {
                FieldKind::CString => raw.iter().position(|&b| b == 0).unwrap_or(raw.len()),
                _ => raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1),
            };
            return String::from_utf8_lossy(&raw[..end]).into_owned();
        }
        data.string_slot(self.slot as usize).unwrap_or_default()
    }

    /// Writes the field as a string.
    ///
    /// On a field with a static size, the value is padded with NULs; a value
    /// longer than the static size is an error and the field is unchanged.
    pub fn set_string(&self, data: &Data, value: &str) -> Result<()> {
        if !self.kind.is_string() {
            return Err(Error::KindMismatch {
                field: self.name.to_string(),
                actual: self.kind,
                requested: FieldKind::String,
            });
        }
        if self.size > 0 {
            let bytes = value.as_bytes();
            if bytes.len() > self.size as usize {
                return Err(Error::StringTooLong {
                    len: bytes.len(),
                    max: self.size as usize,
                });
            }
            let mut buf = vec![0u8; self.size as usize];
            buf[..bytes.len()].copy_from_slice(bytes);
            if !data.write_fixed(self.offset as usize, &buf) {
                warn!(field = %self.name, "string write out of bounds");
            }
            return Ok(());
        }
        if !data.set_string_slot(self.slot as usize, value.to_string()) {
            warn!(field = %self.name, slot = self.slot, "string slot out of bounds");
        }
        Ok(())
    }

    // =========================================================================
    // Tagged access
    // =========================================================================

    /// Reads the field as a tagged value, rejecting reserved kinds.
    pub fn value(&self, data: &Data) -> Result<FieldValue> {
        Ok(match self.kind {
            FieldKind::Int8 => FieldValue::Int8(self.int8(data)),
            FieldKind::Int16 => FieldValue::Int16(self.int16(data)),
            FieldKind::Int32 => FieldValue::Int32(self.int32(data)),
            FieldKind::Int64 => FieldValue::Int64(self.int64(data)),
            FieldKind::Uint8 => FieldValue::Uint8(self.uint8(data)),
            FieldKind::Uint16 => FieldValue::Uint16(self.uint16(data)),
            FieldKind::Uint32 => FieldValue::Uint32(self.uint32(data)),
            FieldKind::Uint64 => FieldValue::Uint64(self.uint64(data)),
            FieldKind::Float32 => FieldValue::Float32(self.float32(data)),
            FieldKind::Float64 => FieldValue::Float64(self.float64(data)),
            FieldKind::String | FieldKind::CString => FieldValue::String(self.string(data)),
            FieldKind::Bool | FieldKind::Invalid => {
                return Err(Error::UnsupportedKind(self.kind));
            }
        })
    }

    /// Writes a tagged value, rejecting kind mismatches.
    pub fn set_value(&self, data: &Data, value: FieldValue) -> Result<()> {
        if let FieldValue::String(s) = &value {
            if self.kind.is_string() {
                return self.set_string(data, s);
            }
        }
        if value.kind() != self.kind {
            return Err(Error::KindMismatch {
                field: self.name.to_string(),
                actual: self.kind,
                requested: value.kind(),
            });
        }
        match value {
            FieldValue::Int8(v) => self.set_int8(data, v),
            FieldValue::Int16(v) => self.set_int16(data, v),
            FieldValue::Int32(v) => self.set_int32(data, v),
            FieldValue::Int64(v) => self.set_int64(data, v),
            FieldValue::Uint8(v) => self.set_uint8(data, v),
            FieldValue::Uint16(v) => self.set_uint16(data, v),
            FieldValue::Uint32(v) => self.set_uint32(data, v),
            FieldValue::Uint64(v) => self.set_uint64(data, v),
            FieldValue::Float32(v) => self.set_float32(data, v),
            FieldValue::Float64(v) => self.set_float64(data, v),
            FieldValue::String(_) => unreachable!("handled above"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessor(kind: FieldKind, offset: u32, size: u32, slot: u32) -> FieldAccessor {
        Field {
            name: Arc::from("f"),
            kind,
            offset,
            size,
            string_slot: slot,
        }
        .accessor()
    }

    #[test]
    fn scalar_round_trips() {
        let data = Data::alloc(32, 0);

        let acc = accessor(FieldKind::Uint32, 0, 4, NO_SLOT);
        acc.set_uint32(&data, 0xdead_beef);
        assert_eq!(acc.uint32(&data), 0xdead_beef);

        let acc = accessor(FieldKind::Int16, 4, 2, NO_SLOT);
        acc.set_int16(&data, -1234);
        assert_eq!(acc.int16(&data), -1234);

        let acc = accessor(FieldKind::Float64, 8, 8, NO_SLOT);
        acc.set_float64(&data, 2.5);
        assert_eq!(acc.float64(&data), 2.5);

        let acc = accessor(FieldKind::Int64, 16, 8, NO_SLOT);
        acc.set_int64(&data, i64::MIN);
        assert_eq!(acc.int64(&data), i64::MIN);
    }

    #[test]
    fn signed_reads_sign_extend() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::Int8, 0, 1, NO_SLOT);
        acc.set_int8(&data, -1);
        assert_eq!(acc.get_bits(&data, FieldKind::Int8), u64::MAX);
    }

    #[test]
    fn kind_mismatch_returns_sentinel() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::Uint32, 0, 4, NO_SLOT);
        acc.set_uint32(&data, 7);

        assert_eq!(acc.get_bits(&data, FieldKind::Uint64), 0);
        acc.set_bits(&data, FieldKind::Uint64, 99);
        assert_eq!(acc.uint32(&data), 7, "mismatched write must not land");
    }

    #[test]
    fn bool_kind_is_reserved() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::Bool, 0, 1, NO_SLOT);
        assert_eq!(acc.get_bits(&data, FieldKind::Bool), 0);
        assert!(matches!(
            acc.value(&data),
            Err(Error::UnsupportedKind(FieldKind::Bool))
        ));
    }

    #[test]
    fn dynamic_string_round_trips() {
        let data = Data::alloc(4, 1);
        let acc = accessor(FieldKind::String, 0, 0, 0);
        acc.set_string(&data, "inspektor-gadget.io").unwrap();
        assert_eq!(acc.string(&data), "inspektor-gadget.io");
    }

    #[test]
    fn static_string_pads_and_rejects_overflow() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::CString, 0, 8, NO_SLOT);

        acc.set_string(&data, "abc").unwrap();
        assert_eq!(acc.string(&data), "abc");

        let err = acc.set_string(&data, "way too long").unwrap_err();
        assert!(matches!(err, Error::StringTooLong { .. }));
        assert_eq!(acc.string(&data), "abc", "field unchanged after overflow");
    }

    #[test]
    fn cstring_stops_at_nul() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::CString, 0, 8, NO_SLOT);
        data.write_fixed(0, b"ab\0cd\0\0\0");
        assert_eq!(acc.string(&data), "ab");
    }

    #[test]
    fn tagged_value_rejects_mismatch() {
        let data = Data::alloc(8, 0);
        let acc = accessor(FieldKind::Uint32, 0, 4, NO_SLOT);
        let err = acc.set_value(&data, FieldValue::Uint64(1)).unwrap_err();
        assert!(matches!(err, Error::KindMismatch { .. }));

        acc.set_value(&data, FieldValue::Uint32(42)).unwrap();
        assert_eq!(acc.value(&data).unwrap(), FieldValue::Uint32(42));
    }
}

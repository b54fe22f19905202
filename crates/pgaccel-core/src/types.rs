//! The closed host type catalog and the flat value carriers exchanged with
//! child processes: scalar datums, variable-length ("varlena") buffers and
//! the array layout used by set-returning procedures.

use std::sync::Arc;

use pgaccel_common::platform::{align_up, MAXIMUM_ALIGNOF};

use crate::error::CoreError;

/// Host types a procedure argument or result may carry.
///
/// `GStore` is the out-of-band handle to device-resident data; it is stored
/// as a 4-byte table identifier on the host side but always resolved through
/// an IPC handle, never passed by value to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Bytea,
    Text,
    Uuid,
    GStore,
}

impl HostType {
    /// Fixed byte width, or -1 for variable-length types.
    pub const fn len(self) -> i16 {
        match self {
            HostType::Bool => 1,
            HostType::Int2 => 2,
            HostType::Int4 => 4,
            HostType::Int8 => 8,
            HostType::Float4 => 4,
            HostType::Float8 => 8,
            HostType::Bytea => -1,
            HostType::Text => -1,
            HostType::Uuid => 16,
            HostType::GStore => 4,
        }
    }

    pub const fn byval(self) -> bool {
        matches!(
            self,
            HostType::Bool
                | HostType::Int2
                | HostType::Int4
                | HostType::Int8
                | HostType::Float4
                | HostType::Float8
                | HostType::GStore
        )
    }

    /// Alignment requirement of the stored form.
    pub const fn align(self) -> usize {
        match self {
            HostType::Bool | HostType::Uuid => 1,
            HostType::Int2 => 2,
            HostType::Int4 | HostType::Float4 => 4,
            HostType::Int8 | HostType::Float8 => 8,
            HostType::Bytea | HostType::Text => 4,
            HostType::GStore => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            HostType::Bool => "bool",
            HostType::Int2 => "int2",
            HostType::Int4 => "int4",
            HostType::Int8 => "int8",
            HostType::Float4 => "float4",
            HostType::Float8 => "float8",
            HostType::Bytea => "bytea",
            HostType::Text => "text",
            HostType::Uuid => "uuid",
            HostType::GStore => "reggstore",
        }
    }

    /// Stable wire code for the type, used by the array carrier header.
    pub const fn code(self) -> u32 {
        match self {
            HostType::Bool => 16,
            HostType::Bytea => 17,
            HostType::Int8 => 20,
            HostType::Int2 => 21,
            HostType::Int4 => 23,
            HostType::Text => 25,
            HostType::Float4 => 700,
            HostType::Float8 => 701,
            HostType::Uuid => 2950,
            HostType::GStore => 6050,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            16 => HostType::Bool,
            17 => HostType::Bytea,
            20 => HostType::Int8,
            21 => HostType::Int2,
            23 => HostType::Int4,
            25 => HostType::Text,
            700 => HostType::Float4,
            701 => HostType::Float8,
            2950 => HostType::Uuid,
            6050 => HostType::GStore,
            _ => return None,
        })
    }
}

/// A host value. By-reference payloads are arena-backed so their lifetime is
/// controlled by whichever arena materialized them.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Flat variable-length carrier, header included.
    Varlena(Arc<[u8]>),
    /// Fixed-length by-reference payload (e.g. uuid).
    Fixed(Arc<[u8]>),
    /// Identifier of a gstore foreign table; resolved via IPC handle.
    GStore(u32),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Pass-by-value datum representation, widened to a machine word.
    pub fn as_datum_word(&self) -> Option<u64> {
        Some(match *self {
            Value::Bool(v) => v as u64,
            Value::Int2(v) => v as u16 as u64,
            Value::Int4(v) => v as u32 as u64,
            Value::Int8(v) => v as u64,
            Value::Float4(v) => v.to_bits() as u64,
            Value::Float8(v) => v.to_bits(),
            Value::GStore(v) => v as u64,
            _ => return None,
        })
    }

    /// By-reference stored form, if any.
    pub fn as_ref_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Varlena(b) | Value::Fixed(b) => Some(b),
            _ => None,
        }
    }

    /// Decode a by-value datum from its little-endian stored form.
    pub fn from_datum_bytes(ty: HostType, bytes: &[u8]) -> Result<Value, CoreError> {
        let need = ty.len();
        if need < 0 || bytes.len() < need as usize {
            return Err(CoreError::Corrupt(format!(
                "short datum for type {}: {} bytes",
                ty.name(),
                bytes.len()
            )));
        }
        let mut word = [0u8; 8];
        word[..need as usize].copy_from_slice(&bytes[..need as usize]);
        Ok(match ty {
            HostType::Bool => Value::Bool(word[0] != 0),
            HostType::Int2 => Value::Int2(i16::from_le_bytes([word[0], word[1]])),
            HostType::Int4 => Value::Int4(i32::from_le_bytes(word[..4].try_into().expect("4 bytes"))),
            HostType::Int8 => Value::Int8(i64::from_le_bytes(word)),
            HostType::Float4 => {
                Value::Float4(f32::from_bits(u32::from_le_bytes(word[..4].try_into().expect("4 bytes"))))
            }
            HostType::Float8 => Value::Float8(f64::from_bits(u64::from_le_bytes(word))),
            HostType::GStore => Value::GStore(u32::from_le_bytes(word[..4].try_into().expect("4 bytes"))),
            _ => {
                return Err(CoreError::Corrupt(format!(
                    "type {} is not pass-by-value",
                    ty.name()
                )))
            }
        })
    }
}

/// Flat variable-length carrier: 4-byte little-endian total size (header
/// included) followed by the payload. Always fully de-toasted.
pub mod varlena {
    use super::CoreError;

    pub const VARHDRSZ: usize = 4;

    pub fn make(payload: &[u8]) -> Vec<u8> {
        let total = (payload.len() + VARHDRSZ) as u32;
        let mut buf = Vec::with_capacity(total as usize);
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Total size (header included) recorded in the carrier header.
    pub fn total_size(buf: &[u8]) -> Result<usize, CoreError> {
        if buf.len() < VARHDRSZ {
            return Err(CoreError::Corrupt("varlena shorter than its header".into()));
        }
        let total = u32::from_le_bytes(buf[..4].try_into().expect("4 bytes")) as usize;
        if total < VARHDRSZ {
            return Err(CoreError::Corrupt(format!("invalid varlena size {total}")));
        }
        Ok(total)
    }

    pub fn payload(buf: &[u8]) -> Result<&[u8], CoreError> {
        let total = total_size(buf)?;
        if buf.len() < total {
            return Err(CoreError::Corrupt(format!(
                "varlena truncated: header says {total}, have {}",
                buf.len()
            )));
        }
        Ok(&buf[VARHDRSZ..total])
    }
}

/// Array carrier used by set-returning procedure results.
///
/// Layout, little-endian:
///   u32 total size (varlena header)
///   i32 ndim
///   i32 dataoffset (0 when there is no null bitmap)
///   u32 element type code
///   i32 dims[ndim]
///   i32 lbounds[ndim]
///   null bitmap, one bit per item, when dataoffset != 0
///   padding to MAXIMUM_ALIGNOF, then element data
pub mod array {
    use super::*;
    use crate::types::varlena::VARHDRSZ;

    pub struct ArrayReader<'a> {
        buf: &'a [u8],
        pub ndim: usize,
        pub dims: Vec<i32>,
        pub lbounds: Vec<i32>,
        pub elem_type: HostType,
        bitmap_off: Option<usize>,
        data_off: usize,
    }

    impl<'a> ArrayReader<'a> {
        pub fn parse(buf: &'a [u8]) -> Result<ArrayReader<'a>, CoreError> {
            let total = varlena::total_size(buf)?;
            if buf.len() < total || total < VARHDRSZ + 12 {
                return Err(CoreError::Corrupt("array carrier truncated".into()));
            }
            let ndim = read_i32(buf, VARHDRSZ)?;
            let dataoffset = read_i32(buf, VARHDRSZ + 4)?;
            let elem_code = read_i32(buf, VARHDRSZ + 8)? as u32;
            if !(1..=6).contains(&ndim) {
                return Err(CoreError::Corrupt(format!("invalid array ndim {ndim}")));
            }
            let ndim = ndim as usize;
            let elem_type = HostType::from_code(elem_code)
                .ok_or_else(|| CoreError::Corrupt(format!("unknown element type code {elem_code}")))?;

            let mut dims = Vec::with_capacity(ndim);
            let mut lbounds = Vec::with_capacity(ndim);
            let mut off = VARHDRSZ + 12;
            for _ in 0..ndim {
                dims.push(read_i32(buf, off)?);
                off += 4;
            }
            for _ in 0..ndim {
                lbounds.push(read_i32(buf, off)?);
                off += 4;
            }

            let nitems: i64 = dims.iter().map(|&d| d as i64).product();
            if nitems < 0 {
                return Err(CoreError::Corrupt("negative array dimension".into()));
            }

            let (bitmap_off, data_off) = if dataoffset == 0 {
                (None, align_up(off, MAXIMUM_ALIGNOF))
            } else {
                let bitmap_len = (nitems as usize).div_ceil(8);
                if off + bitmap_len > total {
                    return Err(CoreError::Corrupt("array null bitmap truncated".into()));
                }
                (Some(off), dataoffset as usize)
            };
            if data_off > total {
                return Err(CoreError::Corrupt("array data offset out of range".into()));
            }

            Ok(ArrayReader {
                buf: &buf[..total],
                ndim,
                dims,
                lbounds,
                elem_type,
                bitmap_off,
                data_off,
            })
        }

        pub fn nitems(&self) -> usize {
            self.dims.iter().map(|&d| d as usize).product()
        }

        pub fn is_null(&self, index: usize) -> bool {
            match self.bitmap_off {
                // Bit set means the element is present.
                Some(off) => {
                    let byte = self.buf[off + index / 8];
                    byte & (1 << (index % 8)) == 0
                }
                None => false,
            }
        }

        /// Walk every element in order, yielding `Value::Null` for bitmap
        /// holes. Elements advance by fixed width or varlena size, aligned to
        /// the element type's requirement.
        pub fn values(&self) -> Result<Vec<Value>, CoreError> {
            let nitems = self.nitems();
            let mut out = Vec::with_capacity(nitems);
            let mut pos = self.data_off;
            let elemlen = self.elem_type.len();
            for index in 0..nitems {
                if self.is_null(index) {
                    out.push(Value::Null);
                    continue;
                }
                pos = align_up(pos, self.elem_type.align());
                if pos >= self.buf.len() {
                    return Err(CoreError::Corrupt("array element out of range".into()));
                }
                if elemlen > 0 {
                    let end = pos + elemlen as usize;
                    if end > self.buf.len() {
                        return Err(CoreError::Corrupt("array element out of range".into()));
                    }
                    let raw = &self.buf[pos..end];
                    let value = if self.elem_type.byval() {
                        Value::from_datum_bytes(self.elem_type, raw)?
                    } else {
                        Value::Fixed(Arc::from(raw))
                    };
                    out.push(value);
                    pos = end;
                } else {
                    let total = varlena::total_size(&self.buf[pos..])?;
                    if pos + total > self.buf.len() {
                        return Err(CoreError::Corrupt("array element out of range".into()));
                    }
                    out.push(Value::Varlena(Arc::from(&self.buf[pos..pos + total])));
                    pos += total;
                }
            }
            Ok(out)
        }
    }

    fn read_i32(buf: &[u8], off: usize) -> Result<i32, CoreError> {
        buf.get(off..off + 4)
            .map(|b| i32::from_le_bytes(b.try_into().expect("4 bytes")))
            .ok_or_else(|| CoreError::Corrupt("array header truncated".into()))
    }

    /// Build a flat array carrier. Used by tests and by child-side fixtures;
    /// `dims` is `[nitems]` or `[nattrs, nitems]` with zero lower bounds.
    pub fn build(elem_type: HostType, dims: &[i32], values: &[Value]) -> Result<Vec<u8>, CoreError> {
        let nitems: usize = dims.iter().map(|&d| d as usize).product();
        if nitems != values.len() {
            return Err(CoreError::Corrupt(format!(
                "array shape {:?} does not hold {} values",
                dims,
                values.len()
            )));
        }
        let has_nulls = values.iter().any(Value::is_null);
        let ndim = dims.len();

        let mut header_len = VARHDRSZ + 12 + 8 * ndim;
        if has_nulls {
            header_len += nitems.div_ceil(8);
        }
        let data_off = align_up(header_len, MAXIMUM_ALIGNOF);

        let mut data = Vec::new();
        for value in values {
            if value.is_null() {
                continue;
            }
            let pos = align_up(data_off + data.len(), elem_type.align()) - data_off;
            data.resize(pos, 0);
            match value {
                Value::Varlena(b) | Value::Fixed(b) => data.extend_from_slice(b),
                v => {
                    let word = v
                        .as_datum_word()
                        .ok_or_else(|| CoreError::Corrupt("array element type mismatch".into()))?;
                    data.extend_from_slice(&word.to_le_bytes()[..elem_type.len() as usize]);
                }
            }
        }

        let total = data_off + data.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&(ndim as i32).to_le_bytes());
        buf.extend_from_slice(&(if has_nulls { data_off as i32 } else { 0 }).to_le_bytes());
        buf.extend_from_slice(&elem_type.code().to_le_bytes());
        for &d in dims {
            buf.extend_from_slice(&d.to_le_bytes());
        }
        for _ in 0..ndim {
            buf.extend_from_slice(&0i32.to_le_bytes());
        }
        if has_nulls {
            let mut bitmap = vec![0u8; nitems.div_ceil(8)];
            for (index, value) in values.iter().enumerate() {
                if !value.is_null() {
                    bitmap[index / 8] |= 1 << (index % 8);
                }
            }
            buf.extend_from_slice(&bitmap);
        }
        buf.resize(data_off, 0);
        buf.extend_from_slice(&data);
        Ok(buf)
    }
}

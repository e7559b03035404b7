//! Element types of multi-dimensional arrays.

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Identifier of the type of the elements in an array.
///
/// Discriminants are stable and stored as-is in shared memory.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElType {
    /// Signed 8-bit integer.
    I8 = 1,
    /// Unsigned 8-bit integer.
    U8 = 2,
    /// Signed 16-bit integer.
    I16 = 3,
    /// Unsigned 16-bit integer.
    U16 = 4,
    /// Signed 32-bit integer.
    I32 = 5,
    /// Unsigned 32-bit integer.
    U32 = 6,
    /// Signed 64-bit integer.
    I64 = 7,
    /// Unsigned 64-bit integer.
    U64 = 8,
    /// Single precision floating-point.
    F32 = 9,
    /// Double precision floating-point.
    F64 = 10,
}

impl ElType {
    /// All element types, in discriminant order.
    pub const ALL: [ElType; 10] = [
        ElType::I8,
        ElType::U8,
        ElType::I16,
        ElType::U16,
        ElType::I32,
        ElType::U32,
        ElType::I64,
        ElType::U64,
        ElType::F32,
        ElType::F64,
    ];

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElType::I8 | ElType::U8 => 1,
            ElType::I16 | ElType::U16 => 2,
            ElType::I32 | ElType::U32 | ElType::F32 => 4,
            ElType::I64 | ElType::U64 | ElType::F64 => 8,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ElType::I8 => "int8",
            ElType::U8 => "uint8",
            ElType::I16 => "int16",
            ElType::U16 => "uint16",
            ElType::I32 => "int32",
            ElType::U32 => "uint32",
            ElType::I64 => "int64",
            ElType::U64 => "uint64",
            ElType::F32 => "float",
            ElType::F64 => "double",
        }
    }

    /// Whether the type is a floating-point type.
    pub fn is_floating_point(self) -> bool {
        matches!(self, ElType::F32 | ElType::F64)
    }

    /// Decode a raw tag as read from shared memory.
    pub fn from_raw(raw: i32) -> Result<ElType> {
        Ok(match raw {
            1 => ElType::I8,
            2 => ElType::U8,
            3 => ElType::I16,
            4 => ElType::U16,
            5 => ElType::I32,
            6 => ElType::U32,
            7 => ElType::I64,
            8 => ElType::U64,
            9 => ElType::F32,
            10 => ElType::F64,
            _ => return Err(Error::new("eltype_from_raw", ErrorKind::BadType)),
        })
    }
}

impl std::fmt::Display for ElType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Native scalar types usable as array elements.
///
/// Conversions between element types go through `f64` for floating-point
/// sources and plain `as` casts otherwise, so exactly representable values
/// round-trip unchanged.
pub trait Scalar: Copy + Default + PartialEq + Send + Sync + 'static {
    /// The matching [`ElType`] tag.
    const ELTYPE: ElType;
    /// Lossless-as-possible widening to `f64`.
    fn to_f64(self) -> f64;
    /// Narrowing conversion from `f64` with `as` semantics.
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => $tag:expr),* $(,)?) => {
        $(impl Scalar for $ty {
            const ELTYPE: ElType = $tag;
            fn to_f64(self) -> f64 { self as f64 }
            fn from_f64(v: f64) -> Self { v as $ty }
        })*
    };
}

impl_scalar! {
    i8 => ElType::I8,
    u8 => ElType::U8,
    i16 => ElType::I16,
    u16 => ElType::U16,
    i32 => ElType::I32,
    u32 => ElType::U32,
    i64 => ElType::I64,
    u64 => ElType::U64,
    f32 => ElType::F32,
    f64 => ElType::F64,
}

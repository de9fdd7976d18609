//! Data types and typed values of object-dictionary entries.

use crate::{Error, Result};
use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;

/// Data type codes of the device-protocol standard type table, as they
/// appear in the `DataType` key of an EDS descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum DataType {
    Bool = 0x0001,
    I8 = 0x0002,
    I16 = 0x0003,
    I32 = 0x0004,
    U8 = 0x0005,
    U16 = 0x0006,
    U32 = 0x0007,
    F32 = 0x0008,
    VisibleString = 0x0009,
    OctetString = 0x000A,
    F64 = 0x0011,
    I64 = 0x0015,
    U64 = 0x001B,
}

impl DataType {
    pub fn from_code(code: u16) -> Option<DataType> {
        DataType::from_u16(code)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::I8
                | DataType::I16
                | DataType::I32
                | DataType::I64
                | DataType::U8
                | DataType::U16
                | DataType::U32
                | DataType::U64
        )
    }
}

/// A live value of an object-dictionary entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Octets(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::I8(_) => DataType::I8,
            Value::I16(_) => DataType::I16,
            Value::I32(_) => DataType::I32,
            Value::I64(_) => DataType::I64,
            Value::U8(_) => DataType::U8,
            Value::U16(_) => DataType::U16,
            Value::U32(_) => DataType::U32,
            Value::U64(_) => DataType::U64,
            Value::F32(_) => DataType::F32,
            Value::F64(_) => DataType::F64,
            Value::String(_) => DataType::VisibleString,
            Value::Octets(_) => DataType::OctetString,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::Bool(b) => *b as i128,
            Value::I8(v) => *v as i128,
            Value::I16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::U8(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::U64(v) => *v as i128,
            _ => return None,
        })
    }

    /// Stages the value for an expedited SDO transfer.
    ///
    /// Only values that fit four little-endian bytes have a wire form.
    pub fn to_wire(&self) -> Option<u32> {
        match self {
            Value::Bool(b) => Some(*b as u32),
            Value::I8(v) => Some(*v as u8 as u32),
            Value::I16(v) => Some(*v as u16 as u32),
            Value::I32(v) => Some(*v as u32),
            Value::U8(v) => Some(*v as u32),
            Value::U16(v) => Some(*v as u32),
            Value::U32(v) => Some(*v),
            Value::F32(v) => Some(v.to_bits()),
            _ => None,
        }
    }

    /// Decodes an expedited SDO payload into a typed value.
    pub fn from_wire(data_type: DataType, raw: u32) -> Result<Value> {
        Ok(match data_type {
            DataType::Bool => match raw {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(Error::TypeMismatch { expected: data_type }),
            },
            DataType::I8 => Value::I8(raw as u8 as i8),
            DataType::I16 => Value::I16(raw as u16 as i16),
            DataType::I32 => Value::I32(raw as i32),
            DataType::U8 if raw <= u8::max_value() as u32 => Value::U8(raw as u8),
            DataType::U16 if raw <= u16::max_value() as u32 => Value::U16(raw as u16),
            DataType::U32 => Value::U32(raw),
            DataType::F32 => Value::F32(f32::from_bits(raw)),
            _ => return Err(Error::TypeMismatch { expected: data_type }),
        })
    }
}

/// Two's-complement range check for the integer types.
fn integer_range(data_type: DataType) -> Option<(i128, i128)> {
    Some(match data_type {
        DataType::Bool => (0, 1),
        DataType::I8 => (i8::min_value() as i128, i8::max_value() as i128),
        DataType::I16 => (i16::min_value() as i128, i16::max_value() as i128),
        DataType::I32 => (i32::min_value() as i128, i32::max_value() as i128),
        DataType::I64 => (i64::min_value() as i128, i64::max_value() as i128),
        DataType::U8 => (0, u8::max_value() as i128),
        DataType::U16 => (0, u16::max_value() as i128),
        DataType::U32 => (0, u32::max_value() as i128),
        DataType::U64 => (0, u64::max_value() as i128),
        _ => return None,
    })
}

/// Fits `value` into `data_type`, applying the documented conversions:
/// booleans accept 0/1, integer widths enforce their two's-complement
/// range, floats accept any finite or NaN input, strings truncate to the
/// declared length with a warning. Everything else is a type mismatch.
pub fn coerce(data_type: DataType, value: Value, max_len: Option<usize>) -> Result<Value> {
    let mismatch = || Error::TypeMismatch { expected: data_type };
    if let Some((min, max)) = integer_range(data_type) {
        let raw = value.as_i128().ok_or_else(mismatch)?;
        if raw < min || raw > max {
            return Err(mismatch());
        }
        return Ok(match data_type {
            DataType::Bool => Value::Bool(raw == 1),
            DataType::I8 => Value::I8(raw as i8),
            DataType::I16 => Value::I16(raw as i16),
            DataType::I32 => Value::I32(raw as i32),
            DataType::I64 => Value::I64(raw as i64),
            DataType::U8 => Value::U8(raw as u8),
            DataType::U16 => Value::U16(raw as u16),
            DataType::U32 => Value::U32(raw as u32),
            DataType::U64 => Value::U64(raw as u64),
            _ => unreachable!(),
        });
    }
    match (data_type, value) {
        (DataType::F32, Value::F32(v)) => Ok(Value::F32(v)),
        (DataType::F32, Value::F64(v)) => Ok(Value::F32(v as f32)),
        (DataType::F64, Value::F64(v)) => Ok(Value::F64(v)),
        (DataType::F64, Value::F32(v)) => Ok(Value::F64(v as f64)),
        (DataType::VisibleString, Value::String(mut s)) => {
            if let Some(limit) = max_len {
                if s.len() > limit {
                    log::warn!(
                        "Truncating string of {} bytes to declared length {}",
                        s.len(),
                        limit
                    );
                    s.truncate(limit);
                }
            }
            Ok(Value::String(s))
        }
        (DataType::OctetString, Value::Octets(mut o)) => {
            if let Some(limit) = max_len {
                if o.len() > limit {
                    log::warn!(
                        "Truncating octet string of {} bytes to declared length {}",
                        o.len(),
                        limit
                    );
                    o.truncate(limit);
                }
            }
            Ok(Value::Octets(o))
        }
        _ => Err(mismatch()),
    }
}

/// Parses an integer literal the way EDS files write them: decimal or with
/// a `0x`/`0o`/`0b` radix prefix, optionally signed.
pub fn parse_int(raw: &str) -> Option<i128> {
    let raw = raw.trim();
    let (negative, raw) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = raw.strip_prefix("0o").or_else(|| raw.strip_prefix("0O")) {
        i128::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
        i128::from_str_radix(bin, 2).ok()?
    } else {
        raw.parse::<i128>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Parses a `DefaultValue` literal for the given data type.
///
/// The `$NODEID+<offset>` form substitutes the active node id before the
/// offset is added.
pub fn parse_default(data_type: DataType, raw: &str, node_id: u8) -> Result<Value> {
    let raw = raw.trim();
    let bad = || Error::Eds(format!("bad default value {:?} for {:?}", raw, data_type));
    match data_type {
        DataType::Bool => {
            let v = parse_int(raw).ok_or_else(bad)?;
            coerce(data_type, Value::I64(v as i64), None)
        }
        DataType::VisibleString => Ok(Value::String(raw.to_string())),
        DataType::OctetString => Ok(Value::Octets(raw.as_bytes().to_vec())),
        DataType::F32 => Ok(Value::F32(raw.parse::<f32>().map_err(|_| bad())?)),
        DataType::F64 => Ok(Value::F64(raw.parse::<f64>().map_err(|_| bad())?)),
        _ => {
            let v = if raw.to_ascii_uppercase().starts_with("$NODEID") {
                let offset = match raw.splitn(2, '+').nth(1) {
                    Some(off) => parse_int(off).ok_or_else(bad)?,
                    None => 0,
                };
                node_id as i128 + offset
            } else {
                parse_int(raw).ok_or_else(bad)?
            };
            if v < i64::min_value() as i128 || v > u64::max_value() as i128 {
                return Err(bad());
            }
            let staged = if v >= 0 {
                Value::U64(v as u64)
            } else {
                Value::I64(v as i64)
            };
            coerce(data_type, staged, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ranges_are_enforced() {
        assert_eq!(
            coerce(DataType::U8, Value::U16(0xFF), None).unwrap(),
            Value::U8(0xFF)
        );
        assert!(coerce(DataType::U8, Value::U16(0x100), None).is_err());
        assert!(coerce(DataType::I8, Value::I16(-129), None).is_err());
        assert_eq!(
            coerce(DataType::I8, Value::I16(-128), None).unwrap(),
            Value::I8(-128)
        );
        assert!(coerce(DataType::U16, Value::I32(-1), None).is_err());
    }

    #[test]
    fn bool_accepts_zero_and_one_only() {
        assert_eq!(
            coerce(DataType::Bool, Value::U8(0), None).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            coerce(DataType::Bool, Value::U8(1), None).unwrap(),
            Value::Bool(true)
        );
        assert!(coerce(DataType::Bool, Value::U8(2), None).is_err());
    }

    #[test]
    fn floats_accept_nan() {
        let v = coerce(DataType::F32, Value::F32(f32::NAN), None).unwrap();
        match v {
            Value::F32(f) => assert!(f.is_nan()),
            _ => panic!("wrong type"),
        }
    }

    #[test]
    fn strings_truncate_to_declared_length() {
        let v = coerce(
            DataType::VisibleString,
            Value::String("abcdef".into()),
            Some(4),
        )
        .unwrap();
        assert_eq!(v, Value::String("abcd".into()));
    }

    #[test]
    fn node_id_substitution() {
        let v = parse_default(DataType::U32, "$NODEID+0x600", 10).unwrap();
        assert_eq!(v, Value::U32(0x60A));
        let v = parse_default(DataType::U32, "$NODEID", 42).unwrap();
        assert_eq!(v, Value::U32(42));
    }

    #[test]
    fn radix_prefixes() {
        assert_eq!(parse_int("0x2A"), Some(42));
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("junk"), None);
    }

    #[test]
    fn wire_round_trip() {
        for (dt, raw) in &[
            (DataType::U8, 0x92u32),
            (DataType::U16, 0x0192),
            (DataType::U32, 0xDEAD_BEEF),
            (DataType::I16, 0xFFFFu32),
        ] {
            let v = Value::from_wire(*dt, *raw).unwrap();
            assert_eq!(v.to_wire().unwrap(), *raw);
        }
        assert!(Value::from_wire(DataType::U8, 0x100).is_err());
        assert!(Value::from_wire(DataType::U64, 1).is_err());
    }
}

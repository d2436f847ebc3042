//! Codec primitives: pure, total functions over arrays of 16-bit registers.
//!
//! Every decoder takes the raw register slice for one value and returns a
//! typed value or [`CodecError::MalformedFrame`] if the slice is the wrong
//! length. Encoders perform the inverse. Scale/offset/inversion are applied
//! by the Manager, never here (see Design Notes, "Inversion and NC wiring").

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How multi-register values are ordered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    HighLow,
    LowHigh,
}

/// Scalar encoding of a data point's raw register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint32Le,
    Int32Le,
    Float32,
    Float32Le,
    Uint64,
    Bool,
    Enum,
    Bitmask,
}

impl ValueType {
    /// Number of 16-bit registers this type occupies.
    pub fn register_count(self) -> usize {
        match self {
            ValueType::Uint16 | ValueType::Int16 | ValueType::Bool | ValueType::Enum | ValueType::Bitmask => 1,
            ValueType::Uint32 | ValueType::Int32 | ValueType::Uint32Le | ValueType::Int32Le => 2,
            ValueType::Float32 | ValueType::Float32Le => 2,
            ValueType::Uint64 => 4,
        }
    }

    /// Whether this is one of the little-endian register-order variants.
    fn is_little_endian_variant(self) -> bool {
        matches!(self, ValueType::Uint32Le | ValueType::Int32Le | ValueType::Float32Le)
    }
}

/// A decoded scalar value, with enum/bitmask carrying their symbolic form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Enum { raw: i64, label: Option<String> },
    Bitmask(HashMap<String, bool>),
}

impl DecodedValue {
    /// Numeric view used for scale/offset conversion; panics are impossible
    /// because every variant maps to a finite f64.
    pub fn as_f64(&self) -> f64 {
        match self {
            DecodedValue::Unsigned(v) => *v as f64,
            DecodedValue::Signed(v) => *v as f64,
            DecodedValue::Float(v) => *v,
            DecodedValue::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            DecodedValue::Enum { raw, .. } => *raw as f64,
            DecodedValue::Bitmask(_) => 0.0,
        }
    }
}

fn require_len(regs: &[u16], expected: usize) -> Result<(), CodecError> {
    if regs.len() != expected {
        return Err(CodecError::MalformedFrame {
            expected,
            got: regs.len(),
        });
    }
    Ok(())
}

fn pair_to_u32(hi: u16, lo: u16, order: ByteOrder) -> u32 {
    match order {
        ByteOrder::HighLow => ((hi as u32) << 16) | (lo as u32),
        ByteOrder::LowHigh => ((lo as u32) << 16) | (hi as u32),
    }
}

fn u32_to_pair(value: u32, order: ByteOrder) -> (u16, u16) {
    let hi = (value >> 16) as u16;
    let lo = value as u16;
    match order {
        ByteOrder::HighLow => (hi, lo),
        ByteOrder::LowHigh => (lo, hi),
    }
}

/// Decode `regs` as `value_type`, honoring `byte_order` for multi-register
/// and little-endian-variant types (section 4.A).
pub fn decode(regs: &[u16], value_type: ValueType, byte_order: ByteOrder) -> Result<DecodedValue, CodecError> {
    require_len(regs, value_type.register_count())?;

    // `*_le` variants swap the 16-bit register halves relative to whatever
    // `byte_order` would otherwise pick, matching the published type table.
    let effective_order = if value_type.is_little_endian_variant() {
        match byte_order {
            ByteOrder::HighLow => ByteOrder::LowHigh,
            ByteOrder::LowHigh => ByteOrder::HighLow,
        }
    } else {
        byte_order
    };

    Ok(match value_type {
        ValueType::Uint16 => DecodedValue::Unsigned(regs[0] as u64),
        ValueType::Int16 => DecodedValue::Signed(regs[0] as i16 as i64),
        ValueType::Uint32 | ValueType::Uint32Le => {
            DecodedValue::Unsigned(pair_to_u32(regs[0], regs[1], effective_order) as u64)
        }
        ValueType::Int32 | ValueType::Int32Le => {
            DecodedValue::Signed(pair_to_u32(regs[0], regs[1], effective_order) as i32 as i64)
        }
        ValueType::Float32 | ValueType::Float32Le => {
            let bits = pair_to_u32(regs[0], regs[1], effective_order);
            DecodedValue::Float(f32::from_bits(bits) as f64)
        }
        ValueType::Uint64 => {
            let value = ((regs[0] as u64) << 48)
                | ((regs[1] as u64) << 32)
                | ((regs[2] as u64) << 16)
                | (regs[3] as u64);
            DecodedValue::Unsigned(value)
        }
        ValueType::Bool => DecodedValue::Bool(regs[0] != 0),
        ValueType::Enum => DecodedValue::Enum {
            raw: regs[0] as i64,
            label: None,
        },
        ValueType::Bitmask => DecodedValue::Bitmask(HashMap::new()),
    })
}

/// Decode an `enum` register against a `{int -> label}` table, falling back
/// to the raw integer when the value is not in the table.
pub fn decode_enum(regs: &[u16], table: &HashMap<String, String>) -> Result<DecodedValue, CodecError> {
    require_len(regs, 1)?;
    let raw = regs[0] as i64;
    let label = table.get(&raw.to_string()).cloned();
    Ok(DecodedValue::Enum { raw, label })
}

/// Decode a `bitmask` register against a `{bit_index -> name}` table.
pub fn decode_bitmask(regs: &[u16], bits: &HashMap<String, String>) -> Result<DecodedValue, CodecError> {
    require_len(regs, 1)?;
    let raw = regs[0];
    let mut out = HashMap::with_capacity(bits.len());
    for (bit_str, name) in bits {
        let Ok(bit) = bit_str.parse::<u32>() else {
            continue;
        };
        out.insert(name.clone(), (raw >> bit) & 1 == 1);
    }
    Ok(DecodedValue::Bitmask(out))
}

/// Encode `value` as `value_type`, the inverse of [`decode`]. Returns
/// [`CodecError::EncodingFailed`] for non-finite floats.
pub fn encode(value: f64, value_type: ValueType, byte_order: ByteOrder) -> Result<Vec<u16>, CodecError> {
    let effective_order = if value_type.is_little_endian_variant() {
        match byte_order {
            ByteOrder::HighLow => ByteOrder::LowHigh,
            ByteOrder::LowHigh => ByteOrder::HighLow,
        }
    } else {
        byte_order
    };

    Ok(match value_type {
        ValueType::Uint16 | ValueType::Enum | ValueType::Bitmask => vec![value as u16],
        ValueType::Bool => vec![if value != 0.0 { 1 } else { 0 }],
        ValueType::Int16 => vec![(value as i64 as i16) as u16],
        ValueType::Uint32 | ValueType::Uint32Le => {
            let (hi, lo) = u32_to_pair(value as u32, effective_order);
            vec![hi, lo]
        }
        ValueType::Int32 | ValueType::Int32Le => {
            let (hi, lo) = u32_to_pair((value as i64 as i32) as u32, effective_order);
            vec![hi, lo]
        }
        ValueType::Float32 | ValueType::Float32Le => {
            if !value.is_finite() {
                return Err(CodecError::EncodingFailed);
            }
            let bits = (value as f32).to_bits();
            let (hi, lo) = u32_to_pair(bits, effective_order);
            vec![hi, lo]
        }
        ValueType::Uint64 => {
            let v = value as u64;
            vec![
                (v >> 48) as u16,
                (v >> 32) as u16,
                (v >> 16) as u16,
                v as u16,
            ]
        }
    })
}

/// Apply `value = raw * scale_factor + offset`, rounding floats to 3
/// decimals (invariant 4).
pub fn apply_conversion(raw: f64, scale_factor: f64, offset: f64) -> f64 {
    let converted = raw * scale_factor + offset;
    (converted * 1000.0).round() / 1000.0
}

/// `valid = true` iff `value` lies in the closed interval when bounds are
/// configured; unconfigured bounds never invalidate a reading.
pub fn check_valid(value: f64, min_valid: Option<f64>, max_valid: Option<f64>) -> bool {
    if let Some(min) = min_valid {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max_valid {
        if value > max {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint16_roundtrip() {
        let regs = [0x1234];
        let v = decode(&regs, ValueType::Uint16, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Unsigned(0x1234));
        let back = encode(0x1234 as f64, ValueType::Uint16, ByteOrder::HighLow).unwrap();
        assert_eq!(back, regs);
    }

    #[test]
    fn int16_negative() {
        let regs = [0xFFFF];
        let v = decode(&regs, ValueType::Int16, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Signed(-1));
    }

    #[test]
    fn uint32_high_low() {
        let regs = [0x0001, 0x0002];
        let v = decode(&regs, ValueType::Uint32, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Unsigned(0x0001_0002));
    }

    #[test]
    fn uint32_low_high() {
        let regs = [0x0002, 0x0001];
        let v = decode(&regs, ValueType::Uint32, ByteOrder::LowHigh).unwrap();
        assert_eq!(v, DecodedValue::Unsigned(0x0001_0002));
    }

    #[test]
    fn float32_big_endian() {
        // 1.0f32 = 0x3F800000
        let regs = [0x3F80, 0x0000];
        let v = decode(&regs, ValueType::Float32, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Float(1.0));
    }

    #[test]
    fn float32_le_variant_swaps_halves() {
        // float32_le at byte_order=high_low should read as if low_high.
        let regs = [0x0000, 0x3F80];
        let v = decode(&regs, ValueType::Float32Le, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Float(1.0));
    }

    #[test]
    fn float32_encoding_rejects_non_finite() {
        let err = encode(f64::NAN, ValueType::Float32, ByteOrder::HighLow).unwrap_err();
        assert_eq!(err, CodecError::EncodingFailed);
        let err = encode(f64::INFINITY, ValueType::Float32, ByteOrder::HighLow).unwrap_err();
        assert_eq!(err, CodecError::EncodingFailed);
    }

    #[test]
    fn uint64_msb_first() {
        let regs = [0x0001, 0x0002, 0x0003, 0x0004];
        let v = decode(&regs, ValueType::Uint64, ByteOrder::HighLow).unwrap();
        assert_eq!(v, DecodedValue::Unsigned(0x0001_0002_0003_0004));
    }

    #[test]
    fn bool_decode() {
        assert_eq!(
            decode(&[0], ValueType::Bool, ByteOrder::HighLow).unwrap(),
            DecodedValue::Bool(false)
        );
        assert_eq!(
            decode(&[7], ValueType::Bool, ByteOrder::HighLow).unwrap(),
            DecodedValue::Bool(true)
        );
    }

    #[test]
    fn malformed_frame_on_wrong_length() {
        let err = decode(&[1, 2, 3], ValueType::Uint16, ByteOrder::HighLow).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedFrame {
                expected: 1,
                got: 3
            }
        );
    }

    #[test]
    fn enum_lookup_with_fallback() {
        let mut table = HashMap::new();
        table.insert("1".to_string(), "running".to_string());
        let v = decode_enum(&[1], &table).unwrap();
        assert_eq!(
            v,
            DecodedValue::Enum {
                raw: 1,
                label: Some("running".to_string())
            }
        );
        let v = decode_enum(&[99], &table).unwrap();
        assert_eq!(
            v,
            DecodedValue::Enum {
                raw: 99,
                label: None
            }
        );
    }

    #[test]
    fn bitmask_named_bits() {
        let mut bits = HashMap::new();
        bits.insert("0".to_string(), "open".to_string());
        bits.insert("1".to_string(), "closed".to_string());
        let v = decode_bitmask(&[0b01], &bits).unwrap();
        match v {
            DecodedValue::Bitmask(m) => {
                assert_eq!(m.get("open"), Some(&true));
                assert_eq!(m.get("closed"), Some(&false));
            }
            _ => panic!("expected bitmask"),
        }
    }

    #[test]
    fn conversion_rounds_to_three_decimals() {
        let v = apply_conversion(10.0, 0.1234567, 0.0);
        assert_eq!(v, 1.235);
    }

    #[test]
    fn validity_bounds() {
        assert!(check_valid(5.0, Some(0.0), Some(10.0)));
        assert!(!check_valid(-1.0, Some(0.0), Some(10.0)));
        assert!(!check_valid(11.0, Some(0.0), Some(10.0)));
        assert!(check_valid(11.0, None, None));
    }
}

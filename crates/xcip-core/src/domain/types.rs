//! CIP elementary data types and typed attribute values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CIP elementary data type of an attribute or assembly field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Ulint,
    Real,
    Lreal,
    String,
}

impl DataType {
    pub const ALL: [DataType; 12] = [
        DataType::Bool,
        DataType::Sint,
        DataType::Int,
        DataType::Dint,
        DataType::Lint,
        DataType::Usint,
        DataType::Uint,
        DataType::Udint,
        DataType::Ulint,
        DataType::Real,
        DataType::Lreal,
        DataType::String,
    ];

    /// Parse a manifest type literal (case-insensitive).
    pub fn parse(literal: &str) -> Option<Self> {
        let lowered = literal.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == lowered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Sint => "sint",
            DataType::Int => "int",
            DataType::Dint => "dint",
            DataType::Lint => "lint",
            DataType::Usint => "usint",
            DataType::Uint => "uint",
            DataType::Udint => "udint",
            DataType::Ulint => "ulint",
            DataType::Real => "real",
            DataType::Lreal => "lreal",
            DataType::String => "string",
        }
    }

    /// Size in bytes of one element of this type.
    ///
    /// `Bool` is a single byte when carried as an attribute; inside an
    /// assembly it occupies one bit (see [`DataType::is_bit`]).
    /// `String` is one byte per character.
    pub fn byte_size(&self) -> u32 {
        match self {
            DataType::Bool | DataType::Sint | DataType::Usint | DataType::String => 1,
            DataType::Int | DataType::Uint => 2,
            DataType::Dint | DataType::Udint | DataType::Real => 4,
            DataType::Lint | DataType::Ulint | DataType::Lreal => 8,
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, DataType::Bool)
    }

    /// The value written when an attribute declares no default.
    pub fn zero_value(&self) -> AttrValue {
        match self {
            DataType::Bool => AttrValue::Bool(false),
            DataType::Sint => AttrValue::Sint(0),
            DataType::Int => AttrValue::Int(0),
            DataType::Dint => AttrValue::Dint(0),
            DataType::Lint => AttrValue::Lint(0),
            DataType::Usint => AttrValue::Usint(0),
            DataType::Uint => AttrValue::Uint(0),
            DataType::Udint => AttrValue::Udint(0),
            DataType::Ulint => AttrValue::Ulint(0),
            DataType::Real => AttrValue::Real(0.0),
            DataType::Lreal => AttrValue::Lreal(0.0),
            DataType::String => AttrValue::String(String::new()),
        }
    }

    /// Type-check a literal against this type.
    ///
    /// Integer literals accept decimal or `0x` hexadecimal. The error string
    /// describes why the literal does not fit.
    pub fn parse_value(&self, literal: &str) -> Result<AttrValue, String> {
        let literal = literal.trim();
        match self {
            DataType::Bool => parse_bool(literal)
                .map(AttrValue::Bool)
                .ok_or_else(|| "expected true, false, 1 or 0".to_string()),
            DataType::Sint => int_in_range(literal, i8::try_from).map(AttrValue::Sint),
            DataType::Int => int_in_range(literal, i16::try_from).map(AttrValue::Int),
            DataType::Dint => int_in_range(literal, i32::try_from).map(AttrValue::Dint),
            DataType::Lint => int_in_range(literal, i64::try_from).map(AttrValue::Lint),
            DataType::Usint => int_in_range(literal, u8::try_from).map(AttrValue::Usint),
            DataType::Uint => int_in_range(literal, u16::try_from).map(AttrValue::Uint),
            DataType::Udint => int_in_range(literal, u32::try_from).map(AttrValue::Udint),
            DataType::Ulint => int_in_range(literal, u64::try_from).map(AttrValue::Ulint),
            DataType::Real => literal
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .map(AttrValue::Real)
                .ok_or_else(|| "expected a finite 32-bit float".to_string()),
            DataType::Lreal => literal
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(AttrValue::Lreal)
                .ok_or_else(|| "expected a finite 64-bit float".to_string()),
            DataType::String => {
                if !literal.is_ascii() {
                    Err("string values must be ASCII".to_string())
                } else if literal.len() > u8::MAX as usize {
                    Err(format!("string longer than {} characters", u8::MAX))
                } else {
                    Ok(AttrValue::String(literal.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttrValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    Real(f32),
    Lreal(f64),
    String(String),
}

impl AttrValue {
    pub fn data_type(&self) -> DataType {
        match self {
            AttrValue::Bool(_) => DataType::Bool,
            AttrValue::Sint(_) => DataType::Sint,
            AttrValue::Int(_) => DataType::Int,
            AttrValue::Dint(_) => DataType::Dint,
            AttrValue::Lint(_) => DataType::Lint,
            AttrValue::Usint(_) => DataType::Usint,
            AttrValue::Uint(_) => DataType::Uint,
            AttrValue::Udint(_) => DataType::Udint,
            AttrValue::Ulint(_) => DataType::Ulint,
            AttrValue::Real(_) => DataType::Real,
            AttrValue::Lreal(_) => DataType::Lreal,
            AttrValue::String(_) => DataType::String,
        }
    }

    /// Little-endian CIP encoding. Strings use the SHORT_STRING layout
    /// (one length byte followed by the characters).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AttrValue::Bool(v) => vec![u8::from(*v)],
            AttrValue::Sint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Int(v) => v.to_le_bytes().to_vec(),
            AttrValue::Dint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Lint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Usint(v) => vec![*v],
            AttrValue::Uint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Udint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Ulint(v) => v.to_le_bytes().to_vec(),
            AttrValue::Real(v) => v.to_le_bytes().to_vec(),
            AttrValue::Lreal(v) => v.to_le_bytes().to_vec(),
            AttrValue::String(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.push(s.len().min(u8::MAX as usize) as u8);
                out.extend(s.bytes().take(u8::MAX as usize));
                out
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Sint(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Dint(v) => write!(f, "{v}"),
            AttrValue::Lint(v) => write!(f, "{v}"),
            AttrValue::Usint(v) => write!(f, "{v}"),
            AttrValue::Uint(v) => write!(f, "{v}"),
            AttrValue::Udint(v) => write!(f, "{v}"),
            AttrValue::Ulint(v) => write!(f, "{v}"),
            AttrValue::Real(v) => write!(f, "{v}"),
            AttrValue::Lreal(v) => write!(f, "{v}"),
            AttrValue::String(v) => write!(f, "\"{v}\""),
        }
    }
}

/// Parse an integer literal, decimal or `0x`-prefixed hexadecimal, with an
/// optional leading minus sign.
pub fn parse_int_literal(literal: &str) -> Option<i128> {
    let literal = literal.trim();
    let (negative, digits) = match literal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, literal),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) if !hex.is_empty() => i128::from_str_radix(hex, 16).ok()?,
        Some(_) => return None,
        None if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse::<i128>().ok()?
        }
        None => return None,
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Parse a manifest boolean literal.
pub fn parse_bool(literal: &str) -> Option<bool> {
    match literal.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn int_in_range<T, E>(literal: &str, convert: impl Fn(i128) -> Result<T, E>) -> Result<T, String>
where
    T: Copy,
{
    let value =
        parse_int_literal(literal).ok_or_else(|| format!("'{literal}' is not an integer"))?;
    convert(value).map_err(|_| format!("{value} is out of range"))
}

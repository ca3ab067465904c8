//! I/O assembly layout.
//!
//! Lays an assembly's declared fields out over its full byte size. Bytes
//! that carry bool fields are filled with `spare_bit_<byte>_<bit>` entries
//! for unused bits; gaps between typed fields become `spare_byte_<byte>`
//! string entries spanning the gap. The resulting layout covers every byte
//! of the assembly exactly once.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::{Assembly, AssemblyDirection, AttrValue, BuilderError, DataType};

/// Bytes added to the assembly size in the Forward Open connection size.
pub const CONNECTION_OVERHEAD_BYTES: u32 = 6;
/// Fixed-size, point-to-point base for the O→T connection parameters.
pub const OT_PARAMETER_BASE: u16 = 0x4800;
/// Fixed-size, multicast base for the T→O connection parameters.
pub const TO_PARAMETER_BASE: u16 = 0x2800;
const CONNECTION_SIZE_MASK: u16 = 0x01FF;

/// One placed entry of a layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutEntry {
    pub id: String,
    pub data_type: DataType,
    pub offset_bits: u32,
    pub length: u32,
    /// Filler inserted by the layout, not declared in the manifest.
    pub spare: bool,
}

impl LayoutEntry {
    pub fn bit_len(&self) -> u64 {
        let length = u64::from(self.length);
        if self.data_type.is_bit() {
            length
        } else {
            length * u64::from(self.data_type.byte_size()) * 8
        }
    }
}

/// Complete layout of one assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyLayout {
    pub assembly: String,
    pub direction: AssemblyDirection,
    pub size_bytes: u32,
    pub entries: Vec<LayoutEntry>,
}

impl AssemblyLayout {
    pub fn entry(&self, id: &str) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Declared (non-spare) entries.
    pub fn fields(&self) -> impl Iterator<Item = &LayoutEntry> {
        self.entries.iter().filter(|e| !e.spare)
    }
}

/// Forward Open connection parameters derived from assembly sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionParams {
    pub ot: u16,
    pub to: u16,
}

impl ConnectionParams {
    pub fn from_sizes(ot_bytes: u32, to_bytes: u32) -> Self {
        Self {
            ot: OT_PARAMETER_BASE | connection_size(ot_bytes),
            to: TO_PARAMETER_BASE | connection_size(to_bytes),
        }
    }
}

fn connection_size(bytes: u32) -> u16 {
    let size = bytes.saturating_add(CONNECTION_OVERHEAD_BYTES);
    u16::try_from(size).unwrap_or(u16::MAX) & CONNECTION_SIZE_MASK
}

/// Compute the layout of an assembly.
pub fn compute_layout(assembly: &Assembly) -> Result<AssemblyLayout, BuilderError> {
    let fail = |reason: String| BuilderError::Layout {
        assembly: assembly.id.clone(),
        reason,
    };
    let size_bytes = assembly.size_bytes();

    let mut bool_starts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut bool_bits: BTreeSet<u32> = BTreeSet::new();
    let mut typed: HashMap<u32, usize> = HashMap::new();

    for (index, field) in assembly.fields.iter().enumerate() {
        let end = u64::from(field.offset_bits) + field.bit_len();
        if end > u64::from(assembly.size_bits) {
            return Err(fail(format!("field '{}' ends past the assembly", field.id)));
        }
        // Bounded by the assembly size from here on.
        let end = end as u32;
        if field.data_type.is_bit() {
            bool_starts.insert(field.offset_bits, index);
            bool_bits.extend(field.offset_bits..end);
        } else if field.offset_bits % 8 != 0 {
            return Err(fail(format!("field '{}' is not byte aligned", field.id)));
        } else {
            typed.insert(field.offset_bits / 8, index);
        }
    }

    let mut entries = Vec::new();
    let mut placed = 0usize;
    let mut pad: Option<(u32, u32)> = None;
    let mut byte = 0u32;

    while byte < size_bytes {
        let bits = byte * 8..byte * 8 + 8;
        if bool_bits.range(bits.clone()).next().is_some() {
            flush_pad(&mut pad, &mut entries);
            for bit in bits {
                if let Some(index) = bool_starts.get(&bit) {
                    entries.push(declared(&assembly.fields[*index]));
                    placed += 1;
                } else if !bool_bits.contains(&bit) {
                    entries.push(LayoutEntry {
                        id: format!("spare_bit_{byte}_{}", bit % 8),
                        data_type: DataType::Bool,
                        offset_bits: bit,
                        length: 1,
                        spare: true,
                    });
                }
            }
            byte += 1;
        } else if let Some(index) = typed.get(&byte) {
            flush_pad(&mut pad, &mut entries);
            let field = &assembly.fields[*index];
            entries.push(declared(field));
            placed += 1;
            byte += ((field.bit_len() / 8) as u32).max(1);
        } else {
            match pad.as_mut() {
                Some((_, len)) => *len += 1,
                None => pad = Some((byte, 1)),
            }
            byte += 1;
        }
    }
    flush_pad(&mut pad, &mut entries);

    if placed != assembly.fields.len() {
        let missing = assembly
            .fields
            .iter()
            .find(|f| !entries.iter().any(|e| !e.spare && e.id == f.id))
            .map(|f| f.id.clone())
            .unwrap_or_default();
        return Err(fail(format!("field '{missing}' overlaps another field")));
    }

    Ok(AssemblyLayout {
        assembly: assembly.id.clone(),
        direction: assembly.direction,
        size_bytes,
        entries,
    })
}

fn declared(field: &crate::domain::AssemblyField) -> LayoutEntry {
    LayoutEntry {
        id: field.id.clone(),
        data_type: field.data_type,
        offset_bits: field.offset_bits,
        length: field.length,
        spare: false,
    }
}

fn flush_pad(pad: &mut Option<(u32, u32)>, entries: &mut Vec<LayoutEntry>) {
    if let Some((start, len)) = pad.take() {
        entries.push(LayoutEntry {
            id: format!("spare_byte_{start}"),
            data_type: DataType::String,
            offset_bits: start * 8,
            length: len,
            spare: true,
        });
    }
}

/// Errors raised when reading or writing frame fields.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("no field '{0}' in assembly")]
    UnknownField(String),

    #[error("field '{field}' is {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("value for '{field}' is longer than {length} characters")]
    TooLong { field: String, length: u32 },
}

/// A byte image of an assembly with typed field access.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyFrame {
    layout: AssemblyLayout,
    bytes: Vec<u8>,
}

impl AssemblyFrame {
    /// Zero-initialised frame.
    pub fn new(layout: AssemblyLayout) -> Self {
        let bytes = vec![0; layout.size_bytes as usize];
        Self { layout, bytes }
    }

    pub fn layout(&self) -> &AssemblyLayout {
        &self.layout
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn set(&mut self, field: &str, value: &AttrValue) -> Result<(), FrameError> {
        let entry = self
            .layout
            .entry(field)
            .ok_or_else(|| FrameError::UnknownField(field.to_string()))?;
        if entry.data_type != value.data_type() {
            return Err(FrameError::TypeMismatch {
                field: field.to_string(),
                expected: entry.data_type,
                actual: value.data_type(),
            });
        }

        let offset = entry.offset_bits;
        let start = (offset / 8) as usize;
        match value {
            AttrValue::Bool(on) => {
                let mask = 1u8 << (offset % 8);
                if *on {
                    self.bytes[start] |= mask;
                } else {
                    self.bytes[start] &= !mask;
                }
            }
            AttrValue::String(text) => {
                if text.len() > entry.length as usize {
                    return Err(FrameError::TooLong {
                        field: field.to_string(),
                        length: entry.length,
                    });
                }
                let end = start + entry.length as usize;
                self.bytes[start..end].fill(0);
                self.bytes[start..start + text.len()].copy_from_slice(text.as_bytes());
            }
            numeric => {
                let encoded = numeric.encode();
                self.bytes[start..start + encoded.len()].copy_from_slice(&encoded);
            }
        }
        Ok(())
    }

    pub fn get(&self, field: &str) -> Result<AttrValue, FrameError> {
        let entry = self
            .layout
            .entry(field)
            .ok_or_else(|| FrameError::UnknownField(field.to_string()))?;
        let offset = entry.offset_bits;
        let start = (offset / 8) as usize;
        let span = match entry.data_type {
            DataType::String => entry.length as usize,
            other => other.byte_size() as usize,
        };
        let raw = &self.bytes[start..start + span];

        let value = match entry.data_type {
            DataType::Bool => AttrValue::Bool(raw[0] & (1 << (offset % 8)) != 0),
            DataType::String => AttrValue::String(
                String::from_utf8_lossy(raw)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            DataType::Usint => AttrValue::Usint(raw[0]),
            DataType::Sint => AttrValue::Sint(i8::from_le_bytes([raw[0]])),
            DataType::Uint => AttrValue::Uint(u16::from_le_bytes([raw[0], raw[1]])),
            DataType::Int => AttrValue::Int(i16::from_le_bytes([raw[0], raw[1]])),
            DataType::Udint => AttrValue::Udint(u32::from_le_bytes(le4(raw))),
            DataType::Dint => AttrValue::Dint(i32::from_le_bytes(le4(raw))),
            DataType::Real => AttrValue::Real(f32::from_le_bytes(le4(raw))),
            DataType::Ulint => AttrValue::Ulint(u64::from_le_bytes(le8(raw))),
            DataType::Lint => AttrValue::Lint(i64::from_le_bytes(le8(raw))),
            DataType::Lreal => AttrValue::Lreal(f64::from_le_bytes(le8(raw))),
        };
        Ok(value)
    }
}

fn le4(raw: &[u8]) -> [u8; 4] {
    [raw[0], raw[1], raw[2], raw[3]]
}

fn le8(raw: &[u8]) -> [u8; 8] {
    [raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssemblyField, Location};

    fn field(id: &str, data_type: DataType, offset_bits: u32, length: u32) -> AssemblyField {
        AssemblyField {
            id: id.to_string(),
            data_type,
            offset_bits,
            length,
            location: Location::new(1, id),
        }
    }

    fn assembly(size_bits: u32, fields: Vec<AssemblyField>) -> Assembly {
        Assembly {
            id: "AS_OT".to_string(),
            direction: AssemblyDirection::OriginatorToTarget,
            size_bits,
            heartbeat: None,
            fields,
            location: Location::new(1, "device/assembly[1]"),
        }
    }

    #[test]
    fn test_layout_inserts_spares_and_covers_assembly() {
        let asm = assembly(
            64,
            vec![
                field("alive", DataType::Usint, 0, 1),
                field("door", DataType::Bool, 9, 1),
                field("speed", DataType::Real, 32, 1),
            ],
        );
        let layout = compute_layout(&asm).unwrap();
        let ids: Vec<&str> = layout.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "alive",
                "spare_bit_1_0",
                "door",
                "spare_bit_1_2",
                "spare_bit_1_3",
                "spare_bit_1_4",
                "spare_bit_1_5",
                "spare_bit_1_6",
                "spare_bit_1_7",
                "spare_byte_2",
                "speed",
            ]
        );
        let total: u64 = layout.entries.iter().map(|e| e.bit_len()).sum();
        assert_eq!(total, 64);
        assert_eq!(layout.entry("spare_byte_2").unwrap().length, 2);
        assert_eq!(layout.fields().count(), 3);
    }

    #[test]
    fn test_layout_rejects_overlap() {
        let asm = assembly(
            32,
            vec![
                field("a", DataType::Uint, 0, 1),
                field("b", DataType::Usint, 8, 1),
            ],
        );
        let err = compute_layout(&asm).unwrap_err();
        assert!(err.to_string().contains("'b' overlaps"));
    }

    #[test]
    fn test_connection_params() {
        let params = ConnectionParams::from_sizes(8, 16);
        assert_eq!(params.ot, 0x4800 | 14);
        assert_eq!(params.to, 0x2800 | 22);
    }

    #[test]
    fn test_frame_set_and_get() {
        let asm = assembly(
            64,
            vec![
                field("alive", DataType::Usint, 0, 1),
                field("door", DataType::Bool, 9, 1),
                field("tag", DataType::String, 16, 2),
                field("speed", DataType::Real, 32, 1),
            ],
        );
        let mut frame = AssemblyFrame::new(compute_layout(&asm).unwrap());
        frame.set("alive", &AttrValue::Usint(7)).unwrap();
        frame.set("door", &AttrValue::Bool(true)).unwrap();
        frame.set("tag", &AttrValue::String("ok".into())).unwrap();
        frame.set("speed", &AttrValue::Real(1.5)).unwrap();

        assert_eq!(frame.bytes()[0], 7);
        assert_eq!(frame.bytes()[1], 0b0000_0010);
        assert_eq!(frame.get("speed").unwrap(), AttrValue::Real(1.5));
        assert_eq!(frame.get("tag").unwrap(), AttrValue::String("ok".into()));
        assert_eq!(frame.get("door").unwrap(), AttrValue::Bool(true));

        assert!(matches!(
            frame.set("alive", &AttrValue::Uint(1)),
            Err(FrameError::TypeMismatch { .. })
        ));
        assert!(matches!(
            frame.set("tag", &AttrValue::String("long".into())),
            Err(FrameError::TooLong { .. })
        ));
        assert!(matches!(
            frame.get("nope"),
            Err(FrameError::UnknownField(_))
        ));
    }

    #[test]
    fn test_frame_round_trips_full_fields() {
        let asm = assembly(
            96,
            vec![
                field("tag", DataType::String, 0, 4),
                field("count", DataType::Dint, 32, 1),
                field("total", DataType::Udint, 64, 1),
            ],
        );
        let mut frame = AssemblyFrame::new(compute_layout(&asm).unwrap());
        frame.set("tag", &AttrValue::String("abcd".into())).unwrap();
        frame.set("count", &AttrValue::Dint(-5)).unwrap();
        frame.set("total", &AttrValue::Udint(0x0102_0304)).unwrap();

        assert_eq!(
            frame.bytes(),
            &[b'a', b'b', b'c', b'd', 0xFB, 0xFF, 0xFF, 0xFF, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(frame.get("tag").unwrap(), AttrValue::String("abcd".into()));
        assert_eq!(frame.get("count").unwrap(), AttrValue::Dint(-5));
        assert_eq!(frame.get("total").unwrap(), AttrValue::Udint(0x0102_0304));
    }
}

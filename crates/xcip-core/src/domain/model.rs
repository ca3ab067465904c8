//! Typed in-memory model of a CIP device configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::types::{AttrValue, DataType};

/// Where an element was declared in its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line number of the element's start tag.
    pub line: usize,
    /// Element path from the root, e.g. `device/object[2]/attribute[1]`.
    pub path: String,
}

impl Location {
    pub fn new(line: usize, path: impl Into<String>) -> Self {
        Self {
            line,
            path: path.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} ({})", self.line, self.path)
    }
}

/// Reference to a CIP object by (class code, instance id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub class: u16,
    pub instance: u16,
}

impl ObjectRef {
    pub fn new(class: u16, instance: u16) -> Self {
        Self { class, instance }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}:{}", self.class, self.instance)
    }
}

/// Device identity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_code: u16,
    /// Revision as declared, e.g. `1.2`.
    pub revision: String,
    pub name: Option<String>,
}

impl DeviceIdentity {
    /// Human-readable label used in reports and logs.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "vendor 0x{:04X} product {} rev {}",
                self.vendor_id, self.product_code, self.revision
            ),
        }
    }
}

/// Global timing parameters of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingParams {
    /// Default requested packet interval for connections.
    pub rpi: Duration,
    /// Response timeout for explicit requests.
    pub timeout: Duration,
    /// Minimum packet interval the device supports.
    pub min_rpi: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessRule {
    ReadOnly,
    ReadWrite,
}

/// One attribute of a CIP object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CipAttribute {
    pub id: u16,
    pub data_type: DataType,
    pub access: AccessRule,
    pub default: Option<AttrValue>,
    /// Exercise this attribute even if it is read-only.
    pub exercise: bool,
    pub location: Location,
}

impl CipAttribute {
    /// Whether the plan builder emits set/get traffic for this attribute.
    pub fn is_exercised(&self) -> bool {
        self.access == AccessRule::ReadWrite || self.exercise
    }

    /// Value written when the attribute is exercised.
    pub fn exercise_value(&self) -> AttrValue {
        self.default
            .clone()
            .unwrap_or_else(|| self.data_type.zero_value())
    }
}

/// A CIP object class instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CipObject {
    pub class: u16,
    pub instance: u16,
    pub name: Option<String>,
    pub attributes: Vec<CipAttribute>,
    pub location: Location,
}

impl CipObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.class, self.instance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    PointToPoint,
    Multicast,
}

impl ConnectionType {
    pub fn parse(literal: &str) -> Option<Self> {
        match literal.trim().to_ascii_lowercase().as_str() {
            "point_to_point" | "p2p" => Some(Self::PointToPoint),
            "multicast" => Some(Self::Multicast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cyclic,
    ChangeOfState,
    Application,
}

impl TriggerType {
    pub fn parse(literal: &str) -> Option<Self> {
        match literal.trim().to_ascii_lowercase().as_str() {
            "cyclic" => Some(Self::Cyclic),
            "change_of_state" | "cos" => Some(Self::ChangeOfState),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

/// An implicit-messaging connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub producer: ObjectRef,
    pub consumer: ObjectRef,
    /// Requested packet interval.
    pub rpi: Duration,
    pub connection_type: ConnectionType,
    pub trigger: TriggerType,
    pub location: Location,
}

/// Direction of an I/O assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssemblyDirection {
    /// Originator to target (`OT_EO`).
    #[serde(rename = "OT_EO")]
    OriginatorToTarget,
    /// Target to originator (`TO`).
    #[serde(rename = "TO")]
    TargetToOriginator,
}

impl AssemblyDirection {
    pub fn parse(literal: &str) -> Option<Self> {
        match literal.trim() {
            "OT_EO" | "OT" => Some(Self::OriginatorToTarget),
            "TO" => Some(Self::TargetToOriginator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginatorToTarget => "OT_EO",
            Self::TargetToOriginator => "TO",
        }
    }
}

/// A typed field inside an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyField {
    pub id: String,
    pub data_type: DataType,
    /// Offset in bits from the start of the assembly.
    pub offset_bits: u32,
    /// Number of elements (characters for strings).
    pub length: u32,
    pub location: Location,
}

impl AssemblyField {
    /// Number of bits this field occupies.
    pub fn bit_len(&self) -> u64 {
        let length = u64::from(self.length);
        if self.data_type.is_bit() {
            length
        } else {
            length * u64::from(self.data_type.byte_size()) * 8
        }
    }
}

/// An I/O assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub id: String,
    pub direction: AssemblyDirection,
    pub size_bits: u32,
    /// Id of a `usint` field incremented once per I/O cycle.
    pub heartbeat: Option<String>,
    pub fields: Vec<AssemblyField>,
    pub location: Location,
}

impl Assembly {
    pub fn size_bytes(&self) -> u32 {
        self.size_bits / 8
    }
}

/// Addresses used to reach the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub target_ip: Ipv4Addr,
    pub multicast_ip: Ipv4Addr,
    pub location: Location,
}

/// Root of a validated device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub identity: DeviceIdentity,
    pub timing: TimingParams,
    pub objects: Vec<CipObject>,
    pub connections: Vec<Connection>,
    pub assemblies: Vec<Assembly>,
    pub network: Option<NetworkSettings>,
}

impl DeviceConfig {
    pub fn object(&self, reference: ObjectRef) -> Option<&CipObject> {
        self.objects.iter().find(|o| o.object_ref() == reference)
    }

    pub fn assembly(&self, direction: AssemblyDirection) -> Option<&Assembly> {
        self.assemblies.iter().find(|a| a.direction == direction)
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Number of attributes the plan builder exercises.
    pub fn exercised_attribute_count(&self) -> usize {
        self.objects
            .iter()
            .flat_map(|o| o.attributes.iter())
            .filter(|a| a.is_exercised())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(access: AccessRule, exercise: bool) -> CipAttribute {
        CipAttribute {
            id: 1,
            data_type: DataType::Uint,
            access,
            default: None,
            exercise,
            location: Location::new(1, "device/object[1]/attribute[1]"),
        }
    }

    #[test]
    fn test_is_exercised() {
        assert!(attribute(AccessRule::ReadWrite, false).is_exercised());
        assert!(attribute(AccessRule::ReadOnly, true).is_exercised());
        assert!(!attribute(AccessRule::ReadOnly, false).is_exercised());
    }

    #[test]
    fn test_exercise_value_falls_back_to_zero() {
        let mut attr = attribute(AccessRule::ReadWrite, false);
        assert_eq!(attr.exercise_value(), AttrValue::Uint(0));
        attr.default = Some(AttrValue::Uint(7));
        assert_eq!(attr.exercise_value(), AttrValue::Uint(7));
    }

    #[test]
    fn test_object_ref_display() {
        assert_eq!(ObjectRef::new(0x04, 100).to_string(), "0x04:100");
    }

    #[test]
    fn test_field_bit_len() {
        let field = AssemblyField {
            id: "name".into(),
            data_type: DataType::String,
            offset_bits: 0,
            length: 4,
            location: Location::new(1, "x"),
        };
        assert_eq!(field.bit_len(), 32);
    }
}

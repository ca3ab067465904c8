//! Structural pass: raw element tree to a typed draft.
//!
//! Checks element names, required attributes and literal syntax. Elements
//! with structural problems are left out of the draft so the semantic pass
//! only sees values it can trust.

use std::net::Ipv4Addr;
use std::time::Duration;

use super::document::RawElement;
use super::Violations;
use crate::domain::types::{parse_bool, parse_int_literal};
use crate::domain::{
    AccessRule, Assembly, AssemblyDirection, AssemblyField, ConnectionType, DataType,
    DeviceIdentity, Location, ObjectRef, StructuralError, TriggerType,
};

pub(crate) const ROOT: &str = "device";

/// Attribute as declared, default not yet type-checked.
#[derive(Debug, Clone)]
pub(crate) struct DraftAttribute {
    pub id: u16,
    pub data_type: DataType,
    pub access: AccessRule,
    pub default: Option<String>,
    pub exercise: bool,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub(crate) struct DraftObject {
    pub reference: ObjectRef,
    pub name: Option<String>,
    pub attributes: Vec<DraftAttribute>,
    pub location: Location,
}

/// Connection as declared; `rpi` is `None` when the device default applies.
#[derive(Debug, Clone)]
pub(crate) struct DraftConnection {
    pub name: String,
    pub producer: ObjectRef,
    pub consumer: ObjectRef,
    pub rpi: Option<Duration>,
    pub connection_type: ConnectionType,
    pub trigger: TriggerType,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub(crate) struct DraftTiming {
    pub rpi_ms: u64,
    pub timeout_ms: u64,
    pub min_rpi_ms: u64,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub(crate) struct DraftNetwork {
    pub target_ip: Ipv4Addr,
    pub multicast_ip: Ipv4Addr,
    pub location: Location,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Draft {
    pub identity: Option<(DeviceIdentity, Location)>,
    pub timing: Option<DraftTiming>,
    pub objects: Vec<DraftObject>,
    pub connections: Vec<DraftConnection>,
    pub assemblies: Vec<Assembly>,
    pub network: Option<DraftNetwork>,
}

/// Lower the root element into a draft, recording structural violations.
pub(crate) fn lower(root: &RawElement, out: &mut Violations) -> Draft {
    let mut draft = Draft::default();
    let location = Location::new(root.line, ROOT);

    if root.name != ROOT {
        out.push(StructuralError::UnknownElement {
            parent: "document".to_string(),
            element: root.name.clone(),
            location: Location::new(root.line, root.name.clone()),
        });
        return draft;
    }

    draft.identity = lower_identity(root, &location, out);

    let mut counter = ChildCounter::default();
    let mut timing_seen = false;
    let mut network_seen = false;

    for child in &root.children {
        let child_location = counter.locate(ROOT, child);
        match child.name.as_str() {
            "timing" => {
                if timing_seen {
                    out.push(StructuralError::RepeatedElement {
                        parent: ROOT.to_string(),
                        element: "timing".to_string(),
                        location: child_location,
                    });
                    continue;
                }
                timing_seen = true;
                reject_children(child, &child_location, out);
                draft.timing = lower_timing(child, child_location, out);
            }
            "network" => {
                if network_seen {
                    out.push(StructuralError::RepeatedElement {
                        parent: ROOT.to_string(),
                        element: "network".to_string(),
                        location: child_location,
                    });
                    continue;
                }
                network_seen = true;
                reject_children(child, &child_location, out);
                draft.network = lower_network(child, child_location, out);
            }
            "object" => {
                if let Some(object) = lower_object(child, child_location, out) {
                    draft.objects.push(object);
                }
            }
            "connection" => {
                reject_children(child, &child_location, out);
                if let Some(connection) = lower_connection(child, child_location, out) {
                    draft.connections.push(connection);
                }
            }
            "assembly" => {
                if let Some(assembly) = lower_assembly(child, child_location, out) {
                    draft.assemblies.push(assembly);
                }
            }
            other => out.push(StructuralError::UnknownElement {
                parent: ROOT.to_string(),
                element: other.to_string(),
                location: child_location,
            }),
        }
    }

    if !timing_seen {
        out.push(StructuralError::MissingElement {
            parent: ROOT.to_string(),
            element: "timing".to_string(),
            location,
        });
    }

    draft
}

fn lower_identity(
    root: &RawElement,
    location: &Location,
    out: &mut Violations,
) -> Option<(DeviceIdentity, Location)> {
    let vendor_id = required_parsed(root, location, "vendor_id", "a 16-bit integer", parse_u16, out);
    let product_code =
        required_parsed(root, location, "product_code", "a 16-bit integer", parse_u16, out);
    let revision = required(root, location, "revision", out).map(str::to_string);
    let name = root.attribute("name").map(str::to_string);

    Some((
        DeviceIdentity {
            vendor_id: vendor_id?,
            product_code: product_code?,
            revision: revision?,
            name,
        },
        location.clone(),
    ))
}

fn lower_timing(el: &RawElement, location: Location, out: &mut Violations) -> Option<DraftTiming> {
    let rpi_ms = required_parsed(el, &location, "rpi_ms", "milliseconds", parse_u64, out);
    let timeout_ms = required_parsed(el, &location, "timeout_ms", "milliseconds", parse_u64, out);
    let min_rpi_ms = required_parsed(el, &location, "min_rpi_ms", "milliseconds", parse_u64, out);
    Some(DraftTiming {
        rpi_ms: rpi_ms?,
        timeout_ms: timeout_ms?,
        min_rpi_ms: min_rpi_ms?,
        location,
    })
}

fn lower_network(el: &RawElement, location: Location, out: &mut Violations) -> Option<DraftNetwork> {
    let parse_ip = |s: &str| s.trim().parse::<Ipv4Addr>().ok();
    let target_ip = required_parsed(el, &location, "target_ip", "an IPv4 address", parse_ip, out);
    let multicast_ip =
        required_parsed(el, &location, "multicast_ip", "an IPv4 address", parse_ip, out);
    Some(DraftNetwork {
        target_ip: target_ip?,
        multicast_ip: multicast_ip?,
        location,
    })
}

fn lower_object(el: &RawElement, location: Location, out: &mut Violations) -> Option<DraftObject> {
    let class = required_parsed(el, &location, "class", "a 16-bit class code", parse_u16, out);
    let instance =
        required_parsed(el, &location, "instance", "a 16-bit instance id", parse_u16, out);

    let mut attributes = Vec::new();
    let mut counter = ChildCounter::default();
    for child in &el.children {
        let child_location = counter.locate(&location.path, child);
        if child.name != "attribute" {
            out.push(StructuralError::UnknownElement {
                parent: "object".to_string(),
                element: child.name.clone(),
                location: child_location,
            });
            continue;
        }
        reject_children(child, &child_location, out);
        if let Some(attribute) = lower_attribute(child, child_location, out) {
            attributes.push(attribute);
        }
    }

    Some(DraftObject {
        reference: ObjectRef::new(class?, instance?),
        name: el.attribute("name").map(str::to_string),
        attributes,
        location,
    })
}

fn lower_attribute(
    el: &RawElement,
    location: Location,
    out: &mut Violations,
) -> Option<DraftAttribute> {
    let id = required_parsed(el, &location, "id", "a 16-bit attribute id", parse_u16, out);
    let data_type = required_parsed(el, &location, "type", "a CIP data type", DataType::parse, out);
    let access = required_parsed(el, &location, "access", "ro or rw", parse_access, out);
    let exercise = optional_parsed(el, &location, "exercise", "true or false", parse_bool, out);

    Some(DraftAttribute {
        id: id?,
        data_type: data_type?,
        access: access?,
        default: el.attribute("default").map(str::to_string),
        exercise: exercise?.unwrap_or(false),
        location,
    })
}

fn lower_connection(
    el: &RawElement,
    location: Location,
    out: &mut Violations,
) -> Option<DraftConnection> {
    let name = required(el, &location, "name", out).map(str::to_string);
    let producer =
        required_parsed(el, &location, "producer", "class:instance", parse_object_ref, out);
    let consumer =
        required_parsed(el, &location, "consumer", "class:instance", parse_object_ref, out);
    let rpi_ms = optional_parsed(el, &location, "rpi_ms", "milliseconds", parse_u64, out);
    let connection_type = required_parsed(
        el,
        &location,
        "type",
        "point_to_point or multicast",
        ConnectionType::parse,
        out,
    );
    let trigger = required_parsed(
        el,
        &location,
        "trigger",
        "cyclic, change_of_state or application",
        TriggerType::parse,
        out,
    );

    Some(DraftConnection {
        name: name?,
        producer: producer?,
        consumer: consumer?,
        rpi: rpi_ms?.map(Duration::from_millis),
        connection_type: connection_type?,
        trigger: trigger?,
        location,
    })
}

fn lower_assembly(el: &RawElement, location: Location, out: &mut Violations) -> Option<Assembly> {
    let id = required(el, &location, "id", out).map(str::to_string);
    let direction =
        required_parsed(el, &location, "subtype", "OT_EO or TO", AssemblyDirection::parse, out);
    let size_bits = required_parsed(el, &location, "size", "a size in bits", parse_u32, out);

    let mut fields = Vec::new();
    let mut counter = ChildCounter::default();
    for child in &el.children {
        let child_location = counter.locate(&location.path, child);
        let Some(data_type) = DataType::parse(&child.name) else {
            out.push(StructuralError::UnknownElement {
                parent: "assembly".to_string(),
                element: child.name.clone(),
                location: child_location,
            });
            continue;
        };
        reject_children(child, &child_location, out);
        if let Some(field) = lower_field(child, data_type, child_location, out) {
            fields.push(field);
        }
    }

    Some(Assembly {
        id: id?,
        direction: direction?,
        size_bits: size_bits?,
        heartbeat: el.attribute("heartbeat").map(str::to_string),
        fields,
        location,
    })
}

fn lower_field(
    el: &RawElement,
    data_type: DataType,
    location: Location,
    out: &mut Violations,
) -> Option<AssemblyField> {
    let id = required(el, &location, "id", out).map(str::to_string);
    let offset_bits = required_parsed(el, &location, "offset", "a bit offset", parse_u32, out);
    // Only string fields span several elements.
    let (expected, max) = if data_type == DataType::String {
        ("a positive length", u32::MAX)
    } else {
        ("1 (only string fields take a length)", 1)
    };
    let valid = |s: &str| parse_u32(s).filter(|n| (1..=max).contains(n));
    let length = optional_parsed(el, &location, "length", expected, valid, out);

    Some(AssemblyField {
        id: id?,
        data_type,
        offset_bits: offset_bits?,
        length: length?.unwrap_or(1),
        location,
    })
}

/// Leaf elements carry no children.
fn reject_children(el: &RawElement, location: &Location, out: &mut Violations) {
    for child in &el.children {
        out.push(StructuralError::UnknownElement {
            parent: el.name.clone(),
            element: child.name.clone(),
            location: Location::new(child.line, format!("{}/{}", location.path, child.name)),
        });
    }
}

fn required<'a>(
    el: &'a RawElement,
    location: &Location,
    key: &str,
    out: &mut Violations,
) -> Option<&'a str> {
    let value = el.attribute(key);
    if value.is_none() {
        out.push(StructuralError::MissingAttribute {
            element: el.name.clone(),
            attribute: key.to_string(),
            location: location.clone(),
        });
    }
    value
}

fn required_parsed<T>(
    el: &RawElement,
    location: &Location,
    key: &str,
    expected: &str,
    parse: impl Fn(&str) -> Option<T>,
    out: &mut Violations,
) -> Option<T> {
    let raw = required(el, location, key, out)?;
    parse_literal(el, location, key, raw, expected, parse, out)
}

/// `None` when the attribute is present but invalid, `Some(None)` when absent.
fn optional_parsed<T>(
    el: &RawElement,
    location: &Location,
    key: &str,
    expected: &str,
    parse: impl Fn(&str) -> Option<T>,
    out: &mut Violations,
) -> Option<Option<T>> {
    match el.attribute(key) {
        None => Some(None),
        Some(raw) => parse_literal(el, location, key, raw, expected, parse, out).map(Some),
    }
}

fn parse_literal<T>(
    el: &RawElement,
    location: &Location,
    key: &str,
    raw: &str,
    expected: &str,
    parse: impl Fn(&str) -> Option<T>,
    out: &mut Violations,
) -> Option<T> {
    let value = parse(raw);
    if value.is_none() {
        out.push(StructuralError::InvalidLiteral {
            element: el.name.clone(),
            attribute: key.to_string(),
            value: raw.to_string(),
            expected: expected.to_string(),
            location: location.clone(),
        });
    }
    value
}

fn parse_u16(s: &str) -> Option<u16> {
    parse_int_literal(s).and_then(|v| u16::try_from(v).ok())
}

fn parse_u32(s: &str) -> Option<u32> {
    parse_int_literal(s).and_then(|v| u32::try_from(v).ok())
}

fn parse_u64(s: &str) -> Option<u64> {
    parse_int_literal(s).and_then(|v| u64::try_from(v).ok())
}

fn parse_access(s: &str) -> Option<AccessRule> {
    match s.trim().to_ascii_lowercase().as_str() {
        "ro" | "read_only" => Some(AccessRule::ReadOnly),
        "rw" | "read_write" => Some(AccessRule::ReadWrite),
        _ => None,
    }
}

fn parse_object_ref(s: &str) -> Option<ObjectRef> {
    let (class, instance) = s.split_once(':')?;
    Some(ObjectRef::new(parse_u16(class)?, parse_u16(instance)?))
}

/// Builds indexed element paths such as `device/object[2]`.
#[derive(Default)]
struct ChildCounter {
    seen: Vec<(String, usize)>,
}

impl ChildCounter {
    fn locate(&mut self, parent_path: &str, child: &RawElement) -> Location {
        let index = match self.seen.iter_mut().find(|(name, _)| *name == child.name) {
            Some((_, count)) => {
                *count += 1;
                *count
            }
            None => {
                self.seen.push((child.name.clone(), 1));
                1
            }
        };
        Location::new(child.line, format!("{parent_path}/{}[{index}]", child.name))
    }
}

//! Semantic pass: draft to `DeviceConfig`, recording rule violations.

use std::collections::HashMap;
use std::time::Duration;

use super::schema::{Draft, DraftConnection, DraftObject};
use super::Violations;
use crate::domain::{
    Assembly, AssemblyDirection, CipAttribute, CipObject, Connection, DataType, DeviceConfig,
    Location, NetworkSettings, ObjectRef, SemanticError, TimingParams,
};

/// Check every rule and build the configuration.
///
/// Returns `None` only when the identity or timing block could not be
/// lowered; the structural pass has already reported why.
pub(crate) fn check(draft: Draft, out: &mut Violations) -> Option<DeviceConfig> {
    let Draft {
        identity,
        timing,
        objects,
        connections,
        assemblies,
        network,
    } = draft;

    if let Some((identity, location)) = &identity {
        if identity.revision.trim().is_empty() {
            out.push(SemanticError::EmptyIdentity {
                field: "revision".to_string(),
                location: location.clone(),
            });
        }
        if identity.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            out.push(SemanticError::EmptyIdentity {
                field: "name".to_string(),
                location: location.clone(),
            });
        }
    }

    let timing = timing.map(|t| {
        for (field, value) in [
            ("rpi_ms", t.rpi_ms),
            ("timeout_ms", t.timeout_ms),
            ("min_rpi_ms", t.min_rpi_ms),
        ] {
            if value == 0 {
                out.push(SemanticError::NonPositiveTiming {
                    field: field.to_string(),
                    location: t.location.clone(),
                });
            }
        }
        if t.rpi_ms > 0 && t.rpi_ms < t.min_rpi_ms {
            out.push(SemanticError::DefaultIntervalBelowMinimum {
                rpi_ms: t.rpi_ms,
                min_rpi_ms: t.min_rpi_ms,
                location: t.location.clone(),
            });
        }
        TimingParams {
            rpi: Duration::from_millis(t.rpi_ms),
            timeout: Duration::from_millis(t.timeout_ms),
            min_rpi: Duration::from_millis(t.min_rpi_ms),
        }
    });

    let objects = check_objects(objects, out);
    let connections = check_connections(connections, &objects, timing.as_ref(), out);
    check_assemblies(&assemblies, out);

    let network = network.map(|n| {
        if !n.multicast_ip.is_multicast() {
            out.push(SemanticError::MulticastOutOfRange {
                address: n.multicast_ip.to_string(),
                location: n.location.clone(),
            });
        }
        NetworkSettings {
            target_ip: n.target_ip,
            multicast_ip: n.multicast_ip,
            location: n.location,
        }
    });

    Some(DeviceConfig {
        identity: identity?.0,
        timing: timing?,
        objects,
        connections,
        assemblies,
        network,
    })
}

fn check_objects(objects: Vec<DraftObject>, out: &mut Violations) -> Vec<CipObject> {
    let mut seen: HashMap<ObjectRef, Location> = HashMap::new();
    let mut checked = Vec::with_capacity(objects.len());

    for object in objects {
        if let Some(first) = seen.get(&object.reference) {
            out.push(SemanticError::DuplicateObject {
                object: object.reference,
                first: first.clone(),
                second: object.location.clone(),
            });
            continue;
        }
        seen.insert(object.reference, object.location.clone());

        let mut attribute_seen: HashMap<u16, Location> = HashMap::new();
        let mut attributes = Vec::with_capacity(object.attributes.len());
        for attribute in object.attributes {
            if let Some(first) = attribute_seen.get(&attribute.id) {
                out.push(SemanticError::DuplicateAttribute {
                    object: object.reference,
                    attribute: attribute.id,
                    first: first.clone(),
                    second: attribute.location.clone(),
                });
                continue;
            }
            attribute_seen.insert(attribute.id, attribute.location.clone());

            let default = match attribute.default.as_deref() {
                None => None,
                Some(literal) => match attribute.data_type.parse_value(literal) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        out.push(SemanticError::DefaultTypeMismatch {
                            object: object.reference,
                            attribute: attribute.id,
                            declared: attribute.data_type,
                            value: literal.to_string(),
                            reason,
                            location: attribute.location.clone(),
                        });
                        None
                    }
                },
            };

            attributes.push(CipAttribute {
                id: attribute.id,
                data_type: attribute.data_type,
                access: attribute.access,
                default,
                exercise: attribute.exercise,
                location: attribute.location,
            });
        }

        checked.push(CipObject {
            class: object.reference.class,
            instance: object.reference.instance,
            name: object.name,
            attributes,
            location: object.location,
        });
    }

    checked
}

fn check_connections(
    connections: Vec<DraftConnection>,
    objects: &[CipObject],
    timing: Option<&TimingParams>,
    out: &mut Violations,
) -> Vec<Connection> {
    let mut seen: HashMap<String, Location> = HashMap::new();
    let mut checked = Vec::with_capacity(connections.len());

    for connection in connections {
        if let Some(first) = seen.get(&connection.name) {
            out.push(SemanticError::DuplicateConnection {
                connection: connection.name.clone(),
                first: first.clone(),
                second: connection.location.clone(),
            });
            continue;
        }
        seen.insert(connection.name.clone(), connection.location.clone());

        for (role, object) in [
            ("producer", connection.producer),
            ("consumer", connection.consumer),
        ] {
            if !objects.iter().any(|o| o.object_ref() == object) {
                out.push(SemanticError::DanglingReference {
                    connection: connection.name.clone(),
                    role: role.to_string(),
                    object,
                    location: connection.location.clone(),
                });
            }
        }

        // Without a timing block the interval cannot be resolved; the
        // missing block is already reported.
        let Some(timing) = timing else { continue };
        let rpi = connection.rpi.unwrap_or(timing.rpi);
        if rpi < timing.min_rpi {
            out.push(SemanticError::IntervalBelowMinimum {
                connection: connection.name.clone(),
                rpi_ms: rpi.as_millis() as u64,
                min_rpi_ms: timing.min_rpi.as_millis() as u64,
                location: connection.location.clone(),
            });
        }

        checked.push(Connection {
            name: connection.name,
            producer: connection.producer,
            consumer: connection.consumer,
            rpi,
            connection_type: connection.connection_type,
            trigger: connection.trigger,
            location: connection.location,
        });
    }

    checked
}

fn check_assemblies(assemblies: &[Assembly], out: &mut Violations) {
    let mut seen: HashMap<AssemblyDirection, &Location> = HashMap::new();
    for assembly in assemblies {
        if let Some(first) = seen.get(&assembly.direction) {
            out.push(SemanticError::DuplicateAssembly {
                subtype: assembly.direction.as_str().to_string(),
                first: (*first).clone(),
                second: assembly.location.clone(),
            });
        } else {
            seen.insert(assembly.direction, &assembly.location);
        }
        check_assembly_fields(assembly, out);
    }
}

fn check_assembly_fields(assembly: &Assembly, out: &mut Violations) {
    if assembly.size_bits == 0 || assembly.size_bits % 8 != 0 {
        out.push(SemanticError::AssemblySize {
            assembly: assembly.id.clone(),
            size_bits: assembly.size_bits,
            location: assembly.location.clone(),
        });
    }

    let mut placed: Vec<(u64, u64, &str)> = Vec::new();
    for field in &assembly.fields {
        let start = u64::from(field.offset_bits);
        let end = start + field.bit_len();

        if !field.data_type.is_bit() && start % 8 != 0 {
            out.push(SemanticError::FieldMisaligned {
                assembly: assembly.id.clone(),
                field: field.id.clone(),
                offset_bits: field.offset_bits,
                location: field.location.clone(),
            });
        }
        if end > u64::from(assembly.size_bits) {
            out.push(SemanticError::FieldOutOfBounds {
                assembly: assembly.id.clone(),
                field: field.id.clone(),
                end_bit: end,
                size_bits: assembly.size_bits,
                location: field.location.clone(),
            });
        }
        if let Some((_, _, other)) = placed.iter().find(|(s, e, _)| start < *e && *s < end) {
            out.push(SemanticError::FieldOverlap {
                assembly: assembly.id.clone(),
                field: field.id.clone(),
                other: other.to_string(),
                location: field.location.clone(),
            });
        }
        placed.push((start, end, &field.id));
    }

    if let Some(heartbeat) = &assembly.heartbeat {
        let valid = assembly
            .fields
            .iter()
            .any(|f| &f.id == heartbeat && f.data_type == DataType::Usint && f.length == 1);
        if !valid {
            out.push(SemanticError::HeartbeatField {
                assembly: assembly.id.clone(),
                field: heartbeat.clone(),
                location: assembly.location.clone(),
            });
        }
    }
}

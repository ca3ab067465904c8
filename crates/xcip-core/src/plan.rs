//! Traffic plan construction.
//!
//! A [`TrafficPlan`] is the ordered list of simulated CIP exchanges for one
//! validated device. Building is deterministic: objects in declaration
//! order, and for each object its implicit cycles (connections it produces)
//! before its explicit set/get pairs.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::domain::{
    AssemblyDirection, BuilderError, ConnectionType, DeviceConfig, ObjectRef, TriggerType,
};
use crate::layout::{compute_layout, AssemblyFrame, ConnectionParams};

/// Run duration used when none is configured.
pub const DEFAULT_RUN_DURATION: Duration = Duration::from_secs(1);

/// CIP services issued by explicit requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCode {
    GetAttributeSingle,
    SetAttributeSingle,
}

impl ServiceCode {
    pub fn code(&self) -> u8 {
        match self {
            ServiceCode::GetAttributeSingle => 0x0E,
            ServiceCode::SetAttributeSingle => 0x10,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            ServiceCode::GetAttributeSingle => "get",
            ServiceCode::SetAttributeSingle => "set",
        }
    }
}

/// Class/instance/attribute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttributePath {
    pub object: ObjectRef,
    pub attribute: u16,
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object, self.attribute)
    }
}

/// A single explicit-messaging exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplicitRequest {
    pub path: AttributePath,
    pub service: ServiceCode,
    pub payload: Vec<u8>,
    /// Response payload a get must return to pass.
    pub expected: Option<Vec<u8>>,
}

/// A burst of cyclic I/O on one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImplicitCycle {
    pub connection: String,
    pub consumer: ObjectRef,
    pub cycles: u32,
    pub interval: Duration,
    pub connection_type: ConnectionType,
    pub trigger: TriggerType,
    /// Forward Open sizes, present when the device declares assemblies.
    pub params: Option<ConnectionParams>,
    /// O→T frame sent each cycle.
    pub payload: Vec<u8>,
    /// Byte of `payload` holding the heartbeat counter.
    pub heartbeat_byte: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Explicit(ExplicitRequest),
    Implicit(ImplicitCycle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId(pub u32);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One entry of a traffic plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficEvent {
    pub id: EventId,
    /// Object this event belongs to (the producer for implicit cycles).
    pub object: ObjectRef,
    pub kind: EventKind,
}

impl TrafficEvent {
    pub fn is_implicit(&self) -> bool {
        matches!(self.kind, EventKind::Implicit(_))
    }

    /// Short human-readable description.
    pub fn label(&self) -> String {
        match &self.kind {
            EventKind::Explicit(req) => format!("{} {}", req.service.short_name(), req.path),
            EventKind::Implicit(cycle) => format!(
                "io '{}' {}x{}ms",
                cycle.connection,
                cycle.cycles,
                cycle.interval.as_millis()
            ),
        }
    }
}

/// Immutable ordered plan for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficPlan {
    pub device: String,
    /// Manifest-declared explicit response timeout.
    pub timeout: Duration,
    pub duration: Duration,
    events: Vec<TrafficEvent>,
}

impl TrafficPlan {
    pub fn events(&self) -> &[TrafficEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn implicit_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_implicit()).count()
    }

    pub fn explicit_count(&self) -> usize {
        self.events.len() - self.implicit_count()
    }
}

/// Options controlling plan construction.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Total run duration. `None` uses [`DEFAULT_RUN_DURATION`] and never
    /// yields fewer than one cycle.
    pub duration: Option<Duration>,
}

/// Builds traffic plans from validated configurations.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    options: PlanOptions,
}

impl PlanBuilder {
    pub fn new(options: PlanOptions) -> Self {
        Self { options }
    }

    pub fn with_duration(duration: Duration) -> Self {
        Self::new(PlanOptions {
            duration: Some(duration),
        })
    }

    pub fn build(&self, config: &DeviceConfig) -> Result<TrafficPlan, BuilderError> {
        let duration = self.options.duration.unwrap_or(DEFAULT_RUN_DURATION);
        let io = IoTemplate::from_config(config)?;

        let mut events = Vec::new();
        let mut next_id = 0u32;
        let mut push = |object: ObjectRef, kind: EventKind| {
            events.push(TrafficEvent {
                id: EventId(next_id),
                object,
                kind,
            });
            next_id += 1;
        };

        let mut scheduled = vec![false; config.connections.len()];
        for object in &config.objects {
            let reference = object.object_ref();

            for (index, connection) in config.connections.iter().enumerate() {
                if connection.producer != reference {
                    continue;
                }
                scheduled[index] = true;
                let cycle = self.implicit_cycle(connection, duration, &io)?;
                push(reference, EventKind::Implicit(cycle));
            }

            for attribute in object.attributes.iter().filter(|a| a.is_exercised()) {
                let path = AttributePath {
                    object: reference,
                    attribute: attribute.id,
                };
                let payload = attribute.exercise_value().encode();
                push(
                    reference,
                    EventKind::Explicit(ExplicitRequest {
                        path,
                        service: ServiceCode::SetAttributeSingle,
                        payload: payload.clone(),
                        expected: None,
                    }),
                );
                push(
                    reference,
                    EventKind::Explicit(ExplicitRequest {
                        path,
                        service: ServiceCode::GetAttributeSingle,
                        payload: Vec::new(),
                        expected: Some(payload),
                    }),
                );
            }
        }

        // Producers always resolve after validation; keep any stragglers in
        // declaration order rather than dropping them.
        for (index, connection) in config.connections.iter().enumerate() {
            if !scheduled[index] {
                let cycle = self.implicit_cycle(connection, duration, &io)?;
                push(connection.producer, EventKind::Implicit(cycle));
            }
        }

        Ok(TrafficPlan {
            device: config.identity.label(),
            timeout: config.timing.timeout,
            duration,
            events,
        })
    }

    fn implicit_cycle(
        &self,
        connection: &crate::domain::Connection,
        duration: Duration,
        io: &IoTemplate,
    ) -> Result<ImplicitCycle, BuilderError> {
        let cycles = self.cycle_count(&connection.name, duration, connection.rpi)?;
        Ok(ImplicitCycle {
            connection: connection.name.clone(),
            consumer: connection.consumer,
            cycles,
            interval: connection.rpi,
            connection_type: connection.connection_type,
            trigger: connection.trigger,
            params: io.params,
            payload: io.payload.clone(),
            heartbeat_byte: io.heartbeat_byte,
        })
    }

    fn cycle_count(
        &self,
        connection: &str,
        duration: Duration,
        interval: Duration,
    ) -> Result<u32, BuilderError> {
        let interval_nanos = interval.as_nanos().max(1);
        let cycles = u32::try_from(duration.as_nanos() / interval_nanos).unwrap_or(u32::MAX);
        if cycles > 0 {
            return Ok(cycles);
        }
        if self.options.duration.is_some() {
            return Err(BuilderError::ZeroCycles {
                connection: connection.to_string(),
                duration_ms: duration.as_millis() as u64,
                interval_ms: interval.as_millis() as u64,
            });
        }
        Ok(1)
    }
}

/// Per-device I/O frame shared by every implicit cycle.
struct IoTemplate {
    params: Option<ConnectionParams>,
    payload: Vec<u8>,
    heartbeat_byte: Option<usize>,
}

impl IoTemplate {
    fn from_config(config: &DeviceConfig) -> Result<Self, BuilderError> {
        let ot = config.assembly(AssemblyDirection::OriginatorToTarget);
        let to = config.assembly(AssemblyDirection::TargetToOriginator);
        if ot.is_none() && to.is_none() {
            return Ok(Self {
                params: None,
                payload: Vec::new(),
                heartbeat_byte: None,
            });
        }

        let params = ConnectionParams::from_sizes(
            ot.map(|a| a.size_bytes()).unwrap_or(0),
            to.map(|a| a.size_bytes()).unwrap_or(0),
        );
        let Some(ot) = ot else {
            return Ok(Self {
                params: Some(params),
                payload: Vec::new(),
                heartbeat_byte: None,
            });
        };

        let frame = AssemblyFrame::new(compute_layout(ot)?);
        let heartbeat_byte = ot
            .heartbeat
            .as_deref()
            .and_then(|id| frame.layout().entry(id))
            .map(|entry| (entry.offset_bits / 8) as usize);
        Ok(Self {
            params: Some(params),
            payload: frame.into_bytes(),
            heartbeat_byte,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::validate_text;
    use std::path::Path;

    const MANIFEST: &str = r#"<device vendor_id="1" product_code="2" revision="1.0" name="Unit">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw" default="0x10"/>
    <attribute id="4" type="uint" access="ro"/>
  </object>
  <object class="0x04" instance="101">
    <attribute id="1" type="real" access="ro" exercise="true"/>
  </object>
  <connection name="io" producer="0x04:101" consumer="0x04:100" type="point_to_point" trigger="cyclic"/>
  <assembly id="AS_OT" subtype="OT_EO" size="16" heartbeat="alive">
    <usint id="alive" offset="8"/>
  </assembly>
</device>"#;

    fn config() -> DeviceConfig {
        validate_text(Path::new("unit.xml"), MANIFEST).unwrap().config
    }

    #[test]
    fn test_ordering_follows_declaration() {
        let plan = PlanBuilder::with_duration(Duration::from_millis(50))
            .build(&config())
            .unwrap();
        let labels: Vec<String> = plan.events().iter().map(|e| e.label()).collect();
        assert_eq!(
            labels,
            vec![
                "set 0x04:100/3",
                "get 0x04:100/3",
                "io 'io' 5x10ms",
                "set 0x04:101/1",
                "get 0x04:101/1",
            ]
        );
        let ids: Vec<u32> = plan.events().iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_get_expects_written_value() {
        let plan = PlanBuilder::default().build(&config()).unwrap();
        let EventKind::Explicit(get) = &plan.events()[1].kind else {
            panic!("expected explicit request");
        };
        assert_eq!(get.service, ServiceCode::GetAttributeSingle);
        assert_eq!(get.expected.as_deref(), Some(&[0x10u8][..]));
    }

    #[test]
    fn test_default_duration_gives_at_least_one_cycle() {
        let mut config = config();
        config.connections[0].rpi = Duration::from_secs(5);
        let plan = PlanBuilder::default().build(&config).unwrap();
        let EventKind::Implicit(cycle) = &plan.events()[2].kind else {
            panic!("expected implicit cycle");
        };
        assert_eq!(cycle.cycles, 1);
    }

    #[test]
    fn test_explicit_short_duration_is_an_error() {
        let err = PlanBuilder::with_duration(Duration::from_millis(5))
            .build(&config())
            .unwrap_err();
        assert!(matches!(err, BuilderError::ZeroCycles { .. }));
    }

    #[test]
    fn test_io_template_from_assembly() {
        let plan = PlanBuilder::default().build(&config()).unwrap();
        let EventKind::Implicit(cycle) = &plan.events()[2].kind else {
            panic!("expected implicit cycle");
        };
        assert_eq!(cycle.payload, vec![0, 0]);
        assert_eq!(cycle.heartbeat_byte, Some(1));
        assert_eq!(
            cycle.params,
            Some(ConnectionParams::from_sizes(2, 0))
        );
    }
}

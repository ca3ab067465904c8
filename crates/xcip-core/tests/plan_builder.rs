//! Traffic plan construction properties.

use std::path::Path;
use std::time::Duration;

use xcip_core::manifest::validate_text;
use xcip_core::plan::{EventKind, PlanBuilder, ServiceCode};
use xcip_core::DeviceConfig;

fn manifest(connections: usize, attributes: usize) -> String {
    let mut text = String::from(
        r#"<device vendor_id="1" product_code="2" revision="1.0">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
"#,
    );
    for instance in 1..=2u16 {
        text.push_str(&format!(r#"  <object class="4" instance="{instance}">"#));
        for id in 1..=attributes as u16 {
            if instance == 1 {
                text.push_str(&format!(r#"<attribute id="{id}" type="dint" access="rw"/>"#));
            }
        }
        text.push_str("</object>\n");
    }
    for n in 0..connections {
        text.push_str(&format!(
            r#"  <connection name="c{n}" producer="4:{}" consumer="4:1" type="multicast" trigger="cyclic"/>
"#,
            1 + n % 2
        ));
    }
    text.push_str("</device>");
    text
}

fn config(connections: usize, attributes: usize) -> DeviceConfig {
    validate_text(Path::new("gen.xml"), &manifest(connections, attributes))
        .unwrap()
        .config
}

#[test]
fn test_event_counts_follow_declarations() {
    for (n, m) in [(0, 0), (1, 2), (3, 1), (4, 5)] {
        let plan = PlanBuilder::default().build(&config(n, m)).unwrap();
        assert_eq!(plan.implicit_count(), n, "connections={n} attributes={m}");
        assert_eq!(plan.explicit_count(), 2 * m, "connections={n} attributes={m}");
    }
}

#[test]
fn test_builds_are_deterministic() {
    let config = config(3, 4);
    let builder = PlanBuilder::with_duration(Duration::from_millis(100));
    assert_eq!(builder.build(&config).unwrap(), builder.build(&config).unwrap());
}

#[test]
fn test_set_precedes_get_for_each_attribute() {
    let plan = PlanBuilder::default().build(&config(0, 3)).unwrap();
    let services: Vec<ServiceCode> = plan
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Explicit(req) => Some(req.service),
            EventKind::Implicit(_) => None,
        })
        .collect();
    for pair in services.chunks(2) {
        assert_eq!(
            pair,
            [ServiceCode::SetAttributeSingle, ServiceCode::GetAttributeSingle]
        );
    }
}

#[test]
fn test_cycle_count_is_duration_over_interval() {
    let plan = PlanBuilder::with_duration(Duration::from_millis(55))
        .build(&config(1, 0))
        .unwrap();
    let EventKind::Implicit(cycle) = &plan.events()[0].kind else {
        panic!("expected implicit cycle");
    };
    assert_eq!(cycle.cycles, 5);
    assert_eq!(cycle.interval, Duration::from_millis(10));
}

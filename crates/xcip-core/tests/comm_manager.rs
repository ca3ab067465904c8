//! Comm manager behaviour against scripted device faults.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use xcip_core::comm::{cancellation, CancelSignal, CommManager, CommSettings, ConnectionState};
use xcip_core::fakes::{ScriptedTransport, SimulatedDevice};
use xcip_core::manifest::validate_text;
use xcip_core::plan::PlanBuilder;
use xcip_core::report::{EventReport, Outcome, RunReport};
use xcip_core::transport::CipRequest;
use xcip_core::{DeviceConfig, TrafficPlan};

const DEVICE: &str = r#"<device vendor_id="1" product_code="2" revision="1.0" name="Bench">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw" default="0x10"/>
    <attribute id="4" type="uint" access="rw" default="7"/>
  </object>
  <connection name="io" producer="0x04:100" consumer="0x04:100" type="point_to_point" trigger="cyclic"/>
</device>"#;

fn setup(duration_ms: u64) -> (DeviceConfig, TrafficPlan) {
    let config = validate_text(Path::new("bench.xml"), DEVICE).unwrap().config;
    let plan = PlanBuilder::with_duration(Duration::from_millis(duration_ms))
        .build(&config)
        .unwrap();
    (config, plan)
}

fn scripted(config: &DeviceConfig) -> ScriptedTransport {
    ScriptedTransport::new(Arc::new(SimulatedDevice::new(config)))
}

fn implicit(run: &RunReport) -> &EventReport {
    run.events.iter().find(|e| e.implicit).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_every_third_request_times_out_once() {
    let (config, plan) = setup(50);
    let transport = Arc::new(scripted(&config).timeout_every(3));
    let run = CommManager::new(transport.clone())
        .execute(&plan, CancelSignal::never())
        .await;

    // set 3, get 3, set 4 (silent, retried), get 4
    let explicit: Vec<_> = run.events.iter().filter(|e| !e.implicit).collect();
    let attempts: Vec<u32> = explicit.iter().map(|e| e.attempts).collect();
    assert_eq!(attempts, vec![1, 1, 2, 1]);
    assert!(explicit.iter().all(|e| e.outcome == Outcome::Success));
    assert_eq!(transport.service_requests(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_without_retries_a_timeout_is_final() {
    let (config, plan) = setup(50);
    let transport = Arc::new(scripted(&config).timeout_every(3));
    let settings = CommSettings {
        explicit_retries: 0,
        ..CommSettings::default()
    };
    let run = CommManager::new(transport)
        .with_settings(settings)
        .execute(&plan, CancelSignal::never())
        .await;

    let outcomes: Vec<&Outcome> = run
        .events
        .iter()
        .filter(|e| !e.implicit)
        .map(|e| &e.outcome)
        .collect();
    assert_eq!(outcomes[2], &Outcome::Timeout { attempts: 1 });
    assert!(!run.passed());
}

#[tokio::test(start_paused = true)]
async fn test_connection_reestablishes_once() {
    let (config, plan) = setup(100);
    let transport = Arc::new(scripted(&config).silent_io("io", 2..6));
    let run = CommManager::new(transport.clone())
        .execute(&plan, CancelSignal::never())
        .await;

    let io = implicit(&run);
    assert_eq!(io.outcome, Outcome::Success, "{io:#?}");
    let stats = io.cycles.as_ref().unwrap();
    assert_eq!(stats.sent, 10);
    assert_eq!(stats.missed, 4);
    assert_eq!(stats.acknowledged, 6);
    assert!(stats.reestablished);
    assert_eq!(stats.final_state, ConnectionState::Closed);
    assert!(io.warnings.iter().any(|w| w.contains("re-established")));

    let forward_opens = transport
        .requests()
        .iter()
        .filter(|r| matches!(r, CipRequest::ForwardOpen { .. }))
        .count();
    assert_eq!(forward_opens, 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_timeout_fails_the_connection() {
    let (config, plan) = setup(100);
    let transport = Arc::new(scripted(&config).silent_io("io", 2..100));
    let run = CommManager::new(transport)
        .execute(&plan, CancelSignal::never())
        .await;

    let io = implicit(&run);
    match &io.outcome {
        Outcome::ConnectionFailed { detail } => assert!(detail.contains("timed out again"), "{detail}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(io.cycles.as_ref().unwrap().final_state, ConnectionState::Closed);
    // explicit traffic is unaffected
    assert_eq!(run.passed_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_refused_forward_open() {
    let (config, plan) = setup(50);
    let transport = Arc::new(scripted(&config).refuse_forward_open("io"));
    let run = CommManager::new(transport)
        .execute(&plan, CancelSignal::never())
        .await;

    let io = implicit(&run);
    assert!(matches!(io.outcome, Outcome::ConnectionFailed { .. }));
    assert_eq!(io.cycles.as_ref().unwrap().sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_channels_fail_every_event() {
    let (config, plan) = setup(50);
    let transport = Arc::new(scripted(&config).refuse_open());
    let run = CommManager::new(transport)
        .execute(&plan, CancelSignal::never())
        .await;

    assert_eq!(run.events.len(), 5);
    assert_eq!(run.failed_count(), 5);
    assert!(run
        .events
        .iter()
        .filter(|e| !e.implicit)
        .all(|e| matches!(e.outcome, Outcome::TransportError { .. })));
    assert!(matches!(implicit(&run).outcome, Outcome::ConnectionFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_run_keeps_partial_results() {
    let (config, plan) = setup(1000);
    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.cancel();
    });

    let run = CommManager::new(Arc::new(SimulatedDevice::new(&config)))
        .execute(&plan, signal)
        .await;

    assert!(run.cancelled);
    assert_eq!(run.events.len(), 5);
    assert!(run
        .events
        .iter()
        .filter(|e| !e.implicit)
        .all(|e| e.outcome == Outcome::Success));

    let io = implicit(&run);
    assert_eq!(io.outcome, Outcome::Cancelled);
    let stats = io.cycles.as_ref().unwrap();
    assert!(stats.sent > 0 && stats.sent < stats.planned, "{stats:?}");
    assert_eq!(stats.final_state, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_misses_the_override_timeout() {
    let (config, plan) = setup(50);
    let device = Arc::new(SimulatedDevice::new(&config).with_latency(Duration::from_millis(30)));
    let settings = CommSettings {
        timeout_override: Some(Duration::from_millis(20)),
        ..CommSettings::default()
    };
    let run = CommManager::new(device)
        .with_settings(settings)
        .execute(&plan, CancelSignal::never())
        .await;

    let explicit: Vec<_> = run.events.iter().filter(|e| !e.implicit).collect();
    assert_eq!(explicit.len(), 4);
    assert!(explicit
        .iter()
        .all(|e| e.outcome == Outcome::Timeout { attempts: 2 }));
}

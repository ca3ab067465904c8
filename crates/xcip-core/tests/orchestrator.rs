//! End-to-end sessions over in-memory manifests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use xcip_core::domain::{SemanticError, Violation};
use xcip_core::fakes::{GeneratorCommand, MemoryConfigSource, RecordingGenerator};
use xcip_core::orchestration::{FileStatus, Orchestrator, SilentProgress};
use xcip_core::report::Outcome;
use xcip_core::settings::RunSettings;
use xcip_core::waveform::{TriggerEvent, WaveShape, WaveformParams};

fn manifest(rpi_ms: u64) -> String {
    format!(
        r#"<device vendor_id="0x0001" product_code="7" revision="2.1" name="Drive">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="0x04" instance="100">
    <attribute id="3" type="usint" access="rw" default="1"/>
    <attribute id="4" type="int" access="rw" default="-20"/>
  </object>
  <connection name="io" producer="0x04:100" consumer="0x04:100" rpi_ms="{rpi_ms}" type="point_to_point" trigger="cyclic"/>
</device>"#
    )
}

fn orchestrator(text: String) -> Orchestrator {
    let source = MemoryConfigSource::new().with_file("conf/drive.xml", text);
    Orchestrator::simulated(Arc::new(source))
        .with_progress(Arc::new(SilentProgress))
        .with_settings(RunSettings::default().with_duration(Duration::from_millis(50)))
}

fn square() -> WaveformParams {
    WaveformParams::new(WaveShape::Square { duty: 0.5 }, 0.0, 5.0, Duration::from_millis(20)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_clean_device_passes_end_to_end() {
    let session = orchestrator(manifest(10))
        .run(Path::new("conf/drive.xml"))
        .await
        .unwrap();

    assert_eq!(session.files.len(), 1);
    assert_eq!(session.exit_code(), 0);
    let run = session.files[0].run().unwrap();
    assert_eq!(run.events.len(), 5);
    assert_eq!(run.events.iter().filter(|e| e.implicit).count(), 1);
    assert_eq!(run.passed_count(), 5);
    assert_eq!(run.warning_count(), 0);
    let io = run.events.iter().find(|e| e.implicit).unwrap();
    assert_eq!(io.cycles.as_ref().unwrap().sent, 5);
}

#[tokio::test(start_paused = true)]
async fn test_fast_connection_is_excluded_not_fatal() {
    let session = orchestrator(manifest(3))
        .run(Path::new("conf/drive.xml"))
        .await
        .unwrap();

    let file = &session.files[0];
    let FileStatus::Executed {
        violations,
        excluded_connections,
        run,
    } = &file.status
    else {
        panic!("expected an executed run, got {:?}", file.status);
    };
    assert_eq!(violations.len(), 1);
    assert!(matches!(
        &violations[0],
        Violation::Semantic(SemanticError::IntervalBelowMinimum { rpi_ms: 3, min_rpi_ms: 5, .. })
    ));
    assert_eq!(excluded_connections, &vec!["io".to_string()]);
    assert_eq!(run.events.len(), 4);
    assert!(run.events.iter().all(|e| !e.implicit && e.outcome == Outcome::Success));
    // violations still fail the file
    assert_eq!(session.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_generator_sees_burst_boundaries() {
    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = orchestrator(manifest(10));
    let settings = orchestrator.settings().clone().with_waveform(square());
    let session = orchestrator
        .with_settings(settings)
        .with_generator(generator.clone())
        .run(Path::new("conf/drive.xml"))
        .await
        .unwrap();

    assert_eq!(session.exit_code(), 0);
    assert_eq!(
        generator.commands(),
        vec![
            GeneratorCommand::Configure(square()),
            GeneratorCommand::Trigger(TriggerEvent::BurstStart {
                connection: "io".to_string(),
                cycles: 5,
                interval: Duration::from_millis(10),
            }),
            GeneratorCommand::Trigger(TriggerEvent::BurstStop {
                connection: "io".to_string(),
            }),
            GeneratorCommand::Stop,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_generator_only_warns() {
    let orchestrator = orchestrator(manifest(10));
    let settings = orchestrator.settings().clone().with_waveform(square());
    let session = orchestrator
        .with_settings(settings)
        .with_generator(Arc::new(RecordingGenerator::unreachable()))
        .run(Path::new("conf/drive.xml"))
        .await
        .unwrap();

    assert_eq!(session.exit_code(), 0);
    let run = session.files[0].run().unwrap();
    assert_eq!(run.failed_count(), 0);
    assert!(run.warnings[0].starts_with("waveform: configure failed"));
    assert!(run.warnings.iter().any(|w| w.starts_with("waveform: stop failed")));
    let io = run.events.iter().find(|e| e.implicit).unwrap();
    assert_eq!(io.warnings.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_directory_session_reports_each_file() {
    let source = MemoryConfigSource::new()
        .with_file("conf/a.xml", manifest(10))
        .with_file("conf/b.xml", "<device>")
        .with_file("conf/readme.txt", "not a manifest");
    let session = Orchestrator::simulated(Arc::new(source))
        .with_progress(Arc::new(SilentProgress))
        .with_settings(RunSettings::default().with_duration(Duration::from_millis(30)))
        .run(Path::new("conf"))
        .await
        .unwrap();

    assert_eq!(session.files.len(), 2);
    assert!(session.files[0].passed());
    assert!(matches!(session.files[1].status, FileStatus::Malformed { .. }));
    assert_eq!(session.passed_count(), 1);
    assert_eq!(session.exit_code(), 1);
}

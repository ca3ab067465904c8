//! XCIP Core Library
//!
//! Validates CIP XML device manifests and exercises the described devices
//! with simulated explicit and implicit messaging, optionally correlated
//! with waveform generator triggers.

pub mod comm;
pub mod domain;
pub mod fakes;
pub mod layout;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod orchestration;
pub mod paths;
pub mod plan;
pub mod report;
pub mod reporting;
pub mod settings;
pub mod telemetry;
pub mod transport;
pub mod waveform;

pub use comm::{
    cancellation, CancelHandle, CancelSignal, CommManager, CommObserver, CommSettings,
    ConnectionState, NoopObserver,
};
pub use domain::{
    BuilderError, ConfigError, DeviceConfig, Result, SemanticError, SettingsError,
    StructuralError, TransportError, Violation, WaveformError, XcipError,
};
pub use layout::{compute_layout, AssemblyFrame, AssemblyLayout, ConnectionParams};
pub use manifest::{load_path, validate_text, ConfigSource, FsConfigSource, ValidatedManifest};
pub use orchestration::{
    FileReport, FileStatus, Orchestrator, ProgressEvent, ProgressSink, SessionReport,
    SilentProgress, TracingProgress,
};
pub use plan::{EventId, EventKind, PlanBuilder, PlanOptions, TrafficEvent, TrafficPlan};
pub use report::{EventReport, Outcome, RunReport};
pub use settings::RunSettings;
pub use transport::{ChannelId, CipRequest, CipResponse, Transport};
pub use waveform::{SoftwareGenerator, TriggerEvent, WaveShape, WaveformDriver, WaveformGenerator, WaveformParams};
pub use telemetry::init_tracing;

//! End-to-end session orchestration.
//!
//! One session takes a manifest path (file or directory) through:
//! - validation of every manifest, siblings unaffected by each other's errors
//! - plan construction per valid device
//! - plan execution, one device at a time, with optional waveform driving
//!
//! Presentation hangs off [`ProgressSink`]; the orchestrator never prints.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::comm::{cancellation, CancelHandle, CancelSignal, CommManager, CommObserver};
use crate::domain::{ConfigError, DeviceConfig, SettingsError, Violation};
use crate::fakes::SimulatedDevice;
use crate::manifest::{load_path, ConfigSource, ValidatedManifest};
use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{PlanBuilder, TrafficEvent, TrafficPlan};
use crate::report::{Outcome, RunReport};
use crate::settings::RunSettings;
use crate::transport::Transport;
use crate::waveform::{SoftwareGenerator, WaveformDriver, WaveformGenerator};

/// Builds the transport used for one validated device.
pub type TransportFactory = Arc<dyn Fn(&DeviceConfig) -> Arc<dyn Transport> + Send + Sync>;

/// Progress notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "progress", rename_all = "snake_case")]
pub enum ProgressEvent {
    ManifestAccepted {
        path: PathBuf,
        violations: usize,
        excluded_connections: Vec<String>,
    },
    ManifestRejected {
        path: PathBuf,
        reason: String,
    },
    PlanBuilt {
        path: PathBuf,
        implicit: usize,
        explicit: usize,
    },
    EventStarted {
        label: String,
    },
    EventFinished {
        label: String,
        outcome: String,
    },
    RunFinished {
        path: PathBuf,
        passed: usize,
        failed: usize,
    },
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ManifestRejected { path, reason } => {
                warn!(path = %path.display(), reason = %reason, "manifest rejected")
            }
            other => info!(progress = ?other, "progress"),
        }
    }
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// What happened to one manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    /// Not well-formed XML.
    Malformed { violations: Vec<Violation> },
    /// Violations that leave no runnable configuration.
    Invalid { violations: Vec<Violation> },
    /// The path could not be read or named no manifests.
    Unreadable { reason: String },
    /// Valid, but no plan could be built.
    PlanFailed {
        violations: Vec<Violation>,
        reason: String,
    },
    Executed {
        violations: Vec<Violation>,
        excluded_connections: Vec<String>,
        run: RunReport,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub digest: Option<String>,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileReport {
    /// Clean validation and a fully passing run.
    pub fn passed(&self) -> bool {
        match &self.status {
            FileStatus::Executed {
                violations, run, ..
            } => violations.is_empty() && run.passed(),
            _ => false,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match &self.status {
            FileStatus::Malformed { violations }
            | FileStatus::Invalid { violations }
            | FileStatus::PlanFailed { violations, .. }
            | FileStatus::Executed { violations, .. } => violations,
            FileStatus::Unreadable { .. } => &[],
        }
    }

    pub fn run(&self) -> Option<&RunReport> {
        match &self.status {
            FileStatus::Executed { run, .. } => Some(run),
            _ => None,
        }
    }
}

/// Outcome of one session over a manifest path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub input: PathBuf,
    pub files: Vec<FileReport>,
}

impl SessionReport {
    pub fn passed_count(&self) -> usize {
        self.files.iter().filter(|f| f.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.files.len() - self.passed_count()
    }

    pub fn has_failures(&self) -> bool {
        self.files.is_empty() || self.failed_count() > 0
    }

    /// Process exit status: 0 on a clean session, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }
}

/// Drives validation, planning and execution.
pub struct Orchestrator {
    source: Arc<dyn ConfigSource>,
    transports: TransportFactory,
    generator: Option<Arc<dyn WaveformGenerator>>,
    progress: Arc<dyn ProgressSink>,
    settings: RunSettings,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn ConfigSource>, transports: TransportFactory) -> Self {
        let (cancel, signal) = cancellation();
        Self {
            source,
            transports,
            generator: None,
            progress: Arc::new(TracingProgress),
            settings: RunSettings::default(),
            cancel,
            signal,
        }
    }

    /// Every device is served by an in-process [`SimulatedDevice`].
    pub fn simulated(source: Arc<dyn ConfigSource>) -> Self {
        Self::new(
            source,
            Arc::new(|config: &DeviceConfig| -> Arc<dyn Transport> {
                Arc::new(SimulatedDevice::new(config))
            }),
        )
    }

    pub fn with_generator(mut self, generator: Arc<dyn WaveformGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Handle that stops the session's current and remaining runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Validate every manifest under `path` without running anything.
    pub fn validate(&self, path: &Path) -> Vec<Result<ValidatedManifest, ConfigError>> {
        let results = load_path(self.source.as_ref(), path);
        for result in &results {
            METRICS.inc_manifests();
            self.report_validation(result);
        }
        results
    }

    /// Run a full session.
    ///
    /// Fails only when the settings are unusable; every per-file problem is
    /// part of the returned report.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn run(&self, path: &Path) -> Result<SessionReport, SettingsError> {
        self.settings.validate()?;

        let mut files = Vec::new();
        for result in self.validate(path) {
            let report = match result {
                Ok(manifest) => self.run_manifest(manifest).await,
                Err(error) => rejected(error),
            };
            files.push(report);
        }

        Ok(SessionReport {
            input: path.to_path_buf(),
            files,
        })
    }

    /// Build the plan a validated manifest would run.
    pub fn plan(&self, manifest: &ValidatedManifest) -> Result<TrafficPlan, crate::domain::BuilderError> {
        PlanBuilder::new(self.settings.plan_options()).build(&manifest.config)
    }

    async fn run_manifest(&self, manifest: ValidatedManifest) -> FileReport {
        let plan = match self.plan(&manifest) {
            Ok(plan) => plan,
            Err(e) => {
                self.progress.on_progress(&ProgressEvent::ManifestRejected {
                    path: manifest.path.clone(),
                    reason: e.to_string(),
                });
                return FileReport {
                    path: manifest.path,
                    digest: Some(manifest.digest),
                    status: FileStatus::PlanFailed {
                        violations: manifest.violations,
                        reason: e.to_string(),
                    },
                };
            }
        };
        obs::emit_plan_built(&plan.device, plan.implicit_count(), plan.explicit_count());
        self.progress.on_progress(&ProgressEvent::PlanBuilt {
            path: manifest.path.clone(),
            implicit: plan.implicit_count(),
            explicit: plan.explicit_count(),
        });

        let run = self.execute(&manifest.config, &plan).await;
        self.progress.on_progress(&ProgressEvent::RunFinished {
            path: manifest.path.clone(),
            passed: run.passed_count(),
            failed: run.failed_count(),
        });

        FileReport {
            path: manifest.path,
            digest: Some(manifest.digest),
            status: FileStatus::Executed {
                violations: manifest.violations,
                excluded_connections: manifest.excluded_connections,
                run,
            },
        }
    }

    /// Execute one plan, driving the waveform generator around it when
    /// configured.
    pub async fn execute(&self, config: &DeviceConfig, plan: &TrafficPlan) -> RunReport {
        let transport = (self.transports)(config);
        let driver = self.settings.waveform.map(|params| {
            let generator = self
                .generator
                .clone()
                .unwrap_or_else(|| Arc::new(SoftwareGenerator::new()));
            Arc::new(WaveformDriver::new(generator, params).with_explicit_markers(self.settings.mark_explicit))
        });

        let mut run_warnings = Vec::new();
        if let Some(driver) = &driver {
            if let Err(e) = driver.start().await {
                run_warnings.push(format!("waveform: configure failed: {e}"));
            }
        }

        let relay = ProgressRelay {
            waveform: driver.clone(),
            progress: Arc::clone(&self.progress),
        };
        let manager = CommManager::new(transport)
            .with_observer(Arc::new(relay))
            .with_settings(self.settings.comm_settings());
        let mut run = manager.execute(plan, self.signal.clone()).await;

        if let Some(driver) = &driver {
            if let Err(e) = driver.finish().await {
                run_warnings.push(format!("waveform: stop failed: {e}"));
            }
        }
        for warning in &run_warnings {
            obs::emit_waveform_warning(&run.run_id.to_string(), warning);
        }
        run_warnings.append(&mut run.warnings);
        run.warnings = run_warnings;
        run
    }

    fn report_validation(&self, result: &Result<ValidatedManifest, ConfigError>) {
        match result {
            Ok(manifest) => {
                obs::emit_manifest_validated(
                    &manifest.path.display().to_string(),
                    manifest.violations.len(),
                    manifest.excluded_connections.len(),
                );
                self.progress.on_progress(&ProgressEvent::ManifestAccepted {
                    path: manifest.path.clone(),
                    violations: manifest.violations.len(),
                    excluded_connections: manifest.excluded_connections.clone(),
                });
            }
            Err(error) => {
                obs::emit_manifest_rejected(&error.path().display().to_string(), error);
                self.progress.on_progress(&ProgressEvent::ManifestRejected {
                    path: error.path().to_path_buf(),
                    reason: error.to_string(),
                });
            }
        }
    }
}

fn rejected(error: ConfigError) -> FileReport {
    let path = error.path().to_path_buf();
    let status = match &error {
        ConfigError::Malformed { .. } => FileStatus::Malformed {
            violations: error.violations(),
        },
        ConfigError::Invalid { violations, .. } => FileStatus::Invalid {
            violations: violations.clone(),
        },
        other => FileStatus::Unreadable {
            reason: other.to_string(),
        },
    };
    FileReport {
        path,
        digest: None,
        status,
    }
}

/// Forwards execution events to the waveform driver and the progress sink.
struct ProgressRelay {
    waveform: Option<Arc<WaveformDriver>>,
    progress: Arc<dyn ProgressSink>,
}

#[async_trait]
impl CommObserver for ProgressRelay {
    async fn before_event(&self, event: &TrafficEvent) -> Vec<String> {
        self.progress.on_progress(&ProgressEvent::EventStarted {
            label: event.label(),
        });
        match &self.waveform {
            Some(driver) => driver.before_event(event).await,
            None => Vec::new(),
        }
    }

    async fn after_event(&self, event: &TrafficEvent, outcome: &Outcome) -> Vec<String> {
        let warnings = match &self.waveform {
            Some(driver) => driver.after_event(event, outcome).await,
            None => Vec::new(),
        };
        self.progress.on_progress(&ProgressEvent::EventFinished {
            label: event.label(),
            outcome: outcome.label().to_string(),
        });
        warnings
    }
}

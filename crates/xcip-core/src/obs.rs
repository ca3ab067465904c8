//! Structured lifecycle events for validation and traffic runs.
//!
//! Every function emits one `info!` (or `warn!`) event with an `event` field
//! so log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard entering a run-scoped span.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, device: &str) -> Self {
        Self {
            _span: Self::span(run_id, device).entered(),
        }
    }

    /// The run span without entering it, for instrumenting spawned tasks.
    pub fn span(run_id: &str, device: &str) -> tracing::Span {
        tracing::info_span!("xcip.run", run_id = %run_id, device = %device)
    }
}

pub fn emit_manifest_validated(path: &str, violations: usize, excluded: usize) {
    info!(
        event = "manifest.validated",
        path = %path,
        violations = violations,
        excluded_connections = excluded,
    );
}

pub fn emit_manifest_rejected(path: &str, error: &dyn std::fmt::Display) {
    warn!(event = "manifest.rejected", path = %path, error = %error);
}

pub fn emit_plan_built(device: &str, implicit: usize, explicit: usize) {
    info!(
        event = "plan.built",
        device = %device,
        implicit = implicit,
        explicit = explicit,
    );
}

pub fn emit_run_started(run_id: &str, device: &str, events: usize) {
    info!(event = "run.started", run_id = %run_id, device = %device, events = events);
}

pub fn emit_event_completed(run_id: &str, event_id: u32, label: &str, outcome: &str) {
    info!(
        event = "run.event_completed",
        run_id = %run_id,
        event_id = event_id,
        label = %label,
        outcome = %outcome,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, passed: usize, failed: usize, cancelled: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        passed = passed,
        failed = failed,
        cancelled = cancelled,
    );
}

pub fn emit_waveform_warning(run_id: &str, warning: &str) {
    warn!(event = "waveform.warning", run_id = %run_id, warning = %warning);
}

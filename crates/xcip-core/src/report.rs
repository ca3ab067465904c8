//! Run reports and the accumulator comm tasks write into.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::comm::state::ConnectionState;
use crate::domain::ObjectRef;
use crate::plan::{EventId, TrafficPlan};

/// Result of one traffic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// No response after every allowed attempt.
    Timeout { attempts: u32 },
    /// The device answered with an error or an unexpected payload.
    ProtocolError { detail: String },
    TransportError { detail: String },
    /// An implicit connection could not be kept alive.
    ConnectionFailed { detail: String },
    /// The run was cancelled before the event finished.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Timeout { .. } => "timeout",
            Outcome::ProtocolError { .. } => "protocol error",
            Outcome::TransportError { .. } => "transport error",
            Outcome::ConnectionFailed { .. } => "connection failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Cycle accounting for an implicit connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub planned: u32,
    pub sent: u32,
    pub acknowledged: u32,
    pub missed: u32,
    pub max_jitter_us: u64,
    pub mean_jitter_us: u64,
    /// Cycles whose start deviated from schedule beyond tolerance.
    pub late_cycles: u32,
    pub reestablished: bool,
    pub final_state: ConnectionState,
}

/// Report entry for one traffic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    pub event_id: EventId,
    pub label: String,
    pub object: ObjectRef,
    pub implicit: bool,
    pub outcome: Outcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub cycles: Option<CycleStats>,
    pub warnings: Vec<String>,
}

/// Aggregate counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
}

/// Outcome of executing one traffic plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub device: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Warnings not tied to a single event.
    pub warnings: Vec<String>,
    pub events: Vec<EventReport>,
}

impl RunReport {
    pub fn passed_count(&self) -> usize {
        self.events.iter().filter(|e| e.outcome.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.events.len() - self.passed_count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len() + self.events.iter().map(|e| e.warnings.len()).sum::<usize>()
    }

    pub fn passed(&self) -> bool {
        !self.cancelled && self.failed_count() == 0
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            total: self.events.len(),
            passed: self.passed_count(),
            failed: self.failed_count(),
            warnings: self.warning_count(),
        }
    }

    pub fn event(&self, id: EventId) -> Option<&EventReport> {
        self.events.iter().find(|e| e.event_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("event {0} is not part of this run")]
    UnknownEvent(EventId),

    #[error("event {0} already has an outcome")]
    AlreadyRecorded(EventId),
}

#[derive(Debug)]
struct Slot {
    label: String,
    object: ObjectRef,
    implicit: bool,
    warnings: Vec<String>,
    entry: Option<EventReport>,
}

/// Collects event outcomes from concurrent comm tasks.
///
/// Each event gets exactly one outcome; events never recorded are reported
/// as cancelled when the run finishes.
#[derive(Debug)]
pub struct ReportAccumulator {
    slots: Mutex<BTreeMap<EventId, Slot>>,
    run_warnings: Mutex<Vec<String>>,
}

impl ReportAccumulator {
    pub fn new(plan: &TrafficPlan) -> Self {
        let slots = plan
            .events()
            .iter()
            .map(|event| {
                (
                    event.id,
                    Slot {
                        label: event.label(),
                        object: event.object,
                        implicit: event.is_implicit(),
                        warnings: Vec::new(),
                        entry: None,
                    },
                )
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            run_warnings: Mutex::new(Vec::new()),
        }
    }

    /// Attach a warning to an event, recorded or not.
    pub fn warn(&self, id: EventId, warning: impl Into<String>) -> Result<(), ReportError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(&id).ok_or(ReportError::UnknownEvent(id))?;
        let warning = warning.into();
        match slot.entry.as_mut() {
            Some(entry) => entry.warnings.push(warning),
            None => slot.warnings.push(warning),
        }
        Ok(())
    }

    /// Attach a warning to the run as a whole.
    pub fn warn_run(&self, warning: impl Into<String>) {
        self.run_warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(warning.into());
    }

    /// Record an event's outcome. Fails if it was already recorded.
    pub fn record(&self, mut entry: EventReport) -> Result<(), ReportError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .get_mut(&entry.event_id)
            .ok_or(ReportError::UnknownEvent(entry.event_id))?;
        if slot.entry.is_some() {
            return Err(ReportError::AlreadyRecorded(entry.event_id));
        }
        let mut warnings = std::mem::take(&mut slot.warnings);
        warnings.append(&mut entry.warnings);
        entry.warnings = warnings;
        slot.entry = Some(entry);
        Ok(())
    }

    /// Build the final report, in event order.
    pub fn finish(
        &self,
        run_id: Uuid,
        device: impl Into<String>,
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> RunReport {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let events = slots
            .iter_mut()
            .map(|(id, slot)| match slot.entry.take() {
                Some(entry) => entry,
                None => EventReport {
                    event_id: *id,
                    label: slot.label.clone(),
                    object: slot.object,
                    implicit: slot.implicit,
                    outcome: Outcome::Cancelled,
                    attempts: 0,
                    elapsed_ms: 0,
                    cycles: None,
                    warnings: std::mem::take(&mut slot.warnings),
                },
            })
            .collect();
        let warnings = std::mem::take(&mut *self.run_warnings.lock().unwrap_or_else(|e| e.into_inner()));

        RunReport {
            run_id,
            device: device.into(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            warnings,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanBuilder;
    use crate::manifest::validate_text;
    use std::path::Path;

    fn plan() -> TrafficPlan {
        let manifest = validate_text(
            Path::new("unit.xml"),
            r#"<device vendor_id="1" product_code="2" revision="1.0">
  <timing rpi_ms="10" timeout_ms="100" min_rpi_ms="5"/>
  <object class="4" instance="1"><attribute id="1" type="usint" access="rw"/></object>
</device>"#,
        )
        .unwrap();
        PlanBuilder::default().build(&manifest.config).unwrap()
    }

    fn entry(id: u32, outcome: Outcome) -> EventReport {
        EventReport {
            event_id: EventId(id),
            label: "x".into(),
            object: ObjectRef::new(4, 1),
            implicit: false,
            outcome,
            attempts: 1,
            elapsed_ms: 1,
            cycles: None,
            warnings: vec![],
        }
    }

    #[test]
    fn record_once_per_event() {
        let acc = ReportAccumulator::new(&plan());
        acc.record(entry(0, Outcome::Success)).unwrap();
        assert_eq!(
            acc.record(entry(0, Outcome::Success)),
            Err(ReportError::AlreadyRecorded(EventId(0)))
        );
        assert_eq!(
            acc.record(entry(9, Outcome::Success)),
            Err(ReportError::UnknownEvent(EventId(9)))
        );
    }

    #[test]
    fn unrecorded_events_finish_as_cancelled() {
        let acc = ReportAccumulator::new(&plan());
        acc.warn(EventId(1), "generator unreachable").unwrap();
        acc.record(entry(0, Outcome::Success)).unwrap();
        let report = acc.finish(Uuid::new_v4(), "dev", Utc::now(), true);
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[1].outcome, Outcome::Cancelled);
        assert_eq!(report.events[1].warnings.len(), 1);
        assert_eq!(report.summary().passed, 1);
        assert!(!report.passed());
    }

    #[test]
    fn pending_warnings_merge_into_entry() {
        let acc = ReportAccumulator::new(&plan());
        acc.warn(EventId(0), "early").unwrap();
        let mut e = entry(0, Outcome::Success);
        e.warnings.push("late".into());
        acc.record(e).unwrap();
        acc.warn_run("run level");
        let report = acc.finish(Uuid::new_v4(), "dev", Utc::now(), false);
        assert_eq!(report.events[0].warnings, vec!["early", "late"]);
        assert_eq!(report.warning_count(), 3);
    }
}

//! Concurrent plan execution.
//!
//! Explicit requests of one object run sequentially in a single task; every
//! implicit connection gets its own task. A semaphore bounds how many tasks
//! talk to the transport at once.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn, Instrument};
use uuid::Uuid;

use super::counters::{Heartbeat, SequenceCounter};
use super::state::{ConnectionState, ConnectionTracker, MissOutcome};
use super::{CancelSignal, CommObserver, NoopObserver};
use crate::domain::{ObjectRef, TransportError};
use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{EventKind, ExplicitRequest, ImplicitCycle, TrafficEvent, TrafficPlan};
use crate::report::{CycleStats, EventReport, Outcome, ReportAccumulator, RunReport};
use crate::transport::{status_name, ChannelId, CipRequest, CipResponse, Transport};

/// Upper bound on explicit retries.
pub const MAX_EXPLICIT_RETRIES: u32 = 3;

/// Tuning for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommSettings {
    /// Replaces the manifest's explicit response timeout.
    pub timeout_override: Option<Duration>,
    /// Extra attempts after an explicit request times out.
    pub explicit_retries: u32,
    /// Consecutive missed I/O responses tolerated before a time-out.
    pub miss_threshold: u32,
    /// Allowed lateness of a cycle, as a fraction of its interval.
    pub jitter_tolerance: f64,
    pub max_concurrent: usize,
}

impl Default for CommSettings {
    fn default() -> Self {
        Self {
            timeout_override: None,
            explicit_retries: 1,
            miss_threshold: 3,
            jitter_tolerance: 0.10,
            max_concurrent: 8,
        }
    }
}

/// Executes traffic plans against a transport.
pub struct CommManager {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn CommObserver>,
    settings: CommSettings,
}

impl CommManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            observer: Arc::new(NoopObserver),
            settings: CommSettings::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_settings(mut self, settings: CommSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &CommSettings {
        &self.settings
    }

    /// Run every event of `plan` and collect a report.
    ///
    /// Individual failures never stop the remaining events. When `cancel`
    /// fires, in-flight events finish as cancelled and events not yet
    /// started are reported as cancelled.
    #[instrument(skip(self, plan, cancel), fields(device = %plan.device, events = plan.len()))]
    pub async fn execute(&self, plan: &TrafficPlan, cancel: CancelSignal) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        obs::emit_run_started(&run_id.to_string(), &plan.device, plan.len());

        let report = Arc::new(ReportAccumulator::new(plan));
        let worker = Worker {
            transport: Arc::clone(&self.transport),
            observer: Arc::clone(&self.observer),
            report: Arc::clone(&report),
            settings: self.settings.clone(),
            timeout: self.settings.timeout_override.unwrap_or(plan.timeout),
            cancel: cancel.clone(),
            run_id: run_id.to_string(),
        };

        let (explicit, implicit) = partition(plan.events());

        let mut explicit_open = false;
        if !explicit.is_empty() {
            match self.transport.open(&ChannelId::Explicit).await {
                Ok(()) => explicit_open = true,
                Err(e) => {
                    warn!(error = %e, "explicit channel unavailable");
                    for event in explicit.iter().flat_map(|(_, events)| events) {
                        worker.record(
                            event,
                            Outcome::TransportError {
                                detail: format!("open explicit channel: {e}"),
                            },
                            0,
                            Duration::ZERO,
                            None,
                            Vec::new(),
                        );
                    }
                }
            }
        }

        let span = obs::RunSpan::span(&worker.run_id, &plan.device);
        let sem = Arc::new(tokio::sync::Semaphore::new(self.settings.max_concurrent.max(1)));
        let mut tasks = Vec::new();

        if explicit_open {
            for (object, events) in explicit {
                let worker = worker.clone();
                let sem = Arc::clone(&sem);
                tasks.push(tokio::spawn(
                    async move {
                        let _permit = sem.acquire_owned().await.ok();
                        debug!(object = %object, requests = events.len(), "explicit task started");
                        for event in &events {
                            if worker.cancel.is_cancelled() {
                                break;
                            }
                            if let EventKind::Explicit(request) = &event.kind {
                                worker.run_explicit(event, request).await;
                            }
                        }
                    }
                    .instrument(span.clone()),
                ));
            }
        }

        for event in implicit {
            let worker = worker.clone();
            let sem = Arc::clone(&sem);
            tasks.push(tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    if worker.cancel.is_cancelled() {
                        return;
                    }
                    if let EventKind::Implicit(cycle) = &event.kind {
                        worker.run_implicit(&event, cycle).await;
                    }
                }
                .instrument(span.clone()),
            ));
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "comm task aborted");
                report.warn_run(format!("comm task aborted: {e}"));
            }
        }

        if explicit_open {
            if let Err(e) = self.transport.close(&ChannelId::Explicit).await {
                debug!(error = %e, "explicit channel close failed");
            }
        }

        let run = report.finish(run_id, plan.device.clone(), started_at, cancel.is_cancelled());
        obs::emit_run_finished(
            &run_id.to_string(),
            clock.elapsed().as_millis() as u64,
            run.passed_count(),
            run.failed_count(),
            run.cancelled,
        );
        METRICS.flush();
        run
    }
}

/// Explicit events grouped per object in first-appearance order, and the
/// implicit events.
fn partition(events: &[TrafficEvent]) -> (Vec<(ObjectRef, Vec<TrafficEvent>)>, Vec<TrafficEvent>) {
    let mut explicit: Vec<(ObjectRef, Vec<TrafficEvent>)> = Vec::new();
    let mut implicit = Vec::new();
    for event in events {
        if event.is_implicit() {
            implicit.push(event.clone());
            continue;
        }
        match explicit.iter_mut().find(|(object, _)| *object == event.object) {
            Some((_, group)) => group.push(event.clone()),
            None => explicit.push((event.object, vec![event.clone()])),
        }
    }
    (explicit, implicit)
}

/// Shared handles cloned into every task.
#[derive(Clone)]
struct Worker {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn CommObserver>,
    report: Arc<ReportAccumulator>,
    settings: CommSettings,
    timeout: Duration,
    cancel: CancelSignal,
    run_id: String,
}

type SendResult = Result<Result<CipResponse, TransportError>, tokio::time::error::Elapsed>;

impl Worker {
    /// Send with a deadline, giving up early on cancellation.
    async fn send(&self, channel: &ChannelId, request: &CipRequest, wait: Duration) -> Option<SendResult> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(wait, self.transport.send(channel, request)) => Some(result),
        }
    }

    async fn run_explicit(&self, event: &TrafficEvent, request: &ExplicitRequest) {
        let started = Instant::now();
        let mut warnings = self.observer.before_event(event).await;
        let wire = CipRequest::Service {
            service: request.service,
            path: request.path,
            payload: request.payload.clone(),
        };
        let retries = self.settings.explicit_retries.min(MAX_EXPLICIT_RETRIES);

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            METRICS.inc_requests();
            let Some(sent) = self.send(&ChannelId::Explicit, &wire, self.timeout).await else {
                break Outcome::Cancelled;
            };
            match sent {
                Err(_) | Ok(Err(TransportError::Timeout { .. })) => {
                    METRICS.inc_timeouts();
                    if attempts <= retries {
                        METRICS.inc_retries();
                        debug!(event = %event.id, attempt = attempts, "explicit request timed out, retrying");
                        continue;
                    }
                    break Outcome::Timeout { attempts };
                }
                Ok(Err(e)) => {
                    break Outcome::TransportError {
                        detail: e.to_string(),
                    }
                }
                Ok(Ok(response)) => break check_response(request, &response),
            }
        };

        warnings.extend(self.observer.after_event(event, &outcome).await);
        self.record(event, outcome, attempts, started.elapsed(), None, warnings);
    }

    async fn run_implicit(&self, event: &TrafficEvent, cycle: &ImplicitCycle) {
        let started = Instant::now();
        let mut warnings = self.observer.before_event(event).await;
        let channel = ChannelId::Io(cycle.connection.clone());
        let mut tracker = ConnectionTracker::new(&cycle.connection, self.settings.miss_threshold);
        let mut stats = CycleStats {
            planned: cycle.cycles,
            sent: 0,
            acknowledged: 0,
            missed: 0,
            max_jitter_us: 0,
            mean_jitter_us: 0,
            late_cycles: 0,
            reestablished: false,
            final_state: ConnectionState::Idle,
        };

        let outcome = match self.transport.open(&channel).await {
            Ok(()) => {
                let outcome = self
                    .drive_cycles(cycle, &channel, &mut tracker, &mut stats, &mut warnings)
                    .await;
                self.teardown(cycle, &channel, &tracker).await;
                outcome
            }
            Err(e) => Outcome::ConnectionFailed {
                detail: format!("open {channel}: {e}"),
            },
        };

        if let Err(e) = tracker.transition(ConnectionState::Closed) {
            warn!(error = %e, "connection close rejected");
        }
        stats.final_state = tracker.state();
        stats.reestablished = tracker.reestablished();

        warnings.extend(self.observer.after_event(event, &outcome).await);
        let attempts = stats.sent;
        self.record(event, outcome, attempts, started.elapsed(), Some(stats), warnings);
    }

    async fn drive_cycles(
        &self,
        cycle: &ImplicitCycle,
        channel: &ChannelId,
        tracker: &mut ConnectionTracker,
        stats: &mut CycleStats,
        warnings: &mut Vec<String>,
    ) -> Outcome {
        if let Err(e) = tracker.transition(ConnectionState::Establishing) {
            return Outcome::ConnectionFailed { detail: e.to_string() };
        }
        if let Err(outcome) = self.forward_open(cycle, channel).await {
            return outcome;
        }

        let mut jitter = JitterTracker::new(cycle.interval, self.settings.jitter_tolerance);
        let wait = self.timeout.min(cycle.interval);
        let mut sequence = SequenceCounter::default();
        let mut heartbeat = Heartbeat::default();
        let mut payload = cycle.payload.clone();
        let mut origin = Instant::now();
        let mut slot = 0u32;

        for _ in 0..cycle.cycles {
            let deadline = origin + cycle.interval * slot;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            slot += 1;

            if jitter.record(deadline, Instant::now(), stats) {
                METRICS.inc_late_cycles();
            }

            if let Some(byte) = cycle.heartbeat_byte.and_then(|i| payload.get_mut(i)) {
                *byte = heartbeat.tick();
            }
            let request = CipRequest::IoData {
                connection: cycle.connection.clone(),
                sequence: sequence.next_value(),
                payload: payload.clone(),
            };
            stats.sent += 1;
            stats.mean_jitter_us = jitter.mean_us(stats.sent);
            METRICS.inc_cycles();

            let Some(sent) = self.send(channel, &request, wait).await else {
                return Outcome::Cancelled;
            };
            if matches!(&sent, Ok(Ok(response)) if response.is_success()) {
                stats.acknowledged += 1;
                if let Err(e) = tracker.record_success() {
                    return Outcome::ConnectionFailed { detail: e.to_string() };
                }
                continue;
            }

            stats.missed += 1;
            METRICS.inc_cycles_missed();
            match tracker.record_miss() {
                Ok(MissOutcome::Tolerated) => {}
                Ok(MissOutcome::TimedOut) if tracker.can_reestablish() => {
                    warnings.push(format!(
                        "connection '{}' timed out after {} consecutive missed responses; re-established",
                        cycle.connection,
                        self.settings.miss_threshold + 1
                    ));
                    if let Err(e) = tracker.begin_reestablish() {
                        return Outcome::ConnectionFailed { detail: e.to_string() };
                    }
                    if let Err(outcome) = self.forward_open(cycle, channel).await {
                        return outcome;
                    }
                    origin = Instant::now();
                    slot = 0;
                }
                Ok(MissOutcome::TimedOut) => {
                    return Outcome::ConnectionFailed {
                        detail: format!(
                            "connection '{}' timed out again after re-establishment",
                            cycle.connection
                        ),
                    }
                }
                Err(e) => return Outcome::ConnectionFailed { detail: e.to_string() },
            }
        }

        warnings.extend(jitter.warning(stats));
        if stats.missed > 0 {
            warnings.push(format!("{} missed responses tolerated", stats.missed));
        }
        if stats.acknowledged == 0 {
            return Outcome::ConnectionFailed {
                detail: "no cycle was acknowledged".to_string(),
            };
        }
        Outcome::Success
    }

    async fn forward_open(&self, cycle: &ImplicitCycle, channel: &ChannelId) -> Result<(), Outcome> {
        let request = CipRequest::ForwardOpen {
            connection: cycle.connection.clone(),
            rpi: cycle.interval,
            connection_type: cycle.connection_type,
            trigger: cycle.trigger,
            params: cycle.params,
        };
        METRICS.inc_requests();
        match self.send(channel, &request, self.timeout).await {
            None => Err(Outcome::Cancelled),
            Some(Ok(Ok(response))) if response.is_success() => Ok(()),
            Some(Ok(Ok(response))) => Err(Outcome::ConnectionFailed {
                detail: format!(
                    "forward open refused: general status 0x{:02X} ({})",
                    response.general_status,
                    status_name(response.general_status)
                ),
            }),
            Some(Ok(Err(e))) => Err(Outcome::ConnectionFailed {
                detail: format!("forward open: {e}"),
            }),
            Some(Err(_)) => Err(Outcome::ConnectionFailed {
                detail: format!("forward open: no response within {} ms", self.timeout.as_millis()),
            }),
        }
    }

    /// Best-effort Forward Close and channel close.
    async fn teardown(&self, cycle: &ImplicitCycle, channel: &ChannelId, tracker: &ConnectionTracker) {
        if tracker.state() != ConnectionState::Idle {
            let request = CipRequest::ForwardClose {
                connection: cycle.connection.clone(),
            };
            match tokio::time::timeout(self.timeout, self.transport.send(channel, &request)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(connection = %cycle.connection, error = %e, "forward close failed"),
                Err(_) => debug!(connection = %cycle.connection, "forward close timed out"),
            }
        }
        if let Err(e) = self.transport.close(channel).await {
            debug!(connection = %cycle.connection, error = %e, "io channel close failed");
        }
    }

    fn record(
        &self,
        event: &TrafficEvent,
        outcome: Outcome,
        attempts: u32,
        elapsed: Duration,
        cycles: Option<CycleStats>,
        warnings: Vec<String>,
    ) {
        let label = event.label();
        obs::emit_event_completed(&self.run_id, event.id.0, &label, outcome.label());
        let entry = EventReport {
            event_id: event.id,
            label,
            object: event.object,
            implicit: event.is_implicit(),
            outcome,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            cycles,
            warnings,
        };
        if let Err(e) = self.report.record(entry) {
            warn!(error = %e, "event outcome dropped");
        }
    }
}

/// Lateness of cycle starts against their absolute schedule.
#[derive(Debug)]
struct JitterTracker {
    tolerance: Duration,
    total_us: u64,
}

impl JitterTracker {
    fn new(interval: Duration, tolerance: f64) -> Self {
        Self {
            tolerance: interval.mul_f64(tolerance),
            total_us: 0,
        }
    }

    /// Record a cycle that started at `now`; true when it was late.
    fn record(&mut self, deadline: Instant, now: Instant, stats: &mut CycleStats) -> bool {
        let jitter = now.saturating_duration_since(deadline);
        let jitter_us = jitter.as_micros() as u64;
        stats.max_jitter_us = stats.max_jitter_us.max(jitter_us);
        self.total_us += jitter_us;
        let late = jitter > self.tolerance;
        if late {
            stats.late_cycles += 1;
        }
        late
    }

    fn mean_us(&self, sent: u32) -> u64 {
        if sent == 0 {
            0
        } else {
            self.total_us / u64::from(sent)
        }
    }

    fn warning(&self, stats: &CycleStats) -> Option<String> {
        (stats.late_cycles > 0).then(|| {
            format!(
                "{} of {} cycles started later than {} us after schedule (max {} us)",
                stats.late_cycles,
                stats.sent,
                self.tolerance.as_micros(),
                stats.max_jitter_us
            )
        })
    }
}

fn check_response(request: &ExplicitRequest, response: &CipResponse) -> Outcome {
    if !response.is_success() {
        return Outcome::ProtocolError {
            detail: format!(
                "{} {}: general status 0x{:02X} ({})",
                request.service.short_name(),
                request.path,
                response.general_status,
                status_name(response.general_status)
            ),
        };
    }
    match &request.expected {
        Some(expected) if *expected != response.payload => Outcome::ProtocolError {
            detail: format!(
                "{} {}: expected {} got {}",
                request.service.short_name(),
                request.path,
                hex::encode(expected),
                hex::encode(&response.payload)
            ),
        },
        _ => Outcome::Success,
    }
}

//! Waveform generation correlated with traffic events.
//!
//! The [`WaveformDriver`] observes plan execution and tells a
//! [`WaveformGenerator`] when implicit bursts start and stop. Generator
//! failures never fail a run; they become warnings on the affected events.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::comm::CommObserver;
use crate::domain::WaveformError;
use crate::plan::{EventId, EventKind, TrafficEvent};
use crate::report::Outcome;

/// Shape of a periodic signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WaveShape {
    Sine,
    Triangle,
    /// High for `duty` of each period.
    Square { duty: f64 },
}

/// A validated waveform description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaveformParams {
    pub shape: WaveShape,
    pub min: f64,
    pub max: f64,
    pub period: Duration,
}

impl WaveformParams {
    pub fn new(shape: WaveShape, min: f64, max: f64, period: Duration) -> Result<Self, WaveformError> {
        if !min.is_finite() || !max.is_finite() {
            return Err(WaveformError::InvalidParameters {
                reason: "min and max must be finite".to_string(),
            });
        }
        if period.is_zero() {
            return Err(WaveformError::InvalidParameters {
                reason: "period must be greater than zero".to_string(),
            });
        }
        let shape = match shape {
            WaveShape::Square { duty } if duty.is_nan() => {
                return Err(WaveformError::InvalidParameters {
                    reason: "duty cycle must be a number".to_string(),
                })
            }
            WaveShape::Square { duty } => WaveShape::Square {
                duty: duty.clamp(0.0, 1.0),
            },
            other => other,
        };
        Ok(Self {
            shape,
            min,
            max,
            period,
        })
    }

    /// Signal value `elapsed` after the waveform started.
    pub fn sample(&self, elapsed: Duration) -> f64 {
        let amplitude = (self.max - self.min) / 2.0;
        let offset = (self.max + self.min) / 2.0;
        let t = elapsed.as_secs_f64();
        let period = self.period.as_secs_f64();

        match self.shape {
            WaveShape::Sine => amplitude * (2.0 * PI * t / period).sin() + offset,
            WaveShape::Triangle => {
                let phase = t / period;
                amplitude * (4.0 * (phase - (phase + 0.5).floor()).abs() - 1.0) + offset
            }
            WaveShape::Square { duty } => {
                if t % period < period * duty {
                    self.max
                } else {
                    self.min
                }
            }
        }
    }
}

/// A command boundary the generator is told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TriggerEvent {
    BurstStart {
        connection: String,
        cycles: u32,
        interval: Duration,
    },
    BurstStop {
        connection: String,
    },
    /// Around an explicit request, when markers are enabled.
    Marker { event: EventId, label: String },
}

/// Signal generator boundary.
#[async_trait]
pub trait WaveformGenerator: Send + Sync {
    async fn configure(&self, params: &WaveformParams) -> Result<(), WaveformError>;
    async fn trigger(&self, event: &TriggerEvent) -> Result<(), WaveformError>;
    async fn stop(&self) -> Result<(), WaveformError>;
}

/// Drives a generator from plan execution events.
pub struct WaveformDriver {
    generator: Arc<dyn WaveformGenerator>,
    params: WaveformParams,
    mark_explicit: bool,
    // Generator commands are issued one at a time.
    gate: tokio::sync::Mutex<()>,
}

impl WaveformDriver {
    pub fn new(generator: Arc<dyn WaveformGenerator>, params: WaveformParams) -> Self {
        Self {
            generator,
            params,
            mark_explicit: false,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Also send markers around explicit requests.
    pub fn with_explicit_markers(mut self, enabled: bool) -> Self {
        self.mark_explicit = enabled;
        self
    }

    pub fn params(&self) -> &WaveformParams {
        &self.params
    }

    /// Configure the generator at the start of a run.
    pub async fn start(&self) -> Result<(), WaveformError> {
        let _guard = self.gate.lock().await;
        self.generator.configure(&self.params).await
    }

    /// Stop the generator at the end of a run.
    pub async fn finish(&self) -> Result<(), WaveformError> {
        let _guard = self.gate.lock().await;
        self.generator.stop().await
    }

    async fn send(&self, trigger: TriggerEvent) -> Vec<String> {
        let _guard = self.gate.lock().await;
        match self.generator.trigger(&trigger).await {
            Ok(()) => {
                debug!(?trigger, "waveform trigger sent");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, ?trigger, "waveform trigger failed");
                vec![format!("waveform: {e}")]
            }
        }
    }
}

#[async_trait]
impl CommObserver for WaveformDriver {
    async fn before_event(&self, event: &TrafficEvent) -> Vec<String> {
        match &event.kind {
            EventKind::Implicit(cycle) => {
                self.send(TriggerEvent::BurstStart {
                    connection: cycle.connection.clone(),
                    cycles: cycle.cycles,
                    interval: cycle.interval,
                })
                .await
            }
            EventKind::Explicit(_) if self.mark_explicit => {
                self.send(TriggerEvent::Marker {
                    event: event.id,
                    label: event.label(),
                })
                .await
            }
            EventKind::Explicit(_) => Vec::new(),
        }
    }

    async fn after_event(&self, event: &TrafficEvent, _outcome: &Outcome) -> Vec<String> {
        match &event.kind {
            EventKind::Implicit(cycle) => {
                self.send(TriggerEvent::BurstStop {
                    connection: cycle.connection.clone(),
                })
                .await
            }
            EventKind::Explicit(_) => Vec::new(),
        }
    }
}

/// One recorded point of a software-generated signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveSample {
    pub at: Duration,
    pub value: f64,
    pub trigger: TriggerEvent,
}

#[derive(Debug, Default)]
struct SoftwareState {
    params: Option<WaveformParams>,
    epoch: Option<Instant>,
    active: BTreeSet<String>,
    trace: Vec<WaveSample>,
    stopped: bool,
}

/// In-process generator that samples the configured waveform at every
/// trigger. Useful when no bench generator is attached.
#[derive(Debug, Default)]
pub struct SoftwareGenerator {
    state: Mutex<SoftwareState>,
}

impl SoftwareGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace(&self) -> Vec<WaveSample> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .trace
            .clone()
    }

    /// Connections with a burst in progress.
    pub fn active_bursts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stopped
    }
}

#[async_trait]
impl WaveformGenerator for SoftwareGenerator {
    async fn configure(&self, params: &WaveformParams) -> Result<(), WaveformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.params = Some(*params);
        state.epoch = None;
        state.stopped = false;
        Ok(())
    }

    async fn trigger(&self, event: &TriggerEvent) -> Result<(), WaveformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(params) = state.params else {
            return Err(WaveformError::Rejected {
                reason: "generator is not configured".to_string(),
            });
        };
        if state.stopped {
            return Err(WaveformError::Rejected {
                reason: "generator is stopped".to_string(),
            });
        }

        let now = Instant::now();
        let epoch = *state.epoch.get_or_insert(now);
        let at = now.duration_since(epoch);
        match event {
            TriggerEvent::BurstStart { connection, .. } => {
                state.active.insert(connection.clone());
            }
            TriggerEvent::BurstStop { connection } => {
                state.active.remove(connection);
            }
            TriggerEvent::Marker { .. } => {}
        }
        state.trace.push(WaveSample {
            at,
            value: params.sample(at),
            trigger: event.clone(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), WaveformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.clear();
        state.stopped = true;
        Ok(())
    }
}

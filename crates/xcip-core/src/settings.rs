//! Run settings shared by the orchestrator and the command line.

use std::time::Duration;

use crate::comm::manager::MAX_EXPLICIT_RETRIES;
use crate::comm::CommSettings;
use crate::domain::SettingsError;
use crate::plan::PlanOptions;
use crate::waveform::WaveformParams;

/// Everything that tunes one run besides the manifest itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Total traffic duration. `None` uses the plan default.
    pub duration: Option<Duration>,
    pub timeout_override: Option<Duration>,
    pub explicit_retries: u32,
    pub miss_threshold: u32,
    pub jitter_tolerance: f64,
    pub max_concurrent: usize,
    pub waveform: Option<WaveformParams>,
    /// Send generator markers around explicit requests.
    pub mark_explicit: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        let comm = CommSettings::default();
        Self {
            duration: None,
            timeout_override: comm.timeout_override,
            explicit_retries: comm.explicit_retries,
            miss_threshold: comm.miss_threshold,
            jitter_tolerance: comm.jitter_tolerance,
            max_concurrent: comm.max_concurrent,
            waveform: None,
            mark_explicit: false,
        }
    }
}

impl RunSettings {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.explicit_retries = retries;
        self
    }

    pub fn with_miss_threshold(mut self, threshold: u32) -> Self {
        self.miss_threshold = threshold;
        self
    }

    pub fn with_jitter_tolerance(mut self, tolerance: f64) -> Self {
        self.jitter_tolerance = tolerance;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_waveform(mut self, params: WaveformParams) -> Self {
        self.waveform = Some(params);
        self
    }

    pub fn with_explicit_markers(mut self, enabled: bool) -> Self {
        self.mark_explicit = enabled;
        self
    }

    /// Reject settings no run could honour.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(invalid("duration", "must be greater than zero"));
        }
        if self.timeout_override.is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout", "must be greater than zero"));
        }
        if self.explicit_retries > MAX_EXPLICIT_RETRIES {
            return Err(invalid(
                "retries",
                &format!("at most {MAX_EXPLICIT_RETRIES} retries are allowed"),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_tolerance) {
            return Err(invalid("jitter_tolerance", "must be between 0 and 1"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent", "must be at least 1"));
        }
        Ok(())
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            duration: self.duration,
        }
    }

    pub fn comm_settings(&self) -> CommSettings {
        CommSettings {
            timeout_override: self.timeout_override,
            explicit_retries: self.explicit_retries,
            miss_threshold: self.miss_threshold,
            jitter_tolerance: self.jitter_tolerance,
            max_concurrent: self.max_concurrent,
        }
    }
}

fn invalid(field: &str, reason: &str) -> SettingsError {
    SettingsError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = RunSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.explicit_retries, 1);
        assert_eq!(settings.comm_settings(), CommSettings::default());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = RunSettings::default().with_retries(4).validate().unwrap_err();
        assert_eq!(err.field, "retries");
        assert!(RunSettings::default()
            .with_duration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RunSettings::default()
            .with_jitter_tolerance(1.5)
            .validate()
            .is_err());
        assert!(RunSettings::default()
            .with_max_concurrent(0)
            .validate()
            .is_err());
    }

    #[test]
    fn builder_methods_flow_into_comm_settings() {
        let settings = RunSettings::default()
            .with_timeout(Duration::from_millis(20))
            .with_retries(3)
            .with_duration(Duration::from_millis(50));
        let comm = settings.comm_settings();
        assert_eq!(comm.timeout_override, Some(Duration::from_millis(20)));
        assert_eq!(comm.explicit_retries, 3);
        assert_eq!(settings.plan_options().duration, Some(Duration::from_millis(50)));
    }
}

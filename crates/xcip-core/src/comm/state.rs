//! Per-connection state machine.

use serde::Serialize;

/// Lifecycle state of an implicit connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Establishing,
    Established,
    TimedOut,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Establishing)
                | (Establishing, Established)
                | (Establishing, TimedOut)
                | (Established, TimedOut)
                | (TimedOut, Establishing)
                | (Idle | Establishing | Established | TimedOut | Closed, Closed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection '{connection}': invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub connection: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// What a missed response did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Still within the consecutive-miss threshold.
    Tolerated,
    /// Threshold exceeded; the connection is now timed out.
    TimedOut,
}

/// Tracks one connection's state, consecutive misses and the single
/// re-establishment it is allowed.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    connection: String,
    state: ConnectionState,
    threshold: u32,
    consecutive_misses: u32,
    reestablished: bool,
    history: Vec<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new(connection: impl Into<String>, threshold: u32) -> Self {
        Self {
            connection: connection.into(),
            state: ConnectionState::Idle,
            threshold,
            consecutive_misses: 0,
            reestablished: false,
            history: vec![ConnectionState::Idle],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Every state entered, starting with `Idle`.
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    pub fn reestablished(&self) -> bool {
        self.reestablished
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if self.state == next && next == ConnectionState::Closed {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                connection: self.connection.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// A response arrived.
    pub fn record_success(&mut self) -> Result<(), InvalidTransition> {
        self.consecutive_misses = 0;
        if self.state == ConnectionState::Establishing {
            self.transition(ConnectionState::Established)?;
        }
        Ok(())
    }

    /// A response was missed.
    pub fn record_miss(&mut self) -> Result<MissOutcome, InvalidTransition> {
        self.consecutive_misses += 1;
        let live = matches!(
            self.state,
            ConnectionState::Establishing | ConnectionState::Established
        );
        if live && self.consecutive_misses > self.threshold {
            self.transition(ConnectionState::TimedOut)?;
            return Ok(MissOutcome::TimedOut);
        }
        Ok(MissOutcome::Tolerated)
    }

    pub fn can_reestablish(&self) -> bool {
        self.state == ConnectionState::TimedOut && !self.reestablished
    }

    /// Use the single re-establishment attempt.
    pub fn begin_reestablish(&mut self) -> Result<(), InvalidTransition> {
        if self.reestablished {
            return Err(InvalidTransition {
                connection: self.connection.clone(),
                from: self.state,
                to: ConnectionState::Establishing,
            });
        }
        self.transition(ConnectionState::Establishing)?;
        self.reestablished = true;
        self.consecutive_misses = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_transitions() {
        let mut t = ConnectionTracker::new("io", 3);
        t.transition(Establishing).unwrap();
        t.record_success().unwrap();
        assert_eq!(t.state(), Established);
        t.transition(Closed).unwrap();
        assert_eq!(t.history(), &[Idle, Establishing, Established, Closed]);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut t = ConnectionTracker::new("io", 3);
        assert!(t.transition(Established).is_err());
        assert!(t.transition(TimedOut).is_err());
        t.transition(Closed).unwrap();
        assert!(t.transition(Establishing).is_err());
        // closing twice is harmless
        assert!(t.transition(Closed).is_ok());
    }

    #[test]
    fn misses_beyond_threshold_time_out() {
        let mut t = ConnectionTracker::new("io", 3);
        t.transition(Establishing).unwrap();
        t.record_success().unwrap();
        for _ in 0..3 {
            assert_eq!(t.record_miss().unwrap(), MissOutcome::Tolerated);
        }
        assert_eq!(t.record_miss().unwrap(), MissOutcome::TimedOut);
        assert_eq!(t.state(), TimedOut);
    }

    #[test]
    fn success_resets_miss_count() {
        let mut t = ConnectionTracker::new("io", 2);
        t.transition(Establishing).unwrap();
        t.record_miss().unwrap();
        t.record_miss().unwrap();
        t.record_success().unwrap();
        t.record_miss().unwrap();
        t.record_miss().unwrap();
        assert_eq!(t.state(), Established);
    }

    #[test]
    fn reestablish_only_once() {
        let mut t = ConnectionTracker::new("io", 0);
        t.transition(Establishing).unwrap();
        assert_eq!(t.record_miss().unwrap(), MissOutcome::TimedOut);
        assert!(t.can_reestablish());
        t.begin_reestablish().unwrap();
        assert_eq!(t.state(), Establishing);
        assert_eq!(t.record_miss().unwrap(), MissOutcome::TimedOut);
        assert!(!t.can_reestablish());
        assert!(t.begin_reestablish().is_err());
    }
}

//! Wrapping counters carried in implicit I/O frames.

/// First CIP sequence count used on a fresh connection.
pub const SEQUENCE_START: u16 = 65500;

/// CIP sequence count; wraps from 65535 to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u16);

impl Default for SequenceCounter {
    fn default() -> Self {
        Self(SEQUENCE_START)
    }
}

impl SequenceCounter {
    /// Current value, then advance.
    pub fn next_value(&mut self) -> u16 {
        let current = self.0;
        self.0 = self.0.wrapping_add(1);
        current
    }
}

/// Heartbeat byte; wraps from 255 to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat(u8);

impl Heartbeat {
    /// Advance, then return the new value.
    pub fn tick(&mut self) -> u8 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_high_and_wraps() {
        let mut seq = SequenceCounter::default();
        let values: Vec<u16> = (0..40).map(|_| seq.next_value()).collect();
        assert_eq!(values[0], 65500);
        assert_eq!(values[35], 65535);
        assert_eq!(values[36], 0);
        assert_eq!(values[39], 3);
    }

    #[test]
    fn heartbeat_wraps() {
        let mut hb = Heartbeat::default();
        let mut last = 0;
        for _ in 0..256 {
            last = hb.tick();
        }
        assert_eq!(last, 0);
        assert_eq!(hb.tick(), 1);
    }
}

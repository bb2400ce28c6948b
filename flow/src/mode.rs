//! Flow controller modes and their atomic cell.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Operating mode of the flow controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    /// Buffering incoming data while the consumer drains it
    Processing = 0x01,
    /// Buffering only; the consumer idles until the high watermark is reached
    Prefetching = 0x02,
    /// Buffer saturated; incoming data is discarded
    Dropping = 0x03,
}

impl TryFrom<u8> for Mode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Processing),
            0x02 => Ok(Self::Prefetching),
            0x03 => Ok(Self::Dropping),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Processing => "PROCESSING",
            Mode::Prefetching => "PREFETCHING",
            Mode::Dropping => "DROPPING",
        };
        f.write_str(name)
    }
}

/// A [`Mode`] shared between the producer and the consumer task
///
/// Every change goes through `swap` or a compare-exchange so that one side
/// never silently overwrites a transition the other side just made.
#[derive(Debug)]
pub struct AtomicMode(AtomicU8);

impl AtomicMode {
    pub const fn new(mode: Mode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub fn load(&self) -> Mode {
        decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, mode: Mode) {
        self.0.store(mode as u8, Ordering::Release);
    }

    /// Set `mode` and return the previous one
    pub fn swap(&self, mode: Mode) -> Mode {
        decode(self.0.swap(mode as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to`; returns false if the mode was not `from`
    pub fn transition(&self, from: Mode, to: Mode) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// Only `Mode` discriminants are ever stored.
fn decode(raw: u8) -> Mode {
    Mode::try_from(raw).unwrap_or(Mode::Prefetching)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_conversion() {
        for mode in [Mode::Processing, Mode::Prefetching, Mode::Dropping] {
            assert_eq!(Mode::try_from(mode as u8), Ok(mode));
        }
        assert!(Mode::try_from(0x00).is_err());
    }

    #[test]
    fn test_transition_requires_expected_mode() {
        let mode = AtomicMode::new(Mode::Prefetching);
        assert!(!mode.transition(Mode::Dropping, Mode::Processing));
        assert_eq!(mode.load(), Mode::Prefetching);

        assert!(mode.transition(Mode::Prefetching, Mode::Processing));
        assert_eq!(mode.load(), Mode::Processing);
    }

    #[test]
    fn test_swap_returns_previous() {
        let mode = AtomicMode::new(Mode::Processing);
        assert_eq!(mode.swap(Mode::Dropping), Mode::Processing);
        assert_eq!(mode.load(), Mode::Dropping);
        mode.store(Mode::Prefetching);
        assert_eq!(mode.load().to_string(), "PREFETCHING");
    }
}

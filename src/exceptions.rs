// Exception Tracker - at most one live device exception per session
// Lifecycle: a fault is latched when first observed at a stop, reported to
// the user, then either reset (recoverable) or escalated on the next resume.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::coords::Coords;

/// Device exception codes as reported per lane/warp/device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    WarpAssert,
    LaneIllegalAddress,
    LaneUserStackOverflow,
    LaneMisalignedAddress,
    WarpOutOfRangeAddress,
    WarpIllegalInstruction,
    WarpMisalignedAddress,
    WarpInvalidAddressSpace,
    WarpInvalidPc,
    WarpHardwareStackOverflow,
    DeviceHardwareStackError,
    DeviceIllegalInstruction,
}

impl ExceptionKind {
    /// A software assertion is the only fault hardware can resume past.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExceptionKind::WarpAssert)
    }

    /// Host-visible signal number delivered for this fault.
    pub fn signal(&self) -> i32 {
        match self {
            ExceptionKind::WarpAssert => 5, // SIGTRAP
            ExceptionKind::LaneIllegalAddress
            | ExceptionKind::WarpOutOfRangeAddress
            | ExceptionKind::WarpInvalidPc
            | ExceptionKind::WarpInvalidAddressSpace => 11, // SIGSEGV
            ExceptionKind::LaneMisalignedAddress | ExceptionKind::WarpMisalignedAddress => 7, // SIGBUS
            ExceptionKind::WarpIllegalInstruction | ExceptionKind::DeviceIllegalInstruction => 4, // SIGILL
            ExceptionKind::LaneUserStackOverflow
            | ExceptionKind::WarpHardwareStackOverflow
            | ExceptionKind::DeviceHardwareStackError => 11,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::WarpAssert => "warp assert",
            ExceptionKind::LaneIllegalAddress => "lane illegal address",
            ExceptionKind::LaneUserStackOverflow => "lane user stack overflow",
            ExceptionKind::LaneMisalignedAddress => "lane misaligned address",
            ExceptionKind::WarpOutOfRangeAddress => "warp out-of-range address",
            ExceptionKind::WarpIllegalInstruction => "warp illegal instruction",
            ExceptionKind::WarpMisalignedAddress => "warp misaligned address",
            ExceptionKind::WarpInvalidAddressSpace => "warp invalid address space",
            ExceptionKind::WarpInvalidPc => "warp invalid pc",
            ExceptionKind::WarpHardwareStackOverflow => "warp hardware stack overflow",
            ExceptionKind::DeviceHardwareStackError => "device hardware stack error",
            ExceptionKind::DeviceIllegalInstruction => "device illegal instruction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExceptionRecord {
    pub kind: ExceptionKind,
    pub coords: Coords,
}

/// Holds zero or one live exception. A new fault cannot be latched until the
/// previous one has been reset.
#[derive(Debug, Default)]
pub struct ExceptionTracker {
    live: Option<ExceptionRecord>,
}

impl ExceptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch a fault. Returns false (and keeps the existing record) if one is
    /// already live.
    pub fn hit(&mut self, kind: ExceptionKind, coords: Coords) -> bool {
        if let Some(existing) = &self.live {
            warn!(
                "ignoring device exception {} while {} is still pending",
                kind, existing.kind
            );
            return false;
        }
        self.live = Some(ExceptionRecord { kind, coords });
        true
    }

    pub fn is_valid(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_recoverable(&self) -> bool {
        self.live.map(|e| e.kind.is_recoverable()).unwrap_or(false)
    }

    pub fn kind(&self) -> Option<ExceptionKind> {
        self.live.map(|e| e.kind)
    }

    pub fn coords(&self) -> Option<Coords> {
        self.live.map(|e| e.coords)
    }

    /// Host signal for the live exception, if any.
    pub fn signal(&self) -> Option<i32> {
        self.live.map(|e| e.kind.signal())
    }

    pub fn reset(&mut self) {
        self.live = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusivity() {
        let mut t = ExceptionTracker::new();
        assert!(!t.is_valid());
        assert!(t.hit(ExceptionKind::LaneIllegalAddress, Coords::physical(0, 0, 0, 0)));
        assert!(t.is_valid());
        // second hit is dropped while one is live
        assert!(!t.hit(ExceptionKind::WarpAssert, Coords::physical(0, 0, 1, 0)));
        assert_eq!(t.kind(), Some(ExceptionKind::LaneIllegalAddress));
        t.reset();
        assert!(!t.is_valid());
        assert!(t.hit(ExceptionKind::WarpAssert, Coords::physical(0, 0, 1, 0)));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ExceptionKind::WarpAssert.is_recoverable());
        assert!(!ExceptionKind::LaneIllegalAddress.is_recoverable());
        assert!(!ExceptionKind::DeviceHardwareStackError.is_recoverable());
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(ExceptionKind::WarpAssert.signal(), 5);
        assert_eq!(ExceptionKind::LaneIllegalAddress.signal(), 11);
        assert_eq!(ExceptionKind::WarpIllegalInstruction.signal(), 4);
        assert_eq!(ExceptionKind::WarpMisalignedAddress.signal(), 7);
    }
}

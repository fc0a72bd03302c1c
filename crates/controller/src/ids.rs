//! Validated identifier types and the rule-level error taxonomy. Rule data
//! enters the tables only through these checks — bad ids and windows are
//! rejected at the boundary, never clamped into a different meaning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of physical relays on the board.
pub const RELAY_COUNT: usize = 4;

/// Timer slots per relay.
pub const SLOTS_PER_RELAY: u8 = 3;

/// Minutes in a day; valid schedule minutes are `0..MINUTES_PER_DAY`.
pub const MINUTES_PER_DAY: u16 = 1440;

/// Reserved marker stored in a timer boundary to mean "no window".
pub const DISABLED_MINUTE: u16 = 3000;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RuleError {
    #[error("relay id {0} out of range 0..4")]
    RelayOutOfRange(u8),
    #[error("timer slot {0} out of range 0..3")]
    SlotOutOfRange(u8),
    #[error("minute value {0} is neither a valid minute of day nor the disabled marker")]
    BadMinute(u16),
    #[error("schedule window closes before it opens ({off} < {on}); overnight windows are not supported")]
    WindowOrder { on: u16, off: u16 },
    #[error("override duration must be positive")]
    BadDuration,
    #[error("unknown sensor type '{0}'")]
    UnknownSensorType(String),
    #[error("unknown control mode '{0}'")]
    UnknownControlMode(String),
}

/// A range-checked relay index, 0-based. The external switch service uses
/// 1-based ids; `external()`/`from_external()` translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8")]
pub struct RelayId(u8);

impl TryFrom<u8> for RelayId {
    type Error = RuleError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl RelayId {
    pub fn new(id: u8) -> Result<Self, RuleError> {
        if (id as usize) < RELAY_COUNT {
            Ok(Self(id))
        } else {
            Err(RuleError::RelayOutOfRange(id))
        }
    }

    /// All relay ids in order.
    pub fn all() -> impl Iterator<Item = RelayId> {
        (0..RELAY_COUNT as u8).map(RelayId)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// 1-based id used by the remote switch service.
    pub fn external(self) -> u8 {
        self.0 + 1
    }

    pub fn from_external(id: u8) -> Result<Self, RuleError> {
        if id == 0 {
            return Err(RuleError::RelayOutOfRange(id));
        }
        Self::new(id - 1)
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Validate a schedule boundary: a real minute of day, or the marker.
pub fn check_minute(minute: u16) -> Result<(), RuleError> {
    if minute < MINUTES_PER_DAY || minute >= DISABLED_MINUTE {
        Ok(())
    } else {
        Err(RuleError::BadMinute(minute))
    }
}

/// True when a boundary carries the reserved "no window" marker.
pub fn is_disabled_minute(minute: u16) -> bool {
    minute >= MINUTES_PER_DAY
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_id_accepts_0_to_3() {
        for id in 0..4 {
            assert!(RelayId::new(id).is_ok());
        }
    }

    #[test]
    fn relay_id_rejects_4() {
        assert_eq!(RelayId::new(4), Err(RuleError::RelayOutOfRange(4)));
    }

    #[test]
    fn external_id_is_one_based() {
        assert_eq!(RelayId::new(0).unwrap().external(), 1);
        assert_eq!(RelayId::new(3).unwrap().external(), 4);
    }

    #[test]
    fn from_external_maps_back() {
        assert_eq!(RelayId::from_external(1).unwrap().value(), 0);
        assert_eq!(RelayId::from_external(4).unwrap().value(), 3);
    }

    #[test]
    fn from_external_rejects_0_and_5() {
        assert!(RelayId::from_external(0).is_err());
        assert!(RelayId::from_external(5).is_err());
    }

    #[test]
    fn minute_validation() {
        assert!(check_minute(0).is_ok());
        assert!(check_minute(1439).is_ok());
        assert!(check_minute(DISABLED_MINUTE).is_ok()); // marker is legal
        assert_eq!(check_minute(1440), Err(RuleError::BadMinute(1440)));
        assert_eq!(check_minute(2000), Err(RuleError::BadMinute(2000)));
    }

    #[test]
    fn disabled_marker_detection() {
        assert!(!is_disabled_minute(1439));
        assert!(is_disabled_minute(DISABLED_MINUTE));
        assert!(is_disabled_minute(1440));
    }
}

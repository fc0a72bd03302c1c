//! State arbitration on top of the relay board.
//!
//! Every actuation request funnels through here. The hardware pin is the
//! ground truth: a request matching what the pin already reads is a no-op
//! (and silently repairs a stale cache), so redundant schedule and sensor
//! decisions every cycle never produce event spam or extra writes.
//!
//! Each real transition arms a one-shot loop guard for that relay. The
//! remote reconciler consumes it to skip echoing our own change back as a
//! remote command.

use tracing::{info, warn};

use crate::ids::{RelayId, RELAY_COUNT};
use crate::relay::RelayBoard;

/// Who asked for a transition. Recorded with every applied change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Schedule,
    Sensor,
    Manual,
    Remote,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Schedule => "schedule",
            Source::Sensor => "sensor",
            Source::Manual => "manual",
            Source::Remote => "remote",
        }
    }
}

/// A transition that actually reached the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedChange {
    pub relay: RelayId,
    pub on: bool,
    pub source: Source,
}

pub struct Arbiter {
    board: RelayBoard,
    cache: [bool; RELAY_COUNT],
    ignore_next_sync: [bool; RELAY_COUNT],
}

impl Arbiter {
    /// Wraps a board and forces every relay off, so the cache and the
    /// pins agree from the first cycle.
    pub fn new(mut board: RelayBoard) -> Self {
        board.all_off();
        Self {
            board,
            cache: [false; RELAY_COUNT],
            ignore_next_sync: [false; RELAY_COUNT],
        }
    }

    /// Cached state of one relay.
    pub fn state(&self, relay: RelayId) -> bool {
        self.cache[relay.index()]
    }

    pub fn states(&self) -> [bool; RELAY_COUNT] {
        self.cache
    }

    /// Ask for a state. Returns the applied change, or `None` when the
    /// hardware already reads the requested level.
    pub fn request_state(
        &mut self,
        relay: RelayId,
        on: bool,
        source: Source,
    ) -> Option<AppliedChange> {
        let hardware = self.board.level(relay);

        if hardware == on {
            if self.cache[relay.index()] != hardware {
                warn!(
                    relay = %relay,
                    hardware = on,
                    "cached relay state disagreed with pin, resyncing"
                );
                self.cache[relay.index()] = hardware;
            }
            return None;
        }

        self.board.set(relay, on);

        // Read back: the pin is ground truth even right after a write.
        let observed = self.board.level(relay);
        if observed != on {
            warn!(
                relay = %relay,
                requested = on,
                observed,
                "relay write did not take, trusting the pin"
            );
            self.cache[relay.index()] = observed;
            return None;
        }

        self.cache[relay.index()] = on;
        self.ignore_next_sync[relay.index()] = true;
        info!(relay = %relay, on, source = source.as_str(), "relay switched");

        Some(AppliedChange { relay, on, source })
    }

    /// Take the loop guard for one relay, disarming it. True at most once
    /// per applied change.
    pub fn consume_guard(&mut self, relay: RelayId) -> bool {
        std::mem::take(&mut self.ignore_next_sync[relay.index()])
    }

    #[cfg(all(test, not(feature = "gpio")))]
    pub(crate) fn board_mut(&mut self) -> &mut RelayBoard {
        &mut self.board
    }
}

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::relay::RelayBoard;

    fn r(id: u8) -> RelayId {
        RelayId::new(id).unwrap()
    }

    fn arbiter() -> Arbiter {
        Arbiter::new(RelayBoard::new(&[17, 27, 22, 23], false).unwrap())
    }

    #[test]
    fn transition_applies_and_arms_guard() {
        let mut a = arbiter();
        let change = a.request_state(r(0), true, Source::Schedule).unwrap();
        assert_eq!(change, AppliedChange { relay: r(0), on: true, source: Source::Schedule });
        assert!(a.state(r(0)));
        assert!(a.consume_guard(r(0)));
    }

    #[test]
    fn repeated_request_is_a_no_op() {
        let mut a = arbiter();
        assert!(a.request_state(r(1), true, Source::Manual).is_some());
        assert!(a.consume_guard(r(1)));
        // Same state again: nothing applied, guard stays disarmed.
        assert!(a.request_state(r(1), true, Source::Schedule).is_none());
        assert!(!a.consume_guard(r(1)));
    }

    #[test]
    fn guard_fires_at_most_once() {
        let mut a = arbiter();
        a.request_state(r(2), true, Source::Sensor);
        assert!(a.consume_guard(r(2)));
        assert!(!a.consume_guard(r(2)));
    }

    #[test]
    fn guards_are_per_relay() {
        let mut a = arbiter();
        a.request_state(r(0), true, Source::Manual);
        assert!(!a.consume_guard(r(3)));
        assert!(a.consume_guard(r(0)));
    }

    #[test]
    fn no_op_repairs_a_stale_cache() {
        let mut a = arbiter();
        a.request_state(r(1), true, Source::Manual);
        // Pin drifts off behind our back.
        a.board_mut().force_level(r(1), false);
        a.consume_guard(r(1));

        // Requesting off now matches the pin: no write, cache resynced.
        assert!(a.request_state(r(1), false, Source::Schedule).is_none());
        assert!(!a.state(r(1)));
        assert!(!a.consume_guard(r(1)));
    }

    #[test]
    fn startup_forces_everything_off() {
        let mut board = RelayBoard::new(&[17, 27, 22, 23], false).unwrap();
        board.set(r(0), true);
        board.set(r(3), true);
        let a = Arbiter::new(board);
        assert_eq!(a.states(), [false; 4]);
    }
}

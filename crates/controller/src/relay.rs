//! Relay output board via GPIO. The `gpio` feature gates the real rppal
//! driver; without it, a mock board keeps pin levels in memory.
//!
//! The board is deliberately dumb: it sets and reads output levels. All
//! decision logic lives in the arbitrator, which treats `level()` — the
//! actual pin state, not a software cache — as ground truth.

use anyhow::Result;

use crate::ids::{RelayId, RELAY_COUNT};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Vec<OutputPin>, // indexed by relay id
    active_low: bool,     // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(gpio_pins: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = Vec::with_capacity(gpio_pins.len());

        for pin_num in gpio_pins {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.push(pin);
        }

        Ok(Self { pins, active_low })
    }

    /// Read the current output level of a relay, as on/off.
    pub fn level(&self, relay: RelayId) -> bool {
        let pin = &self.pins[relay.index()];
        if self.active_low {
            pin.is_set_low()
        } else {
            pin.is_set_high()
        }
    }

    pub fn set(&mut self, relay: RelayId, on: bool) {
        let pin = &mut self.pins[relay.index()];
        if self.active_low {
            if on {
                pin.set_low()
            } else {
                pin.set_high()
            }
        } else {
            if on {
                pin.set_high()
            } else {
                pin.set_low()
            }
        }
    }

    pub fn all_off(&mut self) {
        for i in 0..self.pins.len().min(RELAY_COUNT) {
            if let Ok(relay) = RelayId::new(i as u8) {
                self.set(relay, false);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (development — no hardware, pin levels held in memory)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    levels: [bool; RELAY_COUNT],
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(gpio_pins: &[u8], _active_low: bool) -> Result<Self> {
        for (i, pin_num) in gpio_pins.iter().enumerate() {
            tracing::debug!(relay = i, gpio = pin_num, "mock relay registered (not wired)");
        }
        Ok(Self {
            levels: [false; RELAY_COUNT],
        })
    }

    /// Read the current output level of a relay, as on/off.
    pub fn level(&self, relay: RelayId) -> bool {
        self.levels[relay.index()]
    }

    pub fn set(&mut self, relay: RelayId, on: bool) {
        self.levels[relay.index()] = on;
    }

    pub fn all_off(&mut self) {
        self.levels = [false; RELAY_COUNT];
    }

    /// Flip a pin behind the arbitrator's back. Test-only: simulates the
    /// hardware drifting from the cached state.
    #[cfg(test)]
    pub(crate) fn force_level(&mut self, relay: RelayId, on: bool) {
        self.levels[relay.index()] = on;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn r(id: u8) -> RelayId {
        RelayId::new(id).unwrap()
    }

    #[test]
    fn board_starts_all_off() {
        let board = RelayBoard::new(&[17, 27, 22, 23], false).unwrap();
        for i in 0..4 {
            assert!(!board.level(r(i)));
        }
    }

    #[test]
    fn board_set_and_read_back() {
        let mut board = RelayBoard::new(&[17, 27, 22, 23], false).unwrap();
        board.set(r(2), true);
        assert!(board.level(r(2)));
        assert!(!board.level(r(1)));
        board.set(r(2), false);
        assert!(!board.level(r(2)));
    }

    #[test]
    fn board_all_off_resets_everything() {
        let mut board = RelayBoard::new(&[17, 27, 22, 23], false).unwrap();
        board.set(r(0), true);
        board.set(r(3), true);
        board.all_off();
        for i in 0..4 {
            assert!(!board.level(r(i)));
        }
    }
}

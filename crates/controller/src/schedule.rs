//! Weekly on/off schedule per relay and timer slot.
//!
//! A relay with no enabled rule is "schedule-silent": the store answers
//! `None` from [`ScheduleStore::should_be_on`] and the arbitrator leaves the
//! relay alone. Absence of a schedule means "don't care", never "off".

use serde::{Deserialize, Serialize};

use crate::ids::{
    check_minute, is_disabled_minute, RelayId, RuleError, SLOTS_PER_RELAY,
};

/// One weekly window: active on the flagged days between `time_on` (incl.)
/// and `time_off` (excl.), both minutes of day. `days[0]` is Monday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRule {
    pub relay: RelayId,
    pub slot: u8,
    pub enabled: bool,
    pub days: [bool; 7],
    pub time_on: u16,
    pub time_off: u16,
}

impl TimerRule {
    /// Boundary validation. Overnight windows (`time_off < time_on`) are not
    /// supported and are rejected rather than guessed at.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.slot >= SLOTS_PER_RELAY {
            return Err(RuleError::SlotOutOfRange(self.slot));
        }
        check_minute(self.time_on)?;
        check_minute(self.time_off)?;
        if !is_disabled_minute(self.time_on)
            && !is_disabled_minute(self.time_off)
            && self.time_off < self.time_on
        {
            return Err(RuleError::WindowOrder {
                on: self.time_on,
                off: self.time_off,
            });
        }
        Ok(())
    }
}

/// Holds the weekly schedule mirrored from the remote directory.
///
/// `generation` increments on every wholesale replacement, so callers can
/// observe whether an unchanged sync token really skipped the reload.
pub struct ScheduleStore {
    rules: Vec<TimerRule>,
    generation: u64,
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[TimerRule] {
        &self.rules
    }

    pub fn get(&self, relay: RelayId, slot: u8) -> Option<&TimerRule> {
        self.rules
            .iter()
            .find(|r| r.relay == relay && r.slot == slot)
    }

    /// Replace the whole table (remote sync). Rules must be pre-validated.
    pub fn replace_all(&mut self, rules: Vec<TimerRule>) {
        self.rules = rules;
        self.generation += 1;
    }

    /// Insert or update a single rule (local edit path).
    pub fn upsert(&mut self, rule: TimerRule) -> Result<(), RuleError> {
        rule.validate()?;
        match self
            .rules
            .iter_mut()
            .find(|r| r.relay == rule.relay && r.slot == rule.slot)
        {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        Ok(())
    }

    /// Is the given slot's window open right now? False when the rule is
    /// missing, disabled, the day bit is unset, or either boundary carries
    /// the disabled marker. The window is half-open: `[time_on, time_off)`.
    pub fn is_active(&self, relay: RelayId, slot: u8, minute_of_day: u16, day_of_week: u8) -> bool {
        let Some(rule) = self.get(relay, slot) else {
            return false;
        };
        if !rule.enabled {
            return false;
        }
        if day_of_week >= 7 || !rule.days[day_of_week as usize] {
            return false;
        }
        if is_disabled_minute(rule.time_on) || is_disabled_minute(rule.time_off) {
            return false;
        }
        if rule.time_off < rule.time_on {
            // Rejected at the boundary; if one slipped through, never-active.
            return false;
        }
        minute_of_day >= rule.time_on && minute_of_day < rule.time_off
    }

    /// True when the relay has at least one enabled rule across its slots.
    pub fn has_enabled_rule(&self, relay: RelayId) -> bool {
        self.rules.iter().any(|r| r.relay == relay && r.enabled)
    }

    /// Schedule verdict for one relay: `Some(true)` if any slot is active,
    /// `Some(false)` if rules exist but none is active, `None` when the
    /// relay is schedule-silent.
    pub fn should_be_on(&self, relay: RelayId, minute_of_day: u16, day_of_week: u8) -> Option<bool> {
        if !self.has_enabled_rule(relay) {
            return None;
        }
        let on = (0..SLOTS_PER_RELAY).any(|slot| self.is_active(relay, slot, minute_of_day, day_of_week));
        Some(on)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

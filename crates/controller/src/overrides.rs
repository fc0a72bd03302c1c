//! Manual override tracking.
//!
//! An override pins a relay to a desired state, optionally for a limited
//! number of minutes. While one is active the relay ignores schedule and
//! sensor decisions; expiry is checked at the top of every control cycle
//! so automation reclaims the relay on the first tick after the deadline.

use std::time::{Duration, Instant};

use crate::ids::{RelayId, RELAY_COUNT};

#[derive(Debug, Clone)]
pub struct Override {
    pub desired: bool,
    pub expires_at: Option<Instant>,
    pub reason: Option<String>,
}

/// One optional override per relay. All time comparisons take `now` as an
/// argument so tests can drive the clock.
#[derive(Debug, Default)]
pub struct OverrideManager {
    slots: [Option<Override>; RELAY_COUNT],
}

impl OverrideManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place (or replace) an override. `duration_minutes` of `None` means
    /// it holds until cancelled.
    pub fn set(
        &mut self,
        relay: RelayId,
        desired: bool,
        duration_minutes: Option<u32>,
        reason: Option<String>,
        now: Instant,
    ) {
        let expires_at =
            duration_minutes.map(|m| now + Duration::from_secs(u64::from(m) * 60));
        self.slots[relay.index()] = Some(Override {
            desired,
            expires_at,
            reason,
        });
    }

    /// Remove the override. Returns whether one was present.
    pub fn cancel(&mut self, relay: RelayId) -> bool {
        self.slots[relay.index()].take().is_some()
    }

    /// Drop every override whose deadline has passed and report which
    /// relays were released.
    pub fn expire(&mut self, now: Instant) -> Vec<RelayId> {
        let mut released = Vec::new();
        for relay in RelayId::all() {
            let expired = matches!(
                &self.slots[relay.index()],
                Some(o) if o.expires_at.is_some_and(|t| now >= t)
            );
            if expired {
                self.slots[relay.index()] = None;
                released.push(relay);
            }
        }
        released
    }

    /// The pinned state, if an unexpired override is in place. Does not
    /// mutate; `expire` owns removal.
    pub fn desired(&self, relay: RelayId, now: Instant) -> Option<bool> {
        match &self.slots[relay.index()] {
            Some(o) if o.expires_at.is_none_or(|t| now < t) => Some(o.desired),
            _ => None,
        }
    }

    pub fn get(&self, relay: RelayId) -> Option<&Override> {
        self.slots[relay.index()].as_ref()
    }

    pub fn is_active(&self, relay: RelayId, now: Instant) -> bool {
        self.desired(relay, now).is_some()
    }
}

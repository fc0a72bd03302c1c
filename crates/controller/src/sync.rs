//! Remote reconciliation: desired switch states and automation rule sync.
//!
//! The switch reconciler only reacts to *changes* in the remote desired
//! state. The first successful poll establishes a baseline without acting
//! on it, and the loop guard armed by our own transitions swallows their
//! echo, so a device change never bounces back as a remote command.
//!
//! Rule sync is token-gated: an unchanged token skips the reload entirely.

use tracing::{debug, warn};

use crate::ids::{RelayId, RELAY_COUNT};
use crate::remote::{AutomationApi, RemoteError, SwitchApi, SyncData};
use crate::schedule::TimerRule;
use crate::sensor::SensorRule;

/// A remote desired-state change that survived diffing and guard checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteChange {
    pub relay: RelayId,
    pub on: bool,
}

pub struct Reconciler<S> {
    api: S,
    last_known: [Option<bool>; RELAY_COUNT],
}

impl<S: SwitchApi> Reconciler<S> {
    pub fn new(api: S) -> Self {
        Self {
            api,
            last_known: [None; RELAY_COUNT],
        }
    }

    /// Fetch the remote desired states and diff them against the last
    /// poll. `consume_guard` is asked once per fetched relay; a `true`
    /// answer means the incoming value is the echo of our own transition
    /// and must be adopted silently.
    pub async fn poll(
        &mut self,
        mut consume_guard: impl FnMut(RelayId) -> bool,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        let states = self.api.fetch_states().await?;
        let mut changes = Vec::new();

        for (relay, desired) in states {
            if consume_guard(relay) {
                debug!(relay = %relay, desired, "loop guard consumed, adopting remote state");
                self.last_known[relay.index()] = Some(desired);
                continue;
            }
            match self.last_known[relay.index()] {
                None => {
                    // Baseline: remember, never act on a first sighting.
                    self.last_known[relay.index()] = Some(desired);
                }
                Some(previous) if previous != desired => {
                    self.last_known[relay.index()] = Some(desired);
                    changes.push(RemoteChange { relay, on: desired });
                }
                Some(_) => {}
            }
        }
        Ok(changes)
    }

    /// Publish a local transition upstream. One retry on failure; a second
    /// failure is logged and dropped, the next poll's guard still protects
    /// against the stale echo.
    pub async fn push(&mut self, relay: RelayId, on: bool) {
        for attempt in 0..2 {
            match self.api.push_state(relay, on).await {
                Ok(()) => {
                    self.last_known[relay.index()] = Some(on);
                    return;
                }
                Err(err) if attempt == 0 => {
                    debug!(relay = %relay, %err, "switch push failed, retrying");
                }
                Err(err) => {
                    warn!(relay = %relay, %err, "switch push failed twice, giving up");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn last_known(&self) -> [Option<bool>; RELAY_COUNT] {
        self.last_known
    }
}

// ---------------------------------------------------------------------------
// Automation rule sync
// ---------------------------------------------------------------------------

/// A validated rule replacement, ready to apply atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleUpdate {
    pub token: String,
    pub timers: Vec<TimerRule>,
    pub sensors: Vec<SensorRule>,
}

pub struct ConfigSync<A> {
    api: A,
}

impl<A: AutomationApi> ConfigSync<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    /// Fetch the automation payload. `Ok(None)` when the token matches
    /// `current_token`. Individual malformed records are dropped with a
    /// warning; the remaining valid set still replaces the tables.
    pub async fn fetch(
        &self,
        current_token: Option<&str>,
    ) -> Result<Option<RuleUpdate>, RemoteError> {
        let data = self.api.fetch_sync().await?;
        if current_token == Some(data.sync_token.as_str()) {
            debug!(token = %data.sync_token, "sync token unchanged, skipping reload");
            return Ok(None);
        }
        Ok(Some(convert(data)))
    }
}

fn convert(data: SyncData) -> RuleUpdate {
    let mut timers = Vec::with_capacity(data.timers.len());
    for record in &data.timers {
        match record.to_rule() {
            Ok(rule) => timers.push(rule),
            Err(err) => warn!(
                relay_id = record.relay_id,
                slot_id = record.slot_id,
                %err,
                "dropping invalid timer record"
            ),
        }
    }
    let mut sensors = Vec::with_capacity(data.sensors.len());
    for record in &data.sensors {
        match record.to_rule() {
            Ok(rule) => sensors.push(rule),
            Err(err) => warn!(
                relay_id = record.relay_id,
                sensor_type = %record.sensor_type,
                %err,
                "dropping invalid sensor record"
            ),
        }
    }
    RuleUpdate {
        token: data.sync_token,
        timers,
        sensors,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::remote::{SensorRecord, TimerRecord};

    fn r(id: u8) -> RelayId {
        RelayId::new(id).unwrap()
    }

    struct FakeSwitches {
        polls: Mutex<VecDeque<Vec<(RelayId, bool)>>>,
        pushes: Mutex<Vec<(RelayId, bool)>>,
        push_failures: Mutex<usize>,
    }

    impl FakeSwitches {
        fn new(polls: Vec<Vec<(RelayId, bool)>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                pushes: Mutex::new(Vec::new()),
                push_failures: Mutex::new(0),
            }
        }

        fn failing_pushes(n: usize) -> Self {
            let me = Self::new(vec![]);
            *me.push_failures.lock().unwrap() = n;
            me
        }
    }

    impl SwitchApi for FakeSwitches {
        async fn fetch_states(&self) -> Result<Vec<(RelayId, bool)>, RemoteError> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RemoteError::Service("no more polls".into()))
        }

        async fn push_state(&self, relay: RelayId, on: bool) -> Result<(), RemoteError> {
            let mut failures = self.push_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteError::Service("flaky".into()));
            }
            self.pushes.lock().unwrap().push((relay, on));
            Ok(())
        }
    }

    fn all_off() -> Vec<(RelayId, bool)> {
        RelayId::all().map(|r| (r, false)).collect()
    }

    #[tokio::test]
    async fn first_poll_establishes_baseline_silently() {
        let mut states = all_off();
        states[2].1 = true;
        let mut rec = Reconciler::new(FakeSwitches::new(vec![states]));
        let changes = rec.poll(|_| false).await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(rec.last_known()[2], Some(true));
    }

    #[tokio::test]
    async fn poll_emits_only_diffs() {
        let mut second = all_off();
        second[1].1 = true;
        let mut rec = Reconciler::new(FakeSwitches::new(vec![all_off(), second.clone(), second]));

        assert!(rec.poll(|_| false).await.unwrap().is_empty());
        assert_eq!(
            rec.poll(|_| false).await.unwrap(),
            vec![RemoteChange { relay: r(1), on: true }]
        );
        // Unchanged third poll stays quiet.
        assert!(rec.poll(|_| false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn guard_swallows_the_echo() {
        let mut echo = all_off();
        echo[0].1 = true;
        let mut rec = Reconciler::new(FakeSwitches::new(vec![all_off(), echo.clone(), echo]));
        rec.poll(|_| false).await.unwrap();

        // Guard armed for relay 0: the echo is adopted, not emitted.
        let changes = rec.poll(|relay| relay == r(0)).await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(rec.last_known()[0], Some(true));

        // Guard fires once; the identical follow-up poll is a plain no-diff.
        assert!(rec.poll(|_| false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_retries_once_then_succeeds() {
        let api = FakeSwitches::failing_pushes(1);
        let mut rec = Reconciler::new(api);
        rec.push(r(3), true).await;
        assert_eq!(rec.api.pushes.lock().unwrap().as_slice(), &[(r(3), true)]);
        assert_eq!(rec.last_known()[3], Some(true));
    }

    #[tokio::test]
    async fn push_gives_up_after_second_failure() {
        let api = FakeSwitches::failing_pushes(2);
        let mut rec = Reconciler::new(api);
        rec.push(r(3), true).await;
        assert!(rec.api.pushes.lock().unwrap().is_empty());
        assert_eq!(rec.last_known()[3], None);
    }

    // -- config sync -------------------------------------------------------

    struct FakeAutomation {
        data: SyncData,
    }

    impl AutomationApi for FakeAutomation {
        async fn fetch_sync(&self) -> Result<SyncData, RemoteError> {
            Ok(self.data.clone())
        }
    }

    fn timer_record(relay_id: u8, on: &str, off: &str) -> TimerRecord {
        TimerRecord {
            relay_id,
            slot_id: 0,
            enabled: true,
            days: vec!["monday".into()],
            time_on: Some(on.into()),
            time_off: Some(off.into()),
        }
    }

    #[tokio::test]
    async fn unchanged_token_skips_reload() {
        let sync = ConfigSync::new(FakeAutomation {
            data: SyncData {
                sync_token: "t1".into(),
                timers: vec![timer_record(1, "06:00:00", "07:00:00")],
                sensors: vec![],
            },
        });
        assert_eq!(sync.fetch(Some("t1")).await.unwrap(), None);
        assert!(sync.fetch(Some("t0")).await.unwrap().is_some());
        assert!(sync.fetch(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_records_are_dropped_valid_ones_kept() {
        let sync = ConfigSync::new(FakeAutomation {
            data: SyncData {
                sync_token: "t2".into(),
                timers: vec![
                    timer_record(1, "06:00:00", "07:00:00"),
                    // Inverted window: dropped.
                    timer_record(2, "18:00:00", "08:00:00"),
                    // Relay id out of range: dropped.
                    timer_record(9, "06:00:00", "07:00:00"),
                ],
                sensors: vec![SensorRecord {
                    relay_id: 1,
                    sensor_type: "wind".into(),
                    enabled: true,
                    min_value: 0.0,
                    max_value: 0.0,
                    mode: "min_trigger".into(),
                    hysteresis: 0.0,
                    action: "turn_on".into(),
                }],
            },
        });
        let update = sync.fetch(None).await.unwrap().unwrap();
        assert_eq!(update.token, "t2");
        assert_eq!(update.timers.len(), 1);
        assert_eq!(update.timers[0].relay, r(0));
        assert!(update.sensors.is_empty());
    }
}

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::arbiter::Source;
use crate::ids::{RelayId, RELAY_COUNT};
use crate::sensor::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub relays: [RelayView; RELAY_COUNT],
    pub readings: Option<SensorSnapshot>,
    pub readings_at: Option<OffsetDateTime>,
    pub sync_token: Option<String>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct RelayView {
    pub on: bool,
    /// Who drove the last transition.
    pub source: Option<Source>,
    pub override_active: bool,
    pub timer_active: bool,
    pub sensor_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Relay,
    Override,
    Sync,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub relays: Vec<RelayView>,
    pub readings: Option<SensorSnapshot>,
    pub sync_token: Option<String>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            relays: std::array::from_fn(|_| RelayView {
                on: false,
                source: None,
                override_active: false,
                timer_active: false,
                sensor_active: false,
                last_changed: None,
            }),
            readings: None,
            readings_at: None,
            sync_token: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record an applied relay transition.
    pub fn record_relay(&mut self, relay: RelayId, on: bool, source: Source) {
        let view = &mut self.relays[relay.index()];
        view.on = on;
        view.source = Some(source);
        view.last_changed = Some(OffsetDateTime::now_utc());

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Relay,
            format!("relay {relay} set {state_str} by {}", source.as_str()),
        );
    }

    pub fn record_override(&mut self, relay: RelayId, active: bool, detail: String) {
        self.relays[relay.index()].override_active = active;
        self.push_event(EventKind::Override, detail);
    }

    pub fn set_automation_flags(&mut self, relay: RelayId, timer: bool, sensor: bool) {
        let view = &mut self.relays[relay.index()];
        view.timer_active = timer;
        view.sensor_active = sensor;
    }

    /// Record a round of sensor readings.
    pub fn record_readings(&mut self, snapshot: SensorSnapshot) {
        self.readings = Some(snapshot);
        self.readings_at = Some(OffsetDateTime::now_utc());
    }

    pub fn record_sync(&mut self, token: &str, timers: usize, sensors: usize) {
        self.sync_token = Some(token.to_string());
        self.push_event(
            EventKind::Sync,
            format!("rules replaced: {timers} timers, {sensors} sensor rules (token {token})"),
        );
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            relays: self.relays.to_vec(),
            readings: self.readings,
            sync_token: self.sync_token.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

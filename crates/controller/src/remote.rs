//! Typed clients for the remote services: the switch state service, the
//! automation sync service, telemetry, and the event log.
//!
//! The wire uses camelCase JSON with external relay ids (1 through 4);
//! everything internal is 0 through 3. Conversion happens exactly here, so
//! the rest of the crate never sees an external id.
//!
//! The engine talks to traits, not to these structs, so tests substitute
//! in-memory fakes.

use serde::{Deserialize, Serialize};

use crate::ids::{RelayId, RuleError, DISABLED_MINUTE, SLOTS_PER_RELAY};
use crate::schedule::TimerRule;
use crate::sensor::{SensorKind, SensorRule, TriggerAction, TriggerMode};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service reported failure: {0}")]
    Service(String),
    #[error("malformed record: {0}")]
    Record(String),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRecord {
    pub id: u8,
    pub state: String,
}

impl SwitchRecord {
    /// External id and `"on"`/`"off"` to internal relay and bool.
    pub fn to_desired(&self) -> Result<(RelayId, bool), RemoteError> {
        let relay = RelayId::from_external(self.id)?;
        let on = match self.state.as_str() {
            "on" => true,
            "off" => false,
            other => {
                return Err(RemoteError::Record(format!("switch state {other:?}")));
            }
        };
        Ok((relay, on))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<SyncData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    pub sync_token: String,
    #[serde(default)]
    pub timers: Vec<TimerRecord>,
    #[serde(default)]
    pub sensors: Vec<SensorRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecord {
    pub relay_id: u8,
    pub slot_id: u8,
    pub enabled: bool,
    pub days: Vec<String>,
    /// `"HH:MM:SS"`; absent means the boundary is unset.
    #[serde(default)]
    pub time_on: Option<String>,
    #[serde(default)]
    pub time_off: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    pub relay_id: u8,
    pub sensor_type: String,
    pub enabled: bool,
    pub min_value: f32,
    pub max_value: f32,
    pub mode: String,
    #[serde(default)]
    pub hysteresis: f32,
    pub action: String,
}

fn parse_hms(s: &str) -> Result<u16, RemoteError> {
    let bad = || RemoteError::Record(format!("bad time {s:?}"));
    let mut parts = s.split(':');
    let h: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let m: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let sec: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() || h > 23 || m > 59 || sec > 59 {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

fn parse_day(s: &str) -> Result<usize, RemoteError> {
    // Week starts Monday, matching the rule tables.
    match s {
        "monday" => Ok(0),
        "tuesday" => Ok(1),
        "wednesday" => Ok(2),
        "thursday" => Ok(3),
        "friday" => Ok(4),
        "saturday" => Ok(5),
        "sunday" => Ok(6),
        other => Err(RemoteError::Record(format!("unknown day {other:?}"))),
    }
}

impl TimerRecord {
    pub fn to_rule(&self) -> Result<TimerRule, RemoteError> {
        let relay = RelayId::from_external(self.relay_id)?;
        if self.slot_id >= SLOTS_PER_RELAY {
            return Err(RuleError::SlotOutOfRange(self.slot_id).into());
        }
        let mut days = [false; 7];
        for name in &self.days {
            days[parse_day(name)?] = true;
        }
        let time_on = match &self.time_on {
            Some(s) => parse_hms(s)?,
            None => DISABLED_MINUTE,
        };
        let time_off = match &self.time_off {
            Some(s) => parse_hms(s)?,
            None => DISABLED_MINUTE,
        };
        let rule = TimerRule {
            relay,
            slot: self.slot_id,
            enabled: self.enabled,
            days,
            time_on,
            time_off,
        };
        rule.validate()?;
        Ok(rule)
    }
}

impl SensorRecord {
    pub fn to_rule(&self) -> Result<SensorRule, RemoteError> {
        let relay = RelayId::from_external(self.relay_id)?;
        let kind = SensorKind::parse(&self.sensor_type)?;
        let mode = TriggerMode::parse(&self.mode)?;
        let action = match self.action.as_str() {
            "turn_on" | "on" => TriggerAction::TurnOn,
            "turn_off" | "off" => TriggerAction::TurnOff,
            other => return Err(RemoteError::Record(format!("unknown action {other:?}"))),
        };
        Ok(SensorRule {
            relay,
            kind,
            enabled: self.enabled,
            min_value: self.min_value,
            max_value: self.max_value,
            mode,
            hysteresis: self.hysteresis,
            action,
        })
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchUpdate<'a> {
    state: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord<'a> {
    pub device_id: &'a str,
    pub relay_id: u8,
    pub state: &'a str,
    pub previous: &'a str,
    pub source: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
}

/// Readings are rounded before leaving the device: one decimal for
/// temperature, humidity and soil moisture, two for light.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub device_id: String,
    pub site_id: String,
    pub room_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub soil_moisture: Option<f32>,
    pub light: Option<f32>,
    pub rssi: Option<i32>,
    pub relays: [bool; crate::ids::RELAY_COUNT],
}

pub fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

pub fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Traits the engine and reconciler depend on
// ---------------------------------------------------------------------------

pub trait SwitchApi {
    fn fetch_states(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(RelayId, bool)>, RemoteError>> + Send;

    fn push_state(
        &self,
        relay: RelayId,
        on: bool,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;
}

pub trait AutomationApi {
    fn fetch_sync(
        &self,
    ) -> impl std::future::Future<Output = Result<SyncData, RemoteError>> + Send;
}

pub trait TelemetryApi {
    fn post_telemetry(
        &self,
        report: &TelemetryReport,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    fn log_event(
        &self,
        event: &EventRecord<'_>,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: &str, user_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            user_id: user_id.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl SwitchApi for RemoteClient {
    async fn fetch_states(&self) -> Result<Vec<(RelayId, bool)>, RemoteError> {
        let records: Vec<SwitchRecord> = self
            .http
            .get(self.url("/api/switches"))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        records.iter().map(SwitchRecord::to_desired).collect()
    }

    async fn push_state(&self, relay: RelayId, on: bool) -> Result<(), RemoteError> {
        let state = if on { "on" } else { "off" };
        self.http
            .put(self.url(&format!("/api/switches/{}", relay.external())))
            .bearer_auth(&self.api_key)
            .json(&SwitchUpdate { state })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl AutomationApi for RemoteClient {
    async fn fetch_sync(&self) -> Result<SyncData, RemoteError> {
        let envelope: SyncEnvelope = self
            .http
            .get(self.url("/api/sync"))
            .query(&[("userId", self.user_id.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !envelope.success {
            let reason = envelope.error.unwrap_or_else(|| "unspecified".to_string());
            return Err(RemoteError::Service(reason));
        }
        envelope
            .data
            .ok_or_else(|| RemoteError::Service("success with no data".to_string()))
    }
}

impl TelemetryApi for RemoteClient {
    async fn post_telemetry(&self, report: &TelemetryReport) -> Result<(), RemoteError> {
        self.http
            .post(self.url("/api/telemetry"))
            .bearer_auth(&self.api_key)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn log_event(&self, event: &EventRecord<'_>) -> Result<(), RemoteError> {
        self.http
            .post(self.url("/api/events"))
            .bearer_auth(&self.api_key)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

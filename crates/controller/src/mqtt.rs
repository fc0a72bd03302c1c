use serde::Deserialize;

use crate::ids::{RelayId, RuleError};
use crate::schedule::TimerRule;
use crate::sensor::{SensorKind, SensorRule, TriggerAction, TriggerMode};

// ---------------------------------------------------------------------------
// Command types
//
// Topics use device-local relay ids (0-3) under a configurable prefix:
//   <prefix>/relay/<id>/set          payload "ON" | "OFF"
//   <prefix>/override/<id>/set       JSON OverrideMsg
//   <prefix>/override/<id>/cancel    (payload ignored)
//   <prefix>/timer/<id>/<slot>/set   JSON TimerMsg
//   <prefix>/sensor/<id>/<type>/set  JSON SensorMsg
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    SetRelay {
        relay: RelayId,
        on: bool,
    },
    SetOverride {
        relay: RelayId,
        on: bool,
        duration_minutes: Option<u32>,
        reason: Option<String>,
    },
    CancelOverride {
        relay: RelayId,
    },
    EditTimer {
        rule: TimerRule,
    },
    EditSensor {
        rule: SensorRule,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct OverrideMsg {
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) duration_minutes: Option<u32>,
    #[serde(default)]
    pub(crate) reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SensorMsg {
    pub(crate) enabled: bool,
    pub(crate) min_value: f32,
    pub(crate) max_value: f32,
    pub(crate) mode: String,
    #[serde(default)]
    pub(crate) hysteresis: f32,
    pub(crate) action: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimerMsg {
    pub(crate) enabled: bool,
    pub(crate) days: [bool; 7],
    pub(crate) time_on: u16,
    pub(crate) time_off: u16,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_payload(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown relay command '{s}'")),
    }
}

fn parse_relay_id(segment: &str) -> Result<RelayId, String> {
    let id: u8 = segment
        .parse()
        .map_err(|_| format!("bad relay id '{segment}'"))?;
    RelayId::new(id).map_err(|e| e.to_string())
}

/// Decode one incoming publish. `Ok(None)` means the topic is not one of
/// ours; `Err` means the topic matched but the payload did not.
pub(crate) fn parse_command(
    prefix: &str,
    topic: &str,
    payload: &[u8],
) -> Result<Option<Command>, String> {
    let Some(rest) = topic.strip_prefix(prefix).and_then(|t| t.strip_prefix('/')) else {
        return Ok(None);
    };
    let parts: Vec<&str> = rest.split('/').collect();

    match parts.as_slice() {
        ["relay", id, "set"] => {
            let relay = parse_relay_id(id)?;
            let on = parse_switch_payload(payload)?;
            Ok(Some(Command::SetRelay { relay, on }))
        }
        ["override", id, "set"] => {
            let relay = parse_relay_id(id)?;
            let msg: OverrideMsg = serde_json::from_slice(payload)
                .map_err(|e| format!("bad override payload: {e}"))?;
            let on = parse_switch_payload(msg.state.as_bytes())?;
            if msg.duration_minutes == Some(0) {
                return Err(RuleError::BadDuration.to_string());
            }
            Ok(Some(Command::SetOverride {
                relay,
                on,
                duration_minutes: msg.duration_minutes,
                reason: msg.reason,
            }))
        }
        ["override", id, "cancel"] => {
            let relay = parse_relay_id(id)?;
            Ok(Some(Command::CancelOverride { relay }))
        }
        ["timer", id, slot, "set"] => {
            let relay = parse_relay_id(id)?;
            let slot: u8 = slot.parse().map_err(|_| format!("bad slot id '{slot}'"))?;
            let msg: TimerMsg = serde_json::from_slice(payload)
                .map_err(|e| format!("bad timer payload: {e}"))?;
            let rule = TimerRule {
                relay,
                slot,
                enabled: msg.enabled,
                days: msg.days,
                time_on: msg.time_on,
                time_off: msg.time_off,
            };
            rule.validate().map_err(|e| e.to_string())?;
            Ok(Some(Command::EditTimer { rule }))
        }
        ["sensor", id, stype, "set"] => {
            let relay = parse_relay_id(id)?;
            let kind = SensorKind::parse(stype).map_err(|e| e.to_string())?;
            let msg: SensorMsg = serde_json::from_slice(payload)
                .map_err(|e| format!("bad sensor payload: {e}"))?;
            let rule = SensorRule {
                relay,
                kind,
                enabled: msg.enabled,
                min_value: msg.min_value,
                max_value: msg.max_value,
                mode: TriggerMode::parse(&msg.mode).map_err(|e| e.to_string())?,
                hysteresis: msg.hysteresis,
                action: TriggerAction::parse(&msg.action).map_err(|e| e.to_string())?,
            };
            Ok(Some(Command::EditSensor { rule }))
        }
        _ => Ok(None),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: u8) -> RelayId {
        RelayId::new(id).unwrap()
    }

    // -- parse_switch_payload ------------------------------------------------

    #[test]
    fn switch_payload_on_uppercase() {
        assert_eq!(parse_switch_payload(b"ON"), Ok(true));
    }

    #[test]
    fn switch_payload_off_mixed_case() {
        assert_eq!(parse_switch_payload(b"oFf"), Ok(false));
    }

    #[test]
    fn switch_payload_with_whitespace() {
        assert_eq!(parse_switch_payload(b"  ON  "), Ok(true));
        assert_eq!(parse_switch_payload(b"\toff\n"), Ok(false));
    }

    #[test]
    fn switch_payload_garbage() {
        assert!(parse_switch_payload(b"TOGGLE").is_err());
        assert!(parse_switch_payload(b"").is_err());
    }

    // -- relay set ------------------------------------------------------------

    #[test]
    fn relay_set_valid() {
        let cmd = parse_command("relays", "relays/relay/2/set", b"ON").unwrap();
        assert_eq!(cmd, Some(Command::SetRelay { relay: r(2), on: true }));
    }

    #[test]
    fn relay_set_bad_id() {
        assert!(parse_command("relays", "relays/relay/4/set", b"ON").is_err());
        assert!(parse_command("relays", "relays/relay/x/set", b"ON").is_err());
    }

    #[test]
    fn relay_set_bad_payload() {
        assert!(parse_command("relays", "relays/relay/0/set", b"MAYBE").is_err());
    }

    // -- foreign topics --------------------------------------------------------

    #[test]
    fn foreign_prefix_ignored() {
        assert_eq!(parse_command("relays", "other/relay/0/set", b"ON"), Ok(None));
    }

    #[test]
    fn unknown_suffix_ignored() {
        assert_eq!(parse_command("relays", "relays/relay/0/get", b""), Ok(None));
        assert_eq!(parse_command("relays", "relays/relay/0", b""), Ok(None));
        assert_eq!(parse_command("relays", "relays", b""), Ok(None));
    }

    // -- override --------------------------------------------------------------

    #[test]
    fn override_set_valid() {
        let payload = br#"{"state":"on","duration_minutes":30,"reason":"maintenance"}"#;
        let cmd = parse_command("relays", "relays/override/1/set", payload).unwrap();
        assert_eq!(
            cmd,
            Some(Command::SetOverride {
                relay: r(1),
                on: true,
                duration_minutes: Some(30),
                reason: Some("maintenance".into()),
            })
        );
    }

    #[test]
    fn override_set_minimal() {
        let cmd = parse_command("relays", "relays/override/0/set", br#"{"state":"OFF"}"#).unwrap();
        assert_eq!(
            cmd,
            Some(Command::SetOverride {
                relay: r(0),
                on: false,
                duration_minutes: None,
                reason: None,
            })
        );
    }

    #[test]
    fn override_set_zero_duration_rejected() {
        let payload = br#"{"state":"on","duration_minutes":0}"#;
        assert!(parse_command("relays", "relays/override/0/set", payload).is_err());
    }

    #[test]
    fn override_set_bad_json() {
        assert!(parse_command("relays", "relays/override/0/set", b"on").is_err());
    }

    #[test]
    fn override_cancel() {
        let cmd = parse_command("relays", "relays/override/3/cancel", b"").unwrap();
        assert_eq!(cmd, Some(Command::CancelOverride { relay: r(3) }));
    }

    // -- timer edit --------------------------------------------------------------

    #[test]
    fn timer_edit_valid() {
        let payload = br#"{
            "enabled": true,
            "days": [true, true, true, true, true, false, false],
            "time_on": 480,
            "time_off": 1080
        }"#;
        let cmd = parse_command("relays", "relays/timer/2/0/set", payload).unwrap();
        match cmd {
            Some(Command::EditTimer { rule }) => {
                assert_eq!(rule.relay, r(2));
                assert_eq!(rule.slot, 0);
                assert_eq!(rule.time_on, 480);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn timer_edit_invalid_rule_rejected() {
        // Inverted window fails rule validation.
        let payload = br#"{
            "enabled": true,
            "days": [true, false, false, false, false, false, false],
            "time_on": 1080,
            "time_off": 480
        }"#;
        assert!(parse_command("relays", "relays/timer/0/0/set", payload).is_err());
    }

    #[test]
    fn timer_edit_bad_slot() {
        let payload = br#"{
            "enabled": true,
            "days": [true, false, false, false, false, false, false],
            "time_on": 480,
            "time_off": 1080
        }"#;
        assert!(parse_command("relays", "relays/timer/0/3/set", payload).is_err());
        assert!(parse_command("relays", "relays/timer/0/x/set", payload).is_err());
    }

    // -- sensor edit --------------------------------------------------------------

    #[test]
    fn sensor_edit_valid() {
        let payload = br#"{
            "enabled": true,
            "min_value": 30.0,
            "max_value": 0.0,
            "mode": "min_trigger",
            "hysteresis": 5.0,
            "action": "turn_on"
        }"#;
        let cmd = parse_command("relays", "relays/sensor/1/soil_moisture/set", payload).unwrap();
        match cmd {
            Some(Command::EditSensor { rule }) => {
                assert_eq!(rule.relay, r(1));
                assert_eq!(rule.kind, SensorKind::SoilMoisture);
                assert_eq!(rule.min_value, 30.0);
                assert_eq!(rule.mode, TriggerMode::MinTrigger);
                assert_eq!(rule.action, TriggerAction::TurnOn);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sensor_edit_default_hysteresis() {
        let payload = br#"{
            "enabled": true,
            "min_value": 18.0,
            "max_value": 28.0,
            "mode": "range",
            "action": "turn_off"
        }"#;
        let cmd = parse_command("relays", "relays/sensor/0/temperature/set", payload).unwrap();
        match cmd {
            Some(Command::EditSensor { rule }) => assert_eq!(rule.hysteresis, 0.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sensor_edit_unknown_type_rejected() {
        let payload = br#"{
            "enabled": true,
            "min_value": 30.0,
            "max_value": 0.0,
            "mode": "min_trigger",
            "action": "turn_on"
        }"#;
        assert!(parse_command("relays", "relays/sensor/0/pressure/set", payload).is_err());
    }

    #[test]
    fn sensor_edit_bad_mode_or_action_rejected() {
        let bad_mode = br#"{
            "enabled": true,
            "min_value": 30.0,
            "max_value": 0.0,
            "mode": "threshold",
            "action": "turn_on"
        }"#;
        assert!(parse_command("relays", "relays/sensor/0/humidity/set", bad_mode).is_err());

        let bad_action = br#"{
            "enabled": true,
            "min_value": 30.0,
            "max_value": 0.0,
            "mode": "min_trigger",
            "action": "toggle"
        }"#;
        assert!(parse_command("relays", "relays/sensor/0/humidity/set", bad_action).is_err());
    }

    #[test]
    fn sensor_edit_bad_json() {
        assert!(parse_command("relays", "relays/sensor/0/light/set", b"{").is_err());
    }
}

//! Per-relay sensor threshold rules with hysteresis dead-banding.
//!
//! Each (relay, sensor type) pair carries a latch: the remembered "active"
//! flag from the previous evaluation. Inside the dead-band around a
//! threshold the latch holds its value, which is what prevents on/off
//! chatter when a reading hovers near the boundary (Schmitt trigger).
//!
//! An evaluator decision is a *request*, not a command: a `turn_on` rule
//! that goes inactive simply stops requesting — it never turns the relay
//! off on its own.

use serde::{Deserialize, Serialize};

use crate::ids::{RelayId, RuleError, RELAY_COUNT};

/// Sensor channels, in arbitration evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    SoilMoisture,
    Humidity,
    Light,
}

impl SensorKind {
    /// Evaluation order: later decisions win within one control cycle.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Temperature,
        SensorKind::SoilMoisture,
        SensorKind::Humidity,
        SensorKind::Light,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::SoilMoisture => "soil_moisture",
            SensorKind::Humidity => "humidity",
            SensorKind::Light => "light",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RuleError> {
        match s {
            "temperature" => Ok(SensorKind::Temperature),
            "soil_moisture" => Ok(SensorKind::SoilMoisture),
            "humidity" => Ok(SensorKind::Humidity),
            "light" => Ok(SensorKind::Light),
            other => Err(RuleError::UnknownSensorType(other.to_string())),
        }
    }

    fn index(self) -> usize {
        match self {
            SensorKind::Temperature => 0,
            SensorKind::SoilMoisture => 1,
            SensorKind::Humidity => 2,
            SensorKind::Light => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    MinTrigger,
    MaxTrigger,
    Range,
}

impl TriggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::MinTrigger => "min_trigger",
            TriggerMode::MaxTrigger => "max_trigger",
            TriggerMode::Range => "range",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RuleError> {
        match s {
            "min_trigger" => Ok(TriggerMode::MinTrigger),
            "max_trigger" => Ok(TriggerMode::MaxTrigger),
            "range" => Ok(TriggerMode::Range),
            other => Err(RuleError::UnknownControlMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    TurnOn,
    TurnOff,
}

impl TriggerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerAction::TurnOn => "turn_on",
            TriggerAction::TurnOff => "turn_off",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RuleError> {
        match s {
            "turn_on" => Ok(TriggerAction::TurnOn),
            "turn_off" => Ok(TriggerAction::TurnOff),
            other => Err(RuleError::UnknownControlMode(other.to_string())),
        }
    }
}

/// One threshold rule. At most one per (relay, sensor type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRule {
    pub relay: RelayId,
    pub kind: SensorKind,
    pub enabled: bool,
    pub min_value: f32,
    pub max_value: f32,
    pub mode: TriggerMode,
    pub hysteresis: f32,
    pub action: TriggerAction,
}

impl SensorRule {
    /// Effective dead-band half-width; a non-positive configured value
    /// falls back to 1.0.
    pub fn band(&self) -> f32 {
        if self.hysteresis > 0.0 {
            self.hysteresis
        } else {
            1.0
        }
    }
}

/// Outcome of evaluating one enabled rule against a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Latch state after this reading.
    pub trigger: bool,
    /// Direction requested when triggered (`action != turn_off`).
    pub turn_on: bool,
}

/// Rule table plus the per-(relay, type) latches. Latches reset at boot
/// only; a configuration replacement keeps them.
pub struct ThresholdEvaluator {
    rules: Vec<SensorRule>,
    latch: [[bool; 4]; RELAY_COUNT],
    generation: u64,
}

impl Default for ThresholdEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThresholdEvaluator {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            latch: [[false; 4]; RELAY_COUNT],
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[SensorRule] {
        &self.rules
    }

    /// Replace the whole table (remote sync). Latches are kept.
    pub fn replace_all(&mut self, rules: Vec<SensorRule>) {
        self.rules = rules;
        self.generation += 1;
    }

    /// Insert or update one rule (local edit path). The latch for the
    /// pair is kept; the new band applies from the next evaluation.
    pub fn upsert(&mut self, rule: SensorRule) {
        match self
            .rules
            .iter_mut()
            .find(|r| r.relay == rule.relay && r.kind == rule.kind)
        {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// True when the relay has at least one enabled sensor rule.
    pub fn has_enabled_rule(&self, relay: RelayId) -> bool {
        self.rules.iter().any(|r| r.relay == relay && r.enabled)
    }

    /// Run one reading through the rule for (relay, kind). `None` when no
    /// enabled rule exists. The latch is updated on every call, triggered
    /// or not — that update is the dead-band memory.
    pub fn evaluate(&mut self, relay: RelayId, kind: SensorKind, value: f32) -> Option<Evaluation> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.relay == relay && r.kind == kind && r.enabled)?;

        let h = rule.band();
        let previous = self.latch[relay.index()][kind.index()];

        let active = match rule.mode {
            TriggerMode::MinTrigger => {
                if value < rule.min_value - h {
                    true
                } else if value > rule.min_value + h {
                    false
                } else {
                    previous
                }
            }
            TriggerMode::MaxTrigger => {
                if value > rule.max_value + h {
                    true
                } else if value < rule.max_value - h {
                    false
                } else {
                    previous
                }
            }
            TriggerMode::Range => {
                if value < rule.min_value - h || value > rule.max_value + h {
                    true
                } else if value >= rule.min_value + h && value <= rule.max_value - h {
                    false
                } else {
                    previous
                }
            }
        };

        self.latch[relay.index()][kind.index()] = active;

        Some(Evaluation {
            trigger: active,
            turn_on: rule.action != TriggerAction::TurnOff,
        })
    }
}

// ---------------------------------------------------------------------------
// Sampling source
// ---------------------------------------------------------------------------

/// One round of readings. `None` means the channel has no sensor attached
/// (or the read failed); absent channels are never evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f32>,
    pub soil_moisture: Option<f32>,
    pub humidity: Option<f32>,
    pub light: Option<f32>,
}

impl SensorSnapshot {
    pub fn value(&self, kind: SensorKind) -> Option<f32> {
        match kind {
            SensorKind::Temperature => self.temperature,
            SensorKind::SoilMoisture => self.soil_moisture,
            SensorKind::Humidity => self.humidity,
            SensorKind::Light => self.light,
        }
    }
}

/// Where readings come from. Acquisition details (I2C, calibration) are a
/// collaborator concern; the engine only consumes snapshots.
pub trait SensorSource {
    fn sample(&mut self) -> SensorSnapshot;
}

/// Source for builds with no acquisition hardware wired up: every channel
/// reads absent, so sensor rules simply never fire.
#[cfg(not(feature = "sim"))]
pub struct NullSource;

#[cfg(not(feature = "sim"))]
impl SensorSource for NullSource {
    fn sample(&mut self) -> SensorSnapshot {
        SensorSnapshot::default()
    }
}

/// Simulated readings for development: values random-walk inside plausible
/// ranges so thresholds and hysteresis can be exercised without hardware.
#[cfg(feature = "sim")]
pub struct SimSource {
    temperature: f32,
    soil_moisture: f32,
    humidity: f32,
    light: f32,
}

#[cfg(feature = "sim")]
impl Default for SimSource {
    fn default() -> Self {
        Self {
            temperature: 28.0,
            soil_moisture: 55.0,
            humidity: 70.0,
            light: 12.0,
        }
    }
}

#[cfg(feature = "sim")]
impl SimSource {
    fn walk(value: &mut f32, step: f32, lo: f32, hi: f32) {
        *value += (fastrand::f32() - 0.5) * 2.0 * step;
        *value = value.clamp(lo, hi);
    }
}

#[cfg(feature = "sim")]
impl SensorSource for SimSource {
    fn sample(&mut self) -> SensorSnapshot {
        Self::walk(&mut self.temperature, 0.4, 15.0, 45.0);
        Self::walk(&mut self.soil_moisture, 1.5, 0.0, 100.0);
        Self::walk(&mut self.humidity, 1.0, 20.0, 100.0);
        Self::walk(&mut self.light, 0.8, 0.0, 60.0);
        SensorSnapshot {
            temperature: Some(self.temperature),
            soil_moisture: Some(self.soil_moisture),
            humidity: Some(self.humidity),
            light: Some(self.light),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

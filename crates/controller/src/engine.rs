//! The control engine: one task that owns every relay decision.
//!
//! All periodic work (sampling, rule evaluation, remote reconciliation,
//! telemetry) and all local commands are multiplexed onto this single task,
//! so there is exactly one writer of relay state and no lock ordering to
//! get wrong.
//!
//! ## Decision precedence per control cycle
//!
//! 1. Expire overrides; released relays fall back to automation this cycle.
//! 2. An active override pins its relay, full stop.
//! 3. Schedule rules propose a state; sensor rules evaluated afterwards
//!    (temperature, soil moisture, humidity, light) may overrule it. A
//!    sensor rule whose trigger is inactive proposes nothing.
//! 4. Remote desired-state changes only land on relays with no enabled
//!    automation rules and no override.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::arbiter::{AppliedChange, Arbiter, Source};
use crate::db::Db;
use crate::ids::RelayId;
use crate::mqtt::Command;
use crate::overrides::OverrideManager;
use crate::remote::{
    round1, round2, AutomationApi, EventRecord, SwitchApi, TelemetryApi, TelemetryReport,
};
use crate::schedule::ScheduleStore;
use crate::sensor::{SensorKind, SensorSnapshot, SensorSource, ThresholdEvaluator};
use crate::state::SharedState;
use crate::sync::{ConfigSync, Reconciler};
use time::{OffsetDateTime, UtcOffset};

/// Telemetry is sent early (before the interval elapses) when a reading
/// moved at least this much since the last report.
const TEMP_DELTA: f32 = 4.0;
const SOIL_DELTA: f32 = 20.0;

// ---------------------------------------------------------------------------
// Decision core
// ---------------------------------------------------------------------------

pub(crate) struct Engine {
    pub(crate) arbiter: Arbiter,
    pub(crate) schedule: ScheduleStore,
    pub(crate) evaluator: ThresholdEvaluator,
    pub(crate) overrides: OverrideManager,
}

impl Engine {
    pub(crate) fn new(arbiter: Arbiter) -> Self {
        Self {
            arbiter,
            schedule: ScheduleStore::new(),
            evaluator: ThresholdEvaluator::new(),
            overrides: OverrideManager::new(),
        }
    }

    /// True when automation rules own this relay's state.
    pub(crate) fn automation_enabled(&self, relay: RelayId) -> bool {
        self.schedule.has_enabled_rule(relay) || self.evaluator.has_enabled_rule(relay)
    }

    /// One evaluation pass over every relay. Returns the transitions that
    /// actually reached hardware, plus the relays whose override expired.
    pub(crate) fn control_cycle(
        &mut self,
        minute_of_day: u16,
        day_of_week: u8,
        snapshot: Option<&SensorSnapshot>,
        now: Instant,
    ) -> (Vec<AppliedChange>, Vec<RelayId>) {
        let released = self.overrides.expire(now);
        let mut applied = Vec::new();

        for relay in RelayId::all() {
            if let Some(pinned) = self.overrides.desired(relay, now) {
                applied.extend(self.arbiter.request_state(relay, pinned, Source::Manual));
                continue;
            }

            let mut decision = self
                .schedule
                .should_be_on(relay, minute_of_day, day_of_week)
                .map(|on| (on, Source::Schedule));

            if let Some(snapshot) = snapshot {
                for kind in SensorKind::ALL {
                    let Some(value) = snapshot.value(kind) else {
                        continue;
                    };
                    if let Some(eval) = self.evaluator.evaluate(relay, kind, value) {
                        if eval.trigger {
                            decision = Some((eval.turn_on, Source::Sensor));
                        }
                    }
                }
            }

            if let Some((on, source)) = decision {
                applied.extend(self.arbiter.request_state(relay, on, source));
            }
        }

        (applied, released)
    }

    /// Apply one remote desired-state change. Relays under automation or
    /// an override ignore the remote service.
    pub(crate) fn apply_remote(
        &mut self,
        relay: RelayId,
        on: bool,
        now: Instant,
    ) -> Option<AppliedChange> {
        if self.automation_enabled(relay) {
            debug!(relay = %relay, "remote change ignored, relay is automated");
            return None;
        }
        if self.overrides.is_active(relay, now) {
            debug!(relay = %relay, "remote change ignored, override active");
            return None;
        }
        self.arbiter.request_state(relay, on, Source::Remote)
    }

    /// Apply one local command. Rule edits are returned to the caller for
    /// persistence.
    pub(crate) fn handle_command(
        &mut self,
        command: Command,
        now: Instant,
    ) -> CommandOutcome {
        match command {
            Command::SetRelay { relay, on } => {
                CommandOutcome::Applied(self.arbiter.request_state(relay, on, Source::Manual))
            }
            Command::SetOverride {
                relay,
                on,
                duration_minutes,
                reason,
            } => {
                self.overrides.set(relay, on, duration_minutes, reason, now);
                CommandOutcome::OverrideSet {
                    relay,
                    applied: self.arbiter.request_state(relay, on, Source::Manual),
                }
            }
            Command::CancelOverride { relay } => CommandOutcome::OverrideCancelled {
                relay,
                was_active: self.overrides.cancel(relay),
            },
            Command::EditTimer { rule } => {
                // Validated at the MQTT boundary; a TOCTOU failure here is a bug.
                match self.schedule.upsert(rule.clone()) {
                    Ok(()) => CommandOutcome::TimerEdited(rule),
                    Err(err) => CommandOutcome::Rejected(err.to_string()),
                }
            }
            Command::EditSensor { rule } => {
                self.evaluator.upsert(rule.clone());
                CommandOutcome::SensorEdited(rule)
            }
        }
    }
}

pub(crate) enum CommandOutcome {
    Applied(Option<AppliedChange>),
    OverrideSet {
        relay: RelayId,
        applied: Option<AppliedChange>,
    },
    OverrideCancelled {
        relay: RelayId,
        was_active: bool,
    },
    TimerEdited(crate::schedule::TimerRule),
    SensorEdited(crate::sensor::SensorRule),
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Clock and telemetry helpers
// ---------------------------------------------------------------------------

/// Local wall-clock minute of day and day of week (Monday = 0).
fn local_clock(utc_offset_minutes: i32) -> (u16, u8) {
    let offset =
        UtcOffset::from_whole_seconds(utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC);
    let now = OffsetDateTime::now_utc().to_offset(offset);
    let minute = u16::from(now.hour()) * 60 + u16::from(now.minute());
    (minute, now.weekday().number_days_from_monday())
}

/// Early-send check: did a reading move enough to be worth reporting now?
fn telemetry_due(last: &SensorSnapshot, current: &SensorSnapshot) -> bool {
    let moved = |a: Option<f32>, b: Option<f32>, delta: f32| match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() >= delta,
        (None, Some(_)) | (Some(_), None) => true,
        (None, None) => false,
    };
    moved(last.temperature, current.temperature, TEMP_DELTA)
        || moved(last.soil_moisture, current.soil_moisture, SOIL_DELTA)
}

fn build_report(
    device_id: &str,
    site_id: &str,
    room_id: &str,
    snapshot: &SensorSnapshot,
    relays: [bool; crate::ids::RELAY_COUNT],
) -> TelemetryReport {
    TelemetryReport {
        device_id: device_id.to_string(),
        site_id: site_id.to_string(),
        room_id: room_id.to_string(),
        timestamp: OffsetDateTime::now_utc(),
        temperature: snapshot.temperature.map(round1),
        humidity: snapshot.humidity.map(round1),
        soil_moisture: snapshot.soil_moisture.map(round1),
        light: snapshot.light.map(round2),
        rssi: None,
        relays,
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

pub struct EngineSettings {
    pub utc_offset_minutes: i32,
    pub sample: Duration,
    pub evaluate: Duration,
    pub switch_poll: Duration,
    pub rule_sync: Duration,
    pub telemetry: Duration,
    pub device_id: String,
    pub site_id: String,
    pub room_id: String,
}

/// Remote collaborators; each is `None` when the feature is disabled.
pub struct RemoteHandles<S, A, T> {
    pub switches: Option<Reconciler<S>>,
    pub rules: Option<ConfigSync<A>>,
    pub telemetry: Option<T>,
}

/// Run the engine loop. Intended to be `tokio::spawn`-ed from main.
pub(crate) async fn run<S, A, T>(
    settings: EngineSettings,
    db: Db,
    mut engine: Engine,
    shared: SharedState,
    mut commands: mpsc::Receiver<Command>,
    mut source: impl SensorSource,
    mut remote: RemoteHandles<S, A, T>,
) where
    S: SwitchApi,
    A: AutomationApi,
    T: TelemetryApi,
{
    // Boot: persisted rules are authoritative until the first sync.
    match db.load_timer_rules().await {
        Ok(rules) => engine.schedule.replace_all(rules),
        Err(err) => error!("failed to load timer rules: {err:#}"),
    }
    match db.load_sensor_rules().await {
        Ok(rules) => engine.evaluator.replace_all(rules),
        Err(err) => error!("failed to load sensor rules: {err:#}"),
    }
    let mut sync_token = match db.sync_token().await {
        Ok(token) => token,
        Err(err) => {
            error!("failed to load sync token: {err:#}");
            None
        }
    };

    info!(
        timers = engine.schedule.rules().len(),
        sensors = engine.evaluator.rules().len(),
        switch_sync = remote.switches.is_some(),
        rule_sync = remote.rules.is_some(),
        telemetry = remote.telemetry.is_some(),
        "engine started"
    );

    let mut sample_tick = tokio::time::interval(settings.sample);
    let mut evaluate_tick = tokio::time::interval(settings.evaluate);
    let mut switch_tick = tokio::time::interval(settings.switch_poll);
    let mut rules_tick = tokio::time::interval(settings.rule_sync);
    let mut telemetry_tick = tokio::time::interval(settings.telemetry);

    let mut snapshot: Option<SensorSnapshot> = None;
    let mut last_reported: Option<SensorSnapshot> = None;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    info!("command channel closed, engine stopping");
                    return;
                };
                let outcome = engine.handle_command(cmd, Instant::now());
                handle_outcome(outcome, &db, &shared, &mut remote, &settings).await;
            }

            _ = sample_tick.tick() => {
                let s = source.sample();
                snapshot = Some(s);
                shared.write().await.record_readings(s);

                let early = last_reported
                    .as_ref()
                    .is_some_and(|last| telemetry_due(last, &s));
                if early {
                    send_telemetry(&settings, &mut remote, &s, &engine, &mut last_reported).await;
                }
            }

            _ = evaluate_tick.tick() => {
                let (minute, day) = local_clock(settings.utc_offset_minutes);
                let (applied, released) =
                    engine.control_cycle(minute, day, snapshot.as_ref(), Instant::now());

                for relay in released {
                    info!(relay = %relay, "override expired");
                    shared.write().await.record_override(
                        relay,
                        false,
                        format!("override on relay {relay} expired"),
                    );
                }
                for change in applied {
                    publish_change(change, &shared, &mut remote, &settings).await;
                }
                for relay in RelayId::all() {
                    let timer = engine.schedule.has_enabled_rule(relay);
                    let sensor = engine.evaluator.has_enabled_rule(relay);
                    shared.write().await.set_automation_flags(relay, timer, sensor);
                }
            }

            _ = switch_tick.tick(), if remote.switches.is_some() => {
                let Some(reconciler) = remote.switches.as_mut() else { continue };
                match reconciler.poll(|relay| engine.arbiter.consume_guard(relay)).await {
                    Ok(changes) => {
                        let now = Instant::now();
                        for change in changes {
                            if let Some(applied) = engine.apply_remote(change.relay, change.on, now) {
                                publish_change(applied, &shared, &mut remote, &settings).await;
                            }
                        }
                    }
                    Err(err) => {
                        warn!("switch poll failed: {err}");
                        shared.write().await.record_error(format!("switch poll failed: {err}"));
                    }
                }
            }

            _ = rules_tick.tick(), if remote.rules.is_some() => {
                let Some(rules) = remote.rules.as_ref() else { continue };
                match rules.fetch(sync_token.as_deref()).await {
                    Ok(None) => {}
                    Ok(Some(update)) => {
                        if let Err(err) = db
                            .replace_automation(&update.token, &update.timers, &update.sensors)
                            .await
                        {
                            error!("failed to persist synced rules: {err:#}");
                            continue;
                        }
                        info!(
                            token = %update.token,
                            timers = update.timers.len(),
                            sensors = update.sensors.len(),
                            "automation rules replaced"
                        );
                        shared.write().await.record_sync(
                            &update.token,
                            update.timers.len(),
                            update.sensors.len(),
                        );
                        engine.schedule.replace_all(update.timers);
                        engine.evaluator.replace_all(update.sensors);
                        sync_token = Some(update.token);
                    }
                    Err(err) => {
                        warn!("rule sync failed: {err}");
                        shared.write().await.record_error(format!("rule sync failed: {err}"));
                    }
                }
            }

            _ = telemetry_tick.tick(), if remote.telemetry.is_some() => {
                if let Some(s) = snapshot {
                    send_telemetry(&settings, &mut remote, &s, &engine, &mut last_reported).await;
                }
            }
        }
    }
}

async fn handle_outcome<S: SwitchApi, A, T: TelemetryApi>(
    outcome: CommandOutcome,
    db: &Db,
    shared: &SharedState,
    remote: &mut RemoteHandles<S, A, T>,
    settings: &EngineSettings,
) {
    match outcome {
        CommandOutcome::Applied(applied) => {
            if let Some(change) = applied {
                publish_change(change, shared, remote, settings).await;
            }
        }
        CommandOutcome::OverrideSet { relay, applied } => {
            shared
                .write()
                .await
                .record_override(relay, true, format!("override set on relay {relay}"));
            if let Some(change) = applied {
                publish_change(change, shared, remote, settings).await;
            }
        }
        CommandOutcome::OverrideCancelled { relay, was_active } => {
            if was_active {
                shared.write().await.record_override(
                    relay,
                    false,
                    format!("override on relay {relay} cancelled"),
                );
            }
        }
        CommandOutcome::TimerEdited(rule) => {
            if let Err(err) = db.upsert_timer_rule(&rule).await {
                // In-memory copy stays; the next rule sync reconciles.
                error!("failed to persist timer edit: {err:#}");
            }
            shared.write().await.record_system(format!(
                "timer rule {}:{} updated locally",
                rule.relay, rule.slot
            ));
        }
        CommandOutcome::SensorEdited(rule) => {
            if let Err(err) = db.upsert_sensor_rule(&rule).await {
                // In-memory copy stays; the next rule sync reconciles.
                error!("failed to persist sensor edit: {err:#}");
            }
            shared.write().await.record_system(format!(
                "sensor rule {}:{} updated locally",
                rule.relay,
                rule.kind.as_str()
            ));
        }
        CommandOutcome::Rejected(reason) => {
            warn!("command rejected: {reason}");
            shared.write().await.record_error(reason);
        }
    }
}

/// Log, publish to shared state, push upstream, and log the event remotely.
async fn publish_change<S: SwitchApi, A, T: TelemetryApi>(
    change: AppliedChange,
    shared: &SharedState,
    remote: &mut RemoteHandles<S, A, T>,
    settings: &EngineSettings,
) {
    shared
        .write()
        .await
        .record_relay(change.relay, change.on, change.source);

    // Remote-sourced transitions are the service's own state; pushing them
    // back would only echo.
    if change.source != Source::Remote {
        if let Some(reconciler) = remote.switches.as_mut() {
            reconciler.push(change.relay, change.on).await;
        }
    }

    if let Some(telemetry) = remote.telemetry.as_ref() {
        let event = EventRecord {
            device_id: &settings.device_id,
            relay_id: change.relay.external(),
            state: if change.on { "on" } else { "off" },
            previous: if change.on { "off" } else { "on" },
            source: change.source.as_str(),
            timestamp: OffsetDateTime::now_utc(),
        };
        if let Err(err) = telemetry.log_event(&event).await {
            debug!("event log failed: {err}");
        }
    }
}

async fn send_telemetry<S, A, T: TelemetryApi>(
    settings: &EngineSettings,
    remote: &mut RemoteHandles<S, A, T>,
    snapshot: &SensorSnapshot,
    engine: &Engine,
    last_reported: &mut Option<SensorSnapshot>,
) {
    let Some(telemetry) = remote.telemetry.as_ref() else {
        return;
    };
    let report = build_report(
        &settings.device_id,
        &settings.site_id,
        &settings.room_id,
        snapshot,
        engine.arbiter.states(),
    );
    match telemetry.post_telemetry(&report).await {
        Ok(()) => *last_reported = Some(*snapshot),
        Err(err) => warn!("telemetry post failed: {err}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

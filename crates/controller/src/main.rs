mod arbiter;
mod config;
mod db;
mod engine;
mod ids;
mod mqtt;
mod overrides;
mod relay;
mod remote;
mod schedule;
mod sensor;
mod state;
mod sync;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbiter::Arbiter;
use db::Db;
use engine::{Engine, EngineSettings, RemoteHandles};
use relay::RelayBoard;
use remote::RemoteClient;
use sync::{ConfigSync, Reconciler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(config = %config_path, device = %cfg.device.device_id, "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.device.db_url).await?;
    db.migrate().await?;

    // ── Relay board ─────────────────────────────────────────────────
    let board = RelayBoard::new(&cfg.gpio_pins(), cfg.hardware.active_low)?;
    // Arbiter construction forces every relay off.
    let engine = Engine::new(Arbiter::new(board));

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = state::shared();
    {
        let mut st = shared.write().await;
        st.record_system("controller started".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = shared.clone();
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        web::serve(web_state, web_port).await;
    });

    // ── Remote services ─────────────────────────────────────────────
    let client = RemoteClient::new(
        &cfg.remote.base_url,
        &cfg.remote.api_key,
        &cfg.remote.user_id,
    );
    let handles = RemoteHandles {
        switches: cfg
            .remote
            .switch_sync
            .then(|| Reconciler::new(client.clone())),
        rules: cfg.remote.rule_sync.then(|| ConfigSync::new(client.clone())),
        telemetry: cfg.remote.telemetry.then(|| client.clone()),
    };

    // ── Engine ──────────────────────────────────────────────────────
    let settings = EngineSettings {
        utc_offset_minutes: cfg.device.utc_offset_minutes,
        sample: Duration::from_secs(cfg.intervals.sample_secs),
        evaluate: Duration::from_secs(cfg.intervals.evaluate_secs),
        switch_poll: Duration::from_secs(cfg.intervals.switch_poll_secs),
        rule_sync: Duration::from_secs(cfg.intervals.rule_sync_secs),
        telemetry: Duration::from_secs(cfg.intervals.telemetry_secs),
        device_id: cfg.device.device_id.clone(),
        site_id: cfg.device.site_id.clone(),
        room_id: cfg.device.room_id.clone(),
    };

    #[cfg(feature = "sim")]
    let source = sensor::SimSource::default();
    #[cfg(not(feature = "sim"))]
    let source = sensor::NullSource;

    let (command_tx, command_rx) = mpsc::channel(32);
    let engine_db = db.clone();
    let engine_shared = shared.clone();
    tokio::spawn(async move {
        engine::run(
            settings,
            engine_db,
            engine,
            engine_shared,
            command_rx,
            source,
            handles,
        )
        .await;
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (mqtt_client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let prefix = cfg.mqtt.topic_prefix.clone();
    for suffix in [
        "relay/+/set",
        "override/+/set",
        "override/+/cancel",
        "timer/+/+/set",
        "sensor/+/+/set",
    ] {
        mqtt_client
            .subscribe(format!("{prefix}/{suffix}"), QoS::AtLeastOnce)
            .await?;
    }
    info!(prefix = %prefix, "mqtt subscriptions registered");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match mqtt::parse_command(&prefix, &p.topic, &p.payload) {
                    Ok(Some(command)) => {
                        if command_tx.send(command).await.is_err() {
                            error!("engine command channel closed, exiting");
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        warn!(topic = %p.topic, "unhandled topic");
                    }
                    Err(reason) => {
                        warn!(topic = %p.topic, "bad command: {reason}");
                        shared.write().await.record_error(reason);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                // Relays keep running on local rules; only remote commands
                // are unavailable while the broker is unreachable.
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

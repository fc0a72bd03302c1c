use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::ids::RelayId;
use crate::schedule::TimerRule;
use crate::sensor::{SensorKind, SensorRule, TriggerAction, TriggerMode};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(FromRow)]
struct TimerRow {
    relay_id: i64,
    slot_id: i64,
    enabled: bool,
    days_mask: i64,
    time_on: i64,
    time_off: i64,
}

#[derive(FromRow)]
struct SensorRow {
    relay_id: i64,
    sensor_type: String,
    enabled: bool,
    min_value: f64,
    max_value: f64,
    mode: String,
    hysteresis: f64,
    action: String,
}

fn days_to_mask(days: &[bool; 7]) -> i64 {
    days.iter()
        .enumerate()
        .filter(|(_, d)| **d)
        .fold(0, |mask, (i, _)| mask | (1 << i))
}

fn mask_to_days(mask: i64) -> [bool; 7] {
    std::array::from_fn(|i| mask & (1 << i) != 0)
}

impl TimerRow {
    fn into_rule(self) -> Result<TimerRule> {
        let relay = RelayId::new(self.relay_id as u8)
            .with_context(|| format!("stored timer rule has relay_id {}", self.relay_id))?;
        Ok(TimerRule {
            relay,
            slot: self.slot_id as u8,
            enabled: self.enabled,
            days: mask_to_days(self.days_mask),
            time_on: self.time_on as u16,
            time_off: self.time_off as u16,
        })
    }
}

impl SensorRow {
    fn into_rule(self) -> Result<SensorRule> {
        let relay = RelayId::new(self.relay_id as u8)
            .with_context(|| format!("stored sensor rule has relay_id {}", self.relay_id))?;
        Ok(SensorRule {
            relay,
            kind: SensorKind::parse(&self.sensor_type)
                .with_context(|| format!("stored sensor type {:?}", self.sensor_type))?,
            enabled: self.enabled,
            min_value: self.min_value as f32,
            max_value: self.max_value as f32,
            mode: TriggerMode::parse(&self.mode)
                .with_context(|| format!("stored trigger mode {:?}", self.mode))?,
            hysteresis: self.hysteresis as f32,
            action: TriggerAction::parse(&self.action)
                .with_context(|| format!("stored trigger action {:?}", self.action))?,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/relay-controller/rules.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Timer rules
    // ----------------------------

    pub async fn load_timer_rules(&self) -> Result<Vec<TimerRule>> {
        let rows: Vec<TimerRow> = sqlx::query_as(
            r#"
            SELECT relay_id, slot_id, enabled, days_mask, time_on, time_off
            FROM timer_rules
            ORDER BY relay_id, slot_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_timer_rules failed")?;

        rows.into_iter().map(TimerRow::into_rule).collect()
    }

    pub async fn upsert_timer_rule(&self, rule: &TimerRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timer_rules (relay_id, slot_id, enabled, days_mask, time_on, time_off)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(relay_id, slot_id) DO UPDATE SET
              enabled=excluded.enabled,
              days_mask=excluded.days_mask,
              time_on=excluded.time_on,
              time_off=excluded.time_off
            "#,
        )
        .bind(rule.relay.value() as i64)
        .bind(rule.slot as i64)
        .bind(rule.enabled)
        .bind(days_to_mask(&rule.days))
        .bind(rule.time_on as i64)
        .bind(rule.time_off as i64)
        .execute(&self.pool)
        .await
        .context("upsert_timer_rule failed")?;
        Ok(())
    }

    // ----------------------------
    // Sensor rules
    // ----------------------------

    pub async fn load_sensor_rules(&self) -> Result<Vec<SensorRule>> {
        let rows: Vec<SensorRow> = sqlx::query_as(
            r#"
            SELECT relay_id, sensor_type, enabled, min_value, max_value,
                   mode, hysteresis, action
            FROM sensor_rules
            ORDER BY relay_id, sensor_type
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_sensor_rules failed")?;

        rows.into_iter().map(SensorRow::into_rule).collect()
    }

    pub async fn upsert_sensor_rule(&self, rule: &SensorRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_rules (
              relay_id, sensor_type, enabled, min_value, max_value,
              mode, hysteresis, action
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(relay_id, sensor_type) DO UPDATE SET
              enabled=excluded.enabled,
              min_value=excluded.min_value,
              max_value=excluded.max_value,
              mode=excluded.mode,
              hysteresis=excluded.hysteresis,
              action=excluded.action
            "#,
        )
        .bind(rule.relay.value() as i64)
        .bind(rule.kind.as_str())
        .bind(rule.enabled)
        .bind(rule.min_value as f64)
        .bind(rule.max_value as f64)
        .bind(rule.mode.as_str())
        .bind(rule.hysteresis as f64)
        .bind(rule.action.as_str())
        .execute(&self.pool)
        .await
        .context("upsert_sensor_rule failed")?;
        Ok(())
    }

    // ----------------------------
    // Wholesale replacement on sync token change
    // ----------------------------

    /// Replace both rule tables and the sync token in one transaction, so
    /// a crash mid-sync never leaves a half-applied rule set.
    pub async fn replace_automation(
        &self,
        token: &str,
        timers: &[TimerRule],
        sensors: &[SensorRule],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin replace_automation")?;

        sqlx::query("DELETE FROM timer_rules")
            .execute(&mut *tx)
            .await
            .context("clear timer_rules failed")?;
        sqlx::query("DELETE FROM sensor_rules")
            .execute(&mut *tx)
            .await
            .context("clear sensor_rules failed")?;

        for rule in timers {
            sqlx::query(
                r#"
                INSERT INTO timer_rules (relay_id, slot_id, enabled, days_mask, time_on, time_off)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(rule.relay.value() as i64)
            .bind(rule.slot as i64)
            .bind(rule.enabled)
            .bind(days_to_mask(&rule.days))
            .bind(rule.time_on as i64)
            .bind(rule.time_off as i64)
            .execute(&mut *tx)
            .await
            .context("insert timer rule failed")?;
        }

        for rule in sensors {
            sqlx::query(
                r#"
                INSERT INTO sensor_rules (
                  relay_id, sensor_type, enabled, min_value, max_value,
                  mode, hysteresis, action
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(rule.relay.value() as i64)
            .bind(rule.kind.as_str())
            .bind(rule.enabled)
            .bind(rule.min_value as f64)
            .bind(rule.max_value as f64)
            .bind(rule.mode.as_str())
            .bind(rule.hysteresis as f64)
            .bind(rule.action.as_str())
            .execute(&mut *tx)
            .await
            .context("insert sensor rule failed")?;
        }

        sqlx::query(
            r#"
            INSERT INTO sync_state (id, sync_token, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              sync_token=excluded.sync_token,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(token)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&mut *tx)
        .await
        .context("store sync token failed")?;

        tx.commit().await.context("commit replace_automation")?;
        Ok(())
    }

    pub async fn sync_token(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sync_token FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("sync_token failed")?;
        Ok(row.map(|(token,)| token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: u8) -> RelayId {
        RelayId::new(id).unwrap()
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn timer(relay: u8, slot: u8) -> TimerRule {
        TimerRule {
            relay: r(relay),
            slot,
            enabled: true,
            days: [true, true, true, true, true, false, false],
            time_on: 480,
            time_off: 1080,
        }
    }

    fn sensor(relay: u8) -> SensorRule {
        SensorRule {
            relay: r(relay),
            kind: SensorKind::SoilMoisture,
            enabled: true,
            min_value: 40.0,
            max_value: 0.0,
            mode: TriggerMode::MinTrigger,
            hysteresis: 20.0,
            action: TriggerAction::TurnOn,
        }
    }

    #[test]
    fn days_mask_round_trip() {
        let days = [true, false, true, false, false, false, true];
        assert_eq!(mask_to_days(days_to_mask(&days)), days);
        assert_eq!(days_to_mask(&[false; 7]), 0);
        assert_eq!(days_to_mask(&[true; 7]), 0b111_1111);
    }

    #[tokio::test]
    async fn timer_rules_round_trip() {
        let db = test_db().await;
        db.upsert_timer_rule(&timer(0, 0)).await.unwrap();
        db.upsert_timer_rule(&timer(2, 1)).await.unwrap();

        let rules = db.load_timer_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], timer(0, 0));
        assert_eq!(rules[1], timer(2, 1));
    }

    #[tokio::test]
    async fn timer_upsert_overwrites_same_slot() {
        let db = test_db().await;
        db.upsert_timer_rule(&timer(1, 0)).await.unwrap();
        let mut updated = timer(1, 0);
        updated.time_off = 1200;
        updated.enabled = false;
        db.upsert_timer_rule(&updated).await.unwrap();

        let rules = db.load_timer_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], updated);
    }

    #[tokio::test]
    async fn sensor_rules_round_trip() {
        let db = test_db().await;
        db.upsert_sensor_rule(&sensor(3)).await.unwrap();
        let rules = db.load_sensor_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], sensor(3));
    }

    #[tokio::test]
    async fn sensor_upsert_overwrites_same_pair() {
        let db = test_db().await;
        db.upsert_sensor_rule(&sensor(2)).await.unwrap();
        let mut updated = sensor(2);
        updated.min_value = 55.0;
        updated.hysteresis = 5.0;
        db.upsert_sensor_rule(&updated).await.unwrap();

        let rules = db.load_sensor_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], updated);
    }

    #[tokio::test]
    async fn replace_automation_is_wholesale() {
        let db = test_db().await;
        db.replace_automation("tok-1", &[timer(0, 0), timer(0, 1)], &[sensor(0)])
            .await
            .unwrap();

        db.replace_automation("tok-2", &[timer(3, 2)], &[])
            .await
            .unwrap();

        let timers = db.load_timer_rules().await.unwrap();
        assert_eq!(timers, vec![timer(3, 2)]);
        assert!(db.load_sensor_rules().await.unwrap().is_empty());
        assert_eq!(db.sync_token().await.unwrap().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn sync_token_starts_empty() {
        let db = test_db().await;
        assert_eq!(db.sync_token().await.unwrap(), None);
    }
}

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mac_address: String,
    pub name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub ble_mac: String,
    pub name: Option<String>,
    pub active: bool,
    pub owner_id: Option<i64>,
    pub category_id: Option<i64>,
}

/// A device row, including its last-known-state snapshot.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Device {
    pub id: i64,
    pub ble_mac: String,
    pub name: Option<String>,
    pub active: bool,
    pub owner_id: Option<i64>,
    pub category_id: Option<i64>,
    pub last_seen_at: Option<i64>,
    pub last_gateway_id: Option<i64>,
    pub last_place_id: Option<i64>,
    pub last_rssi: Option<i64>,
    pub last_temperature_c: Option<f64>,
    pub last_battery_mv: Option<i64>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DeviceRecord {
    pub id: i64,
    pub device_id: i64,
    pub gateway_id: i64,
    pub place_id: Option<i64>,
    pub rssi: i64,
    pub adv_type: Option<String>,
    pub raw_payload: Option<String>,
    pub battery_voltage_mv: Option<i64>,
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub movement_count: Option<i64>,
    pub additional_data: String,
    pub recorded_at: i64,
    pub updated_at: i64,
}

/// Which devices an alarm rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum AlarmScope {
    Device(i64),
    Category(i64),
    Place(i64),
    /// No scope column set. Resolves to no devices.
    Global,
}

impl AlarmScope {
    /// Device scope wins over category, category over place.
    fn from_columns(device_id: Option<i64>, category_id: Option<i64>, place_id: Option<i64>) -> Self {
        match (device_id, category_id, place_id) {
            (Some(id), _, _) => Self::Device(id),
            (None, Some(id), _) => Self::Category(id),
            (None, None, Some(id)) => Self::Place(id),
            (None, None, None) => Self::Global,
        }
    }

    fn columns(self) -> (Option<i64>, Option<i64>, Option<i64>) {
        match self {
            Self::Device(id) => (Some(id), None, None),
            Self::Category(id) => (None, Some(id), None),
            Self::Place(id) => (None, None, Some(id)),
            Self::Global => (None, None, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRule {
    pub name: String,
    pub owner_id: Option<i64>,
    pub threshold_seconds: i64,
    pub scope: AlarmScope,
    pub handler_group: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmConfig {
    pub id: i64,
    #[serde(flatten)]
    pub rule: AlarmRule,
}

#[derive(FromRow)]
struct AlarmConfigRow {
    id: i64,
    name: String,
    owner_id: Option<i64>,
    threshold_seconds: i64,
    device_id: Option<i64>,
    category_id: Option<i64>,
    place_id: Option<i64>,
    handler_group: Option<String>,
    active: bool,
}

impl From<AlarmConfigRow> for AlarmConfig {
    fn from(r: AlarmConfigRow) -> Self {
        Self {
            id: r.id,
            rule: AlarmRule {
                name: r.name,
                owner_id: r.owner_id,
                threshold_seconds: r.threshold_seconds,
                scope: AlarmScope::from_columns(r.device_id, r.category_id, r.place_id),
                handler_group: r.handler_group,
                active: r.active,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl AlarmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "OPEN" => Self::Open,
            "ACKNOWLEDGED" => Self::Acknowledged,
            "RESOLVED" => Self::Resolved,
            other => bail!("unknown alarm status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    pub id: i64,
    pub device_id: i64,
    pub alarm_config_id: i64,
    pub status: AlarmStatus,
    pub triggered_at: i64,
    pub resolved_at: Option<i64>,
    /// Seconds since the device was last seen; `None` when it never was.
    pub breach_seconds: Option<i64>,
    pub notes: Option<String>,
    pub updated_at: i64,
}

#[derive(FromRow)]
struct AlarmRow {
    id: i64,
    device_id: i64,
    alarm_config_id: i64,
    status: String,
    triggered_at: i64,
    resolved_at: Option<i64>,
    breach_seconds: Option<i64>,
    notes: Option<String>,
    updated_at: i64,
}

impl TryFrom<AlarmRow> for Alarm {
    type Error = anyhow::Error;

    fn try_from(r: AlarmRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            device_id: r.device_id,
            alarm_config_id: r.alarm_config_id,
            status: r.status.parse()?,
            triggered_at: r.triggered_at,
            resolved_at: r.resolved_at,
            breach_seconds: r.breach_seconds,
            notes: r.notes,
            updated_at: r.updated_at,
        })
    }
}

/// An alarm target: an active device and when it last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct DeviceSeen {
    pub id: i64,
    pub last_seen_at: Option<i64>,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

async fn reassign(conn: &mut SqliteConnection, gateway_id: i64, place_id: i64, now: i64) -> Result<bool> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT place_id FROM gateway_places WHERE gateway_id = ? AND active = 1")
            .bind(gateway_id)
            .fetch_optional(&mut *conn)
            .await
            .context("assign_gateway_place: lookup failed")?;

    if current == Some(place_id) {
        return Ok(false);
    }

    sqlx::query("UPDATE gateway_places SET active = 0 WHERE gateway_id = ? AND active = 1")
        .bind(gateway_id)
        .execute(&mut *conn)
        .await
        .context("assign_gateway_place: deactivate failed")?;

    sqlx::query("INSERT INTO gateway_places (gateway_id, place_id, active, assigned_at) VALUES (?, ?, 1, ?)")
        .bind(gateway_id)
        .bind(place_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("assign_gateway_place: insert failed")?;

    Ok(true)
}

/// A connection whose transaction cannot be rolled back never goes back to
/// the pool.
async fn rollback(mut conn: PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!("rollback failed, closing connection: {e}");
        drop(conn.detach());
    }
}

const ALARM_COLUMNS: &str = "id, device_id, alarm_config_id, status, triggered_at, resolved_at, \
                             breach_seconds, notes, updated_at";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/beacon/beacon.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Check out a connection and open a write transaction on it.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so concurrent writers
    /// queue on the busy timeout instead of failing a read-to-write lock
    /// upgrade halfway through.
    pub async fn begin_write(&self) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await.context("failed to acquire connection")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("BEGIN IMMEDIATE failed")?;
        Ok(conn)
    }

    /// Close a transaction opened by [`Db::begin_write`]: commit when
    /// `result` is Ok, roll back otherwise.
    pub async fn end_write<T>(mut conn: PoolConnection<Sqlite>, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(value),
                Err(e) => {
                    rollback(conn).await;
                    Err(e).context("COMMIT failed")
                }
            },
            Err(e) => {
                rollback(conn).await;
                Err(e)
            }
        }
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
    // Places, categories, gateways
    // ----------------------------

    pub async fn upsert_place(&self, name: &str) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO places (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name=excluded.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_place failed: {name}"))
    }

    pub async fn upsert_category(&self, name: &str) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO categories (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name=excluded.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_category failed: {name}"))
    }

    pub async fn upsert_gateway(&self, g: &GatewayConfig) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO gateways (mac_address, name, active) VALUES (?, ?, ?)
            ON CONFLICT(mac_address) DO UPDATE SET
              name=excluded.name,
              active=excluded.active
            RETURNING id
            "#,
        )
        .bind(&g.mac_address)
        .bind(&g.name)
        .bind(g.active)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_gateway failed: {}", g.mac_address))
    }

    /// Make `place_id` the gateway's only active place. Returns false when it
    /// already was.
    pub async fn assign_gateway_place(&self, gateway_id: i64, place_id: i64, now: i64) -> Result<bool> {
        let mut conn = self.begin_write().await.context("assign_gateway_place: begin failed")?;
        let result = reassign(&mut conn, gateway_id, place_id, now).await;
        Self::end_write(conn, result).await
    }

    // ----------------------------
    // Devices + history
    // ----------------------------

    pub async fn upsert_device(&self, d: &DeviceConfig) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO devices (ble_mac, name, active, owner_id, category_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(ble_mac) DO UPDATE SET
              name=excluded.name,
              active=excluded.active,
              owner_id=excluded.owner_id,
              category_id=excluded.category_id
            RETURNING id
            "#,
        )
        .bind(&d.ble_mac)
        .bind(&d.name)
        .bind(d.active)
        .bind(d.owner_id)
        .bind(d.category_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_device failed: {}", d.ble_mac))
    }

    pub async fn device_by_mac(&self, ble_mac: &str) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, ble_mac, name, active, owner_id, category_id,
                   last_seen_at, last_gateway_id, last_place_id,
                   last_rssi, last_temperature_c, last_battery_mv, updated_at
            FROM devices
            WHERE ble_mac = ?
            "#,
        )
        .bind(ble_mac)
        .fetch_optional(&self.pool)
        .await
        .context("device_by_mac failed")
    }

    /// History rows for a device, oldest first.
    pub async fn records_for_device(&self, device_id: i64) -> Result<Vec<DeviceRecord>> {
        sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT id, device_id, gateway_id, place_id, rssi, adv_type, raw_payload,
                   battery_voltage_mv, temperature_c, humidity, movement_count,
                   additional_data, recorded_at, updated_at
            FROM device_records
            WHERE device_id = ?
            ORDER BY recorded_at, id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("records_for_device failed")
    }

    // ----------------------------
    // Alarm configs + alarms
    // ----------------------------

    pub async fn upsert_alarm_config(&self, rule: &AlarmRule) -> Result<i64> {
        let (device_id, category_id, place_id) = rule.scope.columns();
        sqlx::query_scalar(
            r#"
            INSERT INTO alarm_configs (
              name, owner_id, threshold_seconds,
              device_id, category_id, place_id,
              handler_group, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              owner_id=excluded.owner_id,
              threshold_seconds=excluded.threshold_seconds,
              device_id=excluded.device_id,
              category_id=excluded.category_id,
              place_id=excluded.place_id,
              handler_group=excluded.handler_group,
              active=excluded.active
            RETURNING id
            "#,
        )
        .bind(&rule.name)
        .bind(rule.owner_id)
        .bind(rule.threshold_seconds)
        .bind(device_id)
        .bind(category_id)
        .bind(place_id)
        .bind(&rule.handler_group)
        .bind(rule.active)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_alarm_config failed: {}", rule.name))
    }

    pub async fn active_alarm_configs(&self) -> Result<Vec<AlarmConfig>> {
        let rows = sqlx::query_as::<_, AlarmConfigRow>(
            r#"
            SELECT id, name, owner_id, threshold_seconds,
                   device_id, category_id, place_id, handler_group, active
            FROM alarm_configs
            WHERE active = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("active_alarm_configs failed")?;

        Ok(rows.into_iter().map(AlarmConfig::from).collect())
    }

    /// Active devices an alarm scope covers.
    pub async fn alarm_targets(&self, scope: AlarmScope) -> Result<Vec<DeviceSeen>> {
        let (filter, id) = match scope {
            AlarmScope::Device(id) => ("id = ?", id),
            AlarmScope::Category(id) => ("category_id = ?", id),
            AlarmScope::Place(id) => ("last_place_id = ?", id),
            AlarmScope::Global => return Ok(Vec::new()),
        };
        let sql = format!("SELECT id, last_seen_at FROM devices WHERE active = 1 AND {filter} ORDER BY id");

        sqlx::query_as::<_, DeviceSeen>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("alarm_targets failed: {scope:?}"))
    }

    /// The OPEN or ACKNOWLEDGED alarm for a device under a config, if any.
    pub async fn live_alarm(&self, device_id: i64, alarm_config_id: i64) -> Result<Option<Alarm>> {
        let sql = format!(
            "SELECT {ALARM_COLUMNS} FROM alarms \
             WHERE device_id = ? AND alarm_config_id = ? AND status IN ('OPEN', 'ACKNOWLEDGED')"
        );
        let row = sqlx::query_as::<_, AlarmRow>(&sql)
            .bind(device_id)
            .bind(alarm_config_id)
            .fetch_optional(&self.pool)
            .await
            .context("live_alarm failed")?;

        row.map(Alarm::try_from).transpose()
    }

    /// OPEN or ACKNOWLEDGED alarms raised by one config.
    pub async fn live_alarms_for_config(&self, alarm_config_id: i64) -> Result<Vec<Alarm>> {
        let sql = format!(
            "SELECT {ALARM_COLUMNS} FROM alarms \
             WHERE alarm_config_id = ? AND status IN ('OPEN', 'ACKNOWLEDGED') ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AlarmRow>(&sql)
            .bind(alarm_config_id)
            .fetch_all(&self.pool)
            .await
            .context("live_alarms_for_config failed")?;

        rows.into_iter().map(Alarm::try_from).collect()
    }

    pub async fn alarms_for_device(&self, device_id: i64) -> Result<Vec<Alarm>> {
        let sql = format!("SELECT {ALARM_COLUMNS} FROM alarms WHERE device_id = ? ORDER BY id");
        let rows = sqlx::query_as::<_, AlarmRow>(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .context("alarms_for_device failed")?;

        rows.into_iter().map(Alarm::try_from).collect()
    }

    /// Returns false when a live alarm already exists for the pair.
    pub async fn open_alarm(
        &self,
        device_id: i64,
        alarm_config_id: i64,
        breach_seconds: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO alarms (device_id, alarm_config_id, status, triggered_at, breach_seconds, updated_at)
            VALUES (?, ?, 'OPEN', ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(alarm_config_id)
        .bind(now)
        .bind(breach_seconds)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("open_alarm failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn update_breach(&self, alarm_id: i64, breach_seconds: Option<i64>, now: i64) -> Result<()> {
        sqlx::query("UPDATE alarms SET breach_seconds = ?, updated_at = ? WHERE id = ?")
            .bind(breach_seconds)
            .bind(now)
            .bind(alarm_id)
            .execute(&self.pool)
            .await
            .context("update_breach failed")?;
        Ok(())
    }

    pub async fn resolve_alarm(&self, alarm_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE alarms SET status = 'RESOLVED', resolved_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('OPEN', 'ACKNOWLEDGED')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(alarm_id)
        .execute(&self.pool)
        .await
        .context("resolve_alarm failed")?;
        Ok(())
    }

    /// Operator acknowledgement. Only an OPEN alarm can be acknowledged.
    pub async fn acknowledge_alarm(&self, alarm_id: i64, notes: Option<&str>, now: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE alarms SET status = 'ACKNOWLEDGED', notes = COALESCE(?, notes), updated_at = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(notes)
        .bind(now)
        .bind(alarm_id)
        .execute(&self.pool)
        .await
        .context("acknowledge_alarm failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Raw message log
    // ----------------------------

    pub async fn insert_mqtt_message(
        &self,
        topic: &str,
        payload: &str,
        gateway_mac: Option<&str>,
        received_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mqtt_messages (topic, payload, gateway_mac, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(payload)
        .bind(gateway_mac)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_mqtt_message failed: {topic}"))?;
        Ok(())
    }

    pub async fn count_mqtt_messages(&self, topic: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM mqtt_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .context("count_mqtt_messages failed")
    }
}

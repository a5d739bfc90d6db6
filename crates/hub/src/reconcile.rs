//! Persist one normalized reading against device, gateway and place state.
//!
//! Each reading is handled in its own transaction. The latest history row
//! for the device decides what happens:
//!
//! ```text
//! elapsed <  skip_window, same place                 -> skip, nothing written
//! skip_window <= elapsed <= merge_window, same place -> update that row
//! anything else, or no prior row                     -> insert a new row
//! ```
//!
//! Every non-skip outcome also overwrites the device snapshot.

use anyhow::{Context, Result};
use beacon_decode::NormalizedReading;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};
use tracing::debug;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub skip_sec: i64,
    pub merge_sec: i64,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            skip_sec: 30,
            merge_sec: 300,
        }
    }
}

/// The device's most recent history row, as far as the merge policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct LatestRecord {
    pub id: i64,
    pub place_id: Option<i64>,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Update(i64),
    Insert,
}

/// Pick what to do with a reading at `place_id` given the latest row.
/// Places compare null-safely: two unassigned gateways count as the same
/// place.
pub fn decide(latest: Option<&LatestRecord>, place_id: Option<i64>, now: i64, w: Windows) -> Decision {
    let Some(prior) = latest else {
        return Decision::Insert;
    };
    if prior.place_id != place_id {
        return Decision::Insert;
    }
    let elapsed = now - prior.recorded_at;
    if elapsed < w.skip_sec {
        Decision::Skip
    } else if elapsed <= w.merge_sec {
        Decision::Update(prior.id)
    } else {
        Decision::Insert
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    Updated,
    Skipped,
    UnknownGateway,
    UnknownDevice,
}

/// Reconcile one reading at time `now`. Unknown gateways and devices are
/// not errors; any store error rolls the transaction back.
pub async fn reconcile(db: &Db, reading: &NormalizedReading, now: i64, w: Windows) -> Result<Outcome> {
    let mut conn = db.begin_write().await.context("reconcile: begin failed")?;
    let result = apply(&mut conn, reading, now, w).await;
    Db::end_write(conn, result).await.context("reconcile failed")
}

async fn apply(conn: &mut SqliteConnection, reading: &NormalizedReading, now: i64, w: Windows) -> Result<Outcome> {
    let Some(gateway_id) = active_gateway(&mut *conn, &reading.gateway_mac).await? else {
        debug!(gateway = %reading.gateway_mac, "reading from unknown gateway discarded");
        return Ok(Outcome::UnknownGateway);
    };
    let Some(device_id) = active_device(&mut *conn, &reading.ble_mac).await? else {
        debug!(device = %reading.ble_mac, "reading for unknown device discarded");
        return Ok(Outcome::UnknownDevice);
    };
    let place_id = active_place(&mut *conn, gateway_id).await?;
    let latest = latest_record(&mut *conn, device_id).await?;

    let outcome = match decide(latest.as_ref(), place_id, now, w) {
        Decision::Skip => return Ok(Outcome::Skipped),
        Decision::Update(record_id) => {
            update_record(&mut *conn, record_id, gateway_id, place_id, reading, now).await?;
            Outcome::Updated
        }
        Decision::Insert => {
            insert_record(&mut *conn, device_id, gateway_id, place_id, reading, now).await?;
            Outcome::Inserted
        }
    };
    update_snapshot(&mut *conn, device_id, gateway_id, place_id, reading, now).await?;

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Queries (all inside the caller's transaction)
// ---------------------------------------------------------------------------

async fn active_gateway(conn: &mut SqliteConnection, mac: &str) -> Result<Option<i64>> {
    sqlx::query_scalar("SELECT id FROM gateways WHERE mac_address = ? AND active = 1")
        .bind(mac)
        .fetch_optional(conn)
        .await
        .context("reconcile: gateway lookup failed")
}

async fn active_device(conn: &mut SqliteConnection, mac: &str) -> Result<Option<i64>> {
    sqlx::query_scalar("SELECT id FROM devices WHERE ble_mac = ? AND active = 1")
        .bind(mac)
        .fetch_optional(conn)
        .await
        .context("reconcile: device lookup failed")
}

async fn active_place(conn: &mut SqliteConnection, gateway_id: i64) -> Result<Option<i64>> {
    sqlx::query_scalar(
        r#"
        SELECT place_id FROM gateway_places
        WHERE gateway_id = ? AND active = 1
        ORDER BY assigned_at DESC
        LIMIT 1
        "#,
    )
    .bind(gateway_id)
    .fetch_optional(conn)
    .await
    .context("reconcile: place lookup failed")
}

async fn latest_record(conn: &mut SqliteConnection, device_id: i64) -> Result<Option<LatestRecord>> {
    sqlx::query_as::<_, LatestRecord>(
        r#"
        SELECT id, place_id, recorded_at FROM device_records
        WHERE device_id = ?
        ORDER BY recorded_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(device_id)
    .fetch_optional(conn)
    .await
    .context("reconcile: latest record lookup failed")
}

fn additional_json(reading: &NormalizedReading) -> Result<String> {
    serde_json::to_string(&reading.additional).context("reconcile: additional data not serializable")
}

async fn insert_record(
    conn: &mut SqliteConnection,
    device_id: i64,
    gateway_id: i64,
    place_id: Option<i64>,
    r: &NormalizedReading,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO device_records (
          device_id, gateway_id, place_id, rssi, adv_type, raw_payload,
          battery_voltage_mv, temperature_c, humidity, movement_count,
          additional_data, recorded_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(device_id)
    .bind(gateway_id)
    .bind(place_id)
    .bind(r.rssi)
    .bind(&r.adv_type)
    .bind(&r.raw_payload)
    .bind(r.battery_mv)
    .bind(r.temperature_c)
    .bind(r.humidity)
    .bind(r.movement_count)
    .bind(additional_json(r)?)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await
    .context("reconcile: insert record failed")?;
    Ok(())
}

async fn update_record(
    conn: &mut SqliteConnection,
    record_id: i64,
    gateway_id: i64,
    place_id: Option<i64>,
    r: &NormalizedReading,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE device_records SET
          gateway_id = ?, place_id = ?, rssi = ?, adv_type = ?, raw_payload = ?,
          battery_voltage_mv = ?, temperature_c = ?, humidity = ?, movement_count = ?,
          additional_data = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(gateway_id)
    .bind(place_id)
    .bind(r.rssi)
    .bind(&r.adv_type)
    .bind(&r.raw_payload)
    .bind(r.battery_mv)
    .bind(r.temperature_c)
    .bind(r.humidity)
    .bind(r.movement_count)
    .bind(additional_json(r)?)
    .bind(now)
    .bind(record_id)
    .execute(conn)
    .await
    .context("reconcile: update record failed")?;
    Ok(())
}

async fn update_snapshot(
    conn: &mut SqliteConnection,
    device_id: i64,
    gateway_id: i64,
    place_id: Option<i64>,
    r: &NormalizedReading,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE devices SET
          last_seen_at = ?, last_gateway_id = ?, last_place_id = ?, last_rssi = ?,
          last_temperature_c = ?, last_battery_mv = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(gateway_id)
    .bind(place_id)
    .bind(r.rssi)
    .bind(r.temperature_c)
    .bind(r.battery_mv)
    .bind(now)
    .bind(device_id)
    .execute(conn)
    .await
    .context("reconcile: device snapshot update failed")?;
    Ok(())
}

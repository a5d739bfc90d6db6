//! Bounded worker pool between the MQTT event loop and the store.
//!
//! The event loop decodes each publish and hands an [`Inbound`] to the
//! channel; workers log the raw message and reconcile every reading.

use beacon_decode::NormalizedReading;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::db::Db;
use crate::reconcile::{reconcile, Outcome, Windows};
use crate::state::SharedState;

/// One decoded MQTT publish.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    /// Payload as stored in the raw log.
    pub stored_payload: String,
    pub gateway_mac: Option<String>,
    pub readings: Vec<NormalizedReading>,
    /// Unix seconds at arrival; used as `now` when reconciling.
    pub received_at: i64,
}

pub struct WorkerPool {
    db: Db,
    shared: SharedState,
    workers: usize,
    windows: Windows,
}

impl WorkerPool {
    pub fn new(db: Db, shared: SharedState, workers: usize, windows: Windows) -> Self {
        Self {
            db,
            shared,
            workers: workers.max(1),
            windows,
        }
    }

    /// Consume messages until every sender is dropped, then wait for the
    /// in-flight tasks to finish.
    pub async fn run(self, mut rx: mpsc::Receiver<Inbound>) {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        info!(workers = self.workers, "ingest pool started");

        while let Some(msg) = rx.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let db = self.db.clone();
            let shared = Arc::clone(&self.shared);
            let windows = self.windows;

            tokio::spawn(async move {
                let _permit = permit;
                process(&db, &shared, msg, windows).await;
            });
        }

        // All permits back means no task is still running.
        if semaphore.acquire_many(self.workers as u32).await.is_ok() {
            info!("ingest pool drained");
        }
    }
}

async fn process(db: &Db, shared: &SharedState, msg: Inbound, windows: Windows) {
    if let Err(e) = db
        .insert_mqtt_message(
            &msg.topic,
            &msg.stored_payload,
            msg.gateway_mac.as_deref(),
            msg.received_at,
        )
        .await
    {
        error!(topic = %msg.topic, "raw log write failed: {e:#}");
        shared.write().await.record_store_error(format!("raw log: {e:#}"));
    }

    for reading in &msg.readings {
        match reconcile(db, reading, msg.received_at, windows).await {
            Ok(outcome) => {
                match outcome {
                    Outcome::UnknownGateway | Outcome::UnknownDevice => {
                        debug!(
                            gateway = %reading.gateway_mac,
                            device = %reading.ble_mac,
                            ?outcome,
                            "reading dropped"
                        );
                    }
                    _ => debug!(device = %reading.ble_mac, ?outcome, "reading stored"),
                }
                shared.write().await.record_outcome(outcome);
            }
            Err(e) => {
                error!(device = %reading.ble_mac, "reconcile failed: {e:#}");
                shared
                    .write()
                    .await
                    .record_store_error(format!("reconcile {}: {e:#}", reading.ble_mac));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceConfig, GatewayConfig};
    use crate::state::SystemState;
    use tokio::sync::RwLock;

    async fn seeded_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_gateway(&GatewayConfig {
            mac_address: "AC233F000001".into(),
            name: None,
            active: true,
        })
        .await
        .unwrap();
        db.upsert_device(&DeviceConfig {
            ble_mac: "C3000000000A".into(),
            name: None,
            active: true,
            owner_id: None,
            category_id: None,
        })
        .await
        .unwrap();
        db
    }

    fn reading(device: &str, rssi: i64) -> NormalizedReading {
        NormalizedReading::new("devices/MK1", device.into(), "AC233F000001".into(), rssi)
    }

    fn inbound(readings: Vec<NormalizedReading>, received_at: i64) -> Inbound {
        Inbound {
            topic: "devices/MK1".into(),
            stored_payload: "[]".into(),
            gateway_mac: Some("AC233F000001".into()),
            readings,
            received_at,
        }
    }

    // -- drain ---------------------------------------------------------------

    #[tokio::test]
    async fn pool_stores_readings_and_drains_on_close() {
        let db = seeded_db().await;
        let shared = Arc::new(RwLock::new(SystemState::new()));
        let pool = WorkerPool::new(db.clone(), Arc::clone(&shared), 1, Windows::default());

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(pool.run(rx));

        tx.send(inbound(vec![reading("C3000000000A", -60)], 1_000)).await.unwrap();
        tx.send(inbound(vec![reading("C3000000000A", -61)], 1_010)).await.unwrap();
        tx.send(inbound(vec![reading("C3000000000A", -62)], 1_100)).await.unwrap();
        tx.send(inbound(vec![reading("C3FFFFFFFFFF", -70)], 1_100)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let dev = db.device_by_mac("C3000000000A").await.unwrap().unwrap();
        let records = db.records_for_device(dev.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rssi, -62);
        assert_eq!(dev.last_seen_at, Some(1_100));

        assert_eq!(db.count_mqtt_messages("devices/MK1").await.unwrap(), 4);

        let st = shared.read().await;
        assert_eq!(st.readings.inserted, 1);
        assert_eq!(st.readings.skipped, 1);
        assert_eq!(st.readings.updated, 1);
        assert_eq!(st.readings.unknown_device, 1);
        assert_eq!(st.readings.store_errors, 0);
    }

    #[tokio::test]
    async fn empty_message_is_still_logged() {
        let db = seeded_db().await;
        let shared = Arc::new(RwLock::new(SystemState::new()));
        let pool = WorkerPool::new(db.clone(), Arc::clone(&shared), 1, Windows::default());

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(pool.run(rx));
        tx.send(inbound(Vec::new(), 500)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(db.count_mqtt_messages("devices/MK1").await.unwrap(), 1);
        assert_eq!(shared.read().await.readings, Default::default());
    }

    // -- concurrency ---------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_keep_every_reading() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ingest.db").display());
        let db = Db::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_gateway(&GatewayConfig {
            mac_address: "AC233F000001".into(),
            name: None,
            active: true,
        })
        .await
        .unwrap();

        let macs: Vec<String> = (0..200).map(|i| format!("C3000000{i:04X}")).collect();
        for mac in &macs {
            db.upsert_device(&DeviceConfig {
                ble_mac: mac.clone(),
                name: None,
                active: true,
                owner_id: None,
                category_id: None,
            })
            .await
            .unwrap();
        }

        let shared = Arc::new(RwLock::new(SystemState::new()));
        let pool = WorkerPool::new(db.clone(), Arc::clone(&shared), 4, Windows::default());
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(pool.run(rx));

        for mac in &macs {
            tx.send(inbound(vec![reading(mac, -60)], 2_000)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let st = shared.read().await;
        assert_eq!(st.readings.store_errors, 0, "{:?}", st.events.back().map(|e| &e.detail));
        assert_eq!(st.readings.inserted, 200);

        let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_records")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(records, 200);
        let seen: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE last_seen_at = 2000")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(seen, 200);
        assert_eq!(db.count_mqtt_messages("devices/MK1").await.unwrap(), 200);
    }
}

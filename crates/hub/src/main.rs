mod alarms;
mod config;
mod db;
mod ingest;
mod mqtt;
mod reconcile;
mod state;
mod web;

use anyhow::Result;
use rumqttc::AsyncClient;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Env;
use db::{now_unix, Db};
use ingest::WorkerPool;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let env = Env::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&env.db_url).await?;
    db.migrate().await?;

    // ── Config file (seed places, gateways, devices, alarm rules) ───
    let cfg = config::load(&env.config_path)?;
    config::apply(&cfg, &db, now_unix()).await?;

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared.write().await.record_system("hub started".to_string());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Status API ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let web_shutdown = shutdown_rx.clone();
    let web_port = env.web_port;
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port, web_shutdown).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── Alarm monitor ───────────────────────────────────────────────
    let monitor_handle = tokio::spawn(alarms::run(
        db.clone(),
        cfg.alarms.interval_sec,
        Arc::clone(&shared),
        shutdown_rx.clone(),
    ));

    // ── Ingest pool ─────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel(cfg.ingest.queue_depth);
    let pool = WorkerPool::new(
        db.clone(),
        Arc::clone(&shared),
        cfg.ingest.workers,
        cfg.ingest.windows(),
    );
    let pool_handle = tokio::spawn(pool.run(rx));

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = AsyncClient::new(mqtt::options(&env, &cfg.mqtt), cfg.mqtt.channel_capacity);
    info!(
        host = %env.mqtt_host,
        port = env.mqtt_port,
        prefix = %cfg.mqtt.topic_prefix,
        "connecting to mqtt broker"
    );
    let mqtt_handle = tokio::spawn(mqtt::run(
        client,
        eventloop,
        cfg.mqtt.topic_prefix.clone(),
        tx,
        Arc::clone(&shared),
        shutdown_rx,
    ));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // The mqtt loop owns the only sender; once it returns the pool drains.
    let _ = mqtt_handle.await;
    let _ = pool_handle.await;
    let _ = monitor_handle.await;
    let _ = web_handle.await;

    db.pool().close().await;
    info!("hub stopped");
    Ok(())
}

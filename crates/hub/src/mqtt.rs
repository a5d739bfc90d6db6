use beacon_decode::{dispatch, Topic};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{Env, MqttConfig};
use crate::db::now_unix;
use crate::ingest::Inbound;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Topic / option helpers
// ---------------------------------------------------------------------------

/// One subscription per gateway generation under `prefix`.
pub(crate) fn subscriptions(prefix: &str) -> Vec<String> {
    Topic::ALL
        .iter()
        .map(|t| format!("{prefix}/{}", t.as_str()))
        .collect()
}

/// Match "<prefix>/<NAME>" exactly.
pub(crate) fn route(prefix: &str, topic: &str) -> Option<Topic> {
    let name = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    Topic::ALL.into_iter().find(|t| t.as_str() == name)
}

pub(crate) fn options(env: &Env, cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &env.mqtt_host, env.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    if let Some(user) = &env.mqtt_username {
        opts.set_credentials(user, env.mqtt_password.as_deref().unwrap_or_default());
    }
    opts
}

/// Decode one publish. `None` for topics this service does not ingest.
pub(crate) fn decode_publish(prefix: &str, topic: &str, payload: &[u8], received_at: i64) -> Option<Inbound> {
    let kind = route(prefix, topic)?;
    if kind == Topic::Rf1 {
        return None;
    }
    let readings = dispatch(topic, payload);
    let gateway_mac = readings.first().map(|r| r.gateway_mac.clone());
    Some(Inbound {
        topic: topic.to_string(),
        stored_payload: kind.stored_payload(payload),
        gateway_mac,
        readings,
        received_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandOff {
    Queued,
    /// Queue full; the message is lost.
    Dropped,
    Closed,
}

/// Queue a message for the workers without waiting on them.
pub(crate) fn hand_off(tx: &mpsc::Sender<Inbound>, msg: Inbound) -> HandOff {
    match tx.try_send(msg) {
        Ok(()) => HandOff::Queued,
        Err(TrySendError::Full(_)) => HandOff::Dropped,
        Err(TrySendError::Closed(_)) => HandOff::Closed,
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Poll the broker until `shutdown` flips to true or the ingest channel
/// closes. Never touches the database or waits on the workers; decoded
/// messages go to `tx` and are dropped when it is full.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    prefix: String,
    tx: mpsc::Sender<Inbound>,
    shared: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    let topics = subscriptions(&prefix);

    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(msg) = decode_publish(&prefix, &p.topic, &p.payload, now_unix()) else {
                    debug!(topic = %p.topic, "message ignored");
                    continue;
                };
                if msg.readings.is_empty() {
                    warn!(topic = %msg.topic, bytes = p.payload.len(), "no readings decoded");
                } else {
                    debug!(topic = %msg.topic, readings = msg.readings.len(), "decoded");
                }
                let topic = msg.topic.clone();
                shared.write().await.record_message(&topic, msg.readings.len());

                match hand_off(&tx, msg) {
                    HandOff::Queued => {}
                    HandOff::Dropped => {
                        warn!(%topic, "ingest queue full, message dropped");
                        shared.write().await.record_dropped(&topic);
                    }
                    HandOff::Closed => {
                        warn!("ingest channel closed, stopping mqtt loop");
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        error!(%topic, "subscribe failed: {e}");
                    }
                }
                info!(topics = ?topics, "subscriptions requested");
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
                error!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                tokio::select! {
                    _ = sleep(Duration::from_secs(2)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("mqtt disconnect request failed: {e}");
    }
    shared.write().await.mqtt_connected = false;
    info!("mqtt loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

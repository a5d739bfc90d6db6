//! Family C: JSON in two shapes, or a line-oriented CSV fallback.

use serde_json::{Map, Value};
use tracing::debug;

use super::reading_from_record;
use crate::mac::normalize_mac;
use crate::reading::{battery_millivolts, NormalizedReading};

const MAC_KEYS: &[&str] = &["BLEMAC", "mac"];

pub fn decode(topic: &str, payload: &[u8]) -> Vec<NormalizedReading> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(entries)) => from_array(topic, &entries),
        Ok(Value::Object(obj)) => from_object(topic, &obj),
        Ok(_) => Vec::new(),
        Err(_) => from_lines(topic, &String::from_utf8_lossy(payload)),
    }
}

/// The first entry with a `GatewayMAC` names the gateway; every entry with a
/// `BLEMAC` is a device.
fn from_array(topic: &str, entries: &[Value]) -> Vec<NormalizedReading> {
    let objects = || entries.iter().filter_map(Value::as_object);
    let Some(gateway) = objects()
        .find_map(|e| e.get("GatewayMAC").and_then(Value::as_str))
        .and_then(normalize_mac)
    else {
        return Vec::new();
    };

    objects()
        .filter(|e| e.contains_key("BLEMAC"))
        .filter_map(|e| reading_from_record(topic, &gateway, e, MAC_KEYS))
        .collect()
}

/// `{"gateway": ..., "devices": [...]}`
fn from_object(topic: &str, obj: &Map<String, Value>) -> Vec<NormalizedReading> {
    let gateway = obj.get("gateway").and_then(Value::as_str).and_then(normalize_mac);
    let devices = obj.get("devices").and_then(Value::as_array);
    let (Some(gateway), Some(devices)) = (gateway, devices) else {
        return Vec::new();
    };

    devices
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|d| reading_from_record(topic, &gateway, d, MAC_KEYS))
        .collect()
}

/// First line: gateway MAC as the first comma field. Each following line:
/// `mac,rssi[,battery]`.
fn from_lines(topic: &str, text: &str) -> Vec<NormalizedReading> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let [header, rows @ ..] = lines.as_slice() else {
        return Vec::new();
    };
    if rows.is_empty() {
        return Vec::new();
    }
    let Some(gateway) = header.split(',').next().and_then(|f| normalize_mac(f.trim())) else {
        debug!(topic, "family C text payload has no gateway line");
        return Vec::new();
    };

    rows.iter()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let mac = fields.next().and_then(normalize_mac)?;
            let rssi: f64 = fields.next()?.parse().ok()?;
            let mut reading = NormalizedReading::new(topic, mac, gateway.clone(), rssi.round() as i64);
            reading.battery_mv = fields
                .next()
                .and_then(|b| b.parse::<f64>().ok())
                .map(battery_millivolts);
            reading
                .additional
                .insert("line".into(), Value::String((*line).to_string()));
            Some(reading)
        })
        .collect()
}

use serde::Serialize;
use serde_json::{Map, Value};

/// Values at or below this are volts; above it they are already millivolts.
const BATTERY_VOLTS_CEILING: f64 = 25.0;

/// One observation of a BLE device by a gateway, common to every decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedReading {
    /// MQTT topic the payload arrived on.
    pub topic: String,
    pub ble_mac: String,
    pub gateway_mac: String,
    pub rssi: i64,
    pub adv_type: Option<String>,
    pub raw_payload: Option<String>,
    pub battery_mv: Option<i64>,
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub movement_count: Option<i64>,
    pub additional: Map<String, Value>,
}

impl NormalizedReading {
    /// A reading with only the mandatory fields set. MACs must already be
    /// normalized.
    pub fn new(topic: &str, ble_mac: String, gateway_mac: String, rssi: i64) -> Self {
        Self {
            topic: topic.to_string(),
            ble_mac,
            gateway_mac,
            rssi,
            adv_type: None,
            raw_payload: None,
            battery_mv: None,
            temperature_c: None,
            humidity: None,
            movement_count: None,
            additional: Map::new(),
        }
    }
}

/// Scale a reported battery value to millivolts.
pub fn battery_millivolts(value: f64) -> i64 {
    if value > BATTERY_VOLTS_CEILING {
        value.round() as i64
    } else {
        (value * 1000.0).round() as i64
    }
}

/// A JSON number, or a string holding one.
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First string value among `keys`.
pub(crate) fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// First present value among `keys`.
pub(crate) fn first_value<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

//! Family B: a gateway envelope that may arrive as JSON, base64 or hex.
//!
//! Text encodings are tried in order and the first one that yields JSON wins.
//! Payloads that never become JSON fall back to the legacy TLV frame decoder
//! and then to the Family A array format.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use super::{a, reading_from_record};
use crate::legacy;
use crate::mac::normalize_mac;
use crate::reading::NormalizedReading;

const MAC_KEYS: &[&str] = &["BLEMAC", "mac", "tag"];

type Strategy = fn(&[u8]) -> Option<Value>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("json", json_direct),
    ("base64", json_from_base64),
    ("hex", json_from_hex),
];

fn json_direct(payload: &[u8]) -> Option<Value> {
    serde_json::from_slice(payload).ok()
}

fn json_from_base64(payload: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(payload).ok()?;
    let bytes = STANDARD.decode(text.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn json_from_hex(payload: &[u8]) -> Option<Value> {
    let bytes = hex_bytes(payload)?;
    serde_json::from_slice(&bytes).ok()
}

/// Bytes of a hex-text payload, ignoring any non-hex characters.
fn hex_bytes(payload: &[u8]) -> Option<Vec<u8>> {
    let digits: Vec<u8> = payload
        .iter()
        .copied()
        .filter(u8::is_ascii_hexdigit)
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    hex::decode(digits).ok()
}

pub fn decode(topic: &str, payload: &[u8]) -> Vec<NormalizedReading> {
    for (name, strategy) in STRATEGIES {
        if let Some(value) = strategy(payload) {
            debug!(topic, strategy = name, "family B payload decoded");
            return from_envelope(topic, &value)
                .unwrap_or_else(|| a::decode(topic, value.to_string().as_bytes()));
        }
    }

    let from_legacy = legacy_readings(topic, payload);
    if !from_legacy.is_empty() {
        return from_legacy;
    }
    a::decode(topic, payload)
}

/// `{"gatewayMac": ..., "records": [...]}`. `None` when the value is not
/// shaped like an envelope.
fn from_envelope(topic: &str, value: &Value) -> Option<Vec<NormalizedReading>> {
    let obj = value.as_object()?;
    let records = obj.get("records")?.as_array()?;
    let gateway = obj
        .get("gatewayMac")
        .and_then(Value::as_str)
        .and_then(normalize_mac)?;

    Some(
        records
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|r| reading_from_record(topic, &gateway, r, MAC_KEYS))
            .collect(),
    )
}

/// Hex text is decoded to octets first; anything else is taken as raw
/// frame bytes.
fn legacy_readings(topic: &str, payload: &[u8]) -> Vec<NormalizedReading> {
    let octets = hex_bytes(payload).filter(|_| looks_like_hex(payload));
    let frame = match &octets {
        Some(bytes) => legacy::decode_frame(bytes),
        None => legacy::decode_frame(payload),
    };
    match frame {
        Ok(Some(frame)) => frame.readings(topic),
        Ok(None) => Vec::new(),
        Err(e) => {
            debug!(topic, error = %e, "family B legacy fallback failed");
            Vec::new()
        }
    }
}

fn looks_like_hex(payload: &[u8]) -> bool {
    payload
        .iter()
        .all(|b| b.is_ascii_hexdigit() || b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOPIC: &str = "devices/MK2";

    fn envelope() -> Value {
        json!({
            "gatewayMac": "ac:23:3f:00:00:02",
            "records": [
                {"BLEMAC": "c3:00:00:00:00:0b", "RSSI": -58, "BattVoltage": 3.1, "AdvType": "iBeacon"},
                {"mac": "C3-00-00-00-00-0C", "rssi": -80.4, "BaTtVol": "2990"},
                {"tag": "C3000000000D", "RSSI": "-70"},
                {"RSSI": -50},
            ]
        })
    }

    #[test]
    fn plain_json_envelope() {
        let readings = decode(TOPIC, envelope().to_string().as_bytes());
        assert_eq!(readings.len(), 2);

        assert_eq!(readings[0].gateway_mac, "AC233F000002");
        assert_eq!(readings[0].ble_mac, "C3000000000B");
        assert_eq!(readings[0].rssi, -58);
        assert_eq!(readings[0].battery_mv, Some(3100));
        assert_eq!(readings[0].adv_type.as_deref(), Some("iBeacon"));
        assert_eq!(readings[0].additional["BattVoltage"], json!(3.1));

        assert_eq!(readings[1].ble_mac, "C3000000000C");
        assert_eq!(readings[1].rssi, -80);
        assert_eq!(readings[1].battery_mv, Some(2990));
    }

    #[test]
    fn base64_envelope() {
        let encoded = STANDARD.encode(envelope().to_string());
        let readings = decode(TOPIC, encoded.as_bytes());
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].topic, TOPIC);
    }

    #[test]
    fn hex_envelope() {
        let encoded = hex::encode(envelope().to_string());
        let readings = decode(TOPIC, encoded.as_bytes());
        assert_eq!(readings.len(), 2);
    }

    #[test]
    fn readings_carry_the_arrival_topic() {
        let readings = decode("devices/MK4", envelope().to_string().as_bytes());
        assert!(readings.iter().all(|r| r.topic == "devices/MK4"));
    }

    #[test]
    fn family_a_array_is_accepted() {
        let body = json!([
            {"Format": "Gateway", "GatewayMAC": "AC233F000002"},
            {"Format": "RawData", "BLEMAC": "C3000000000B", "RSSI": -61},
        ]);
        let readings = decode(TOPIC, body.to_string().as_bytes());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].rssi, -61);
    }

    #[test]
    fn hex_legacy_scan_frame_falls_back() {
        // flag 30b2, gateway A1B2C3D4E5F6, one device with MAC and RSSI -64
        let frame = "00 30B2 A1B2C3D4E5F6 0011 \
                     00000101 01000611223344 5566 040001C0";
        let readings = decode(TOPIC, frame.as_bytes());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].gateway_mac, "A1B2C3D4E5F6");
        assert_eq!(readings[0].ble_mac, "112233445566");
        assert_eq!(readings[0].rssi, -64);
        assert_eq!(readings[0].adv_type.as_deref(), Some("eddystone-uid"));
    }

    #[test]
    fn unrecognized_payload_is_empty() {
        assert!(decode(TOPIC, b"hello gateway").is_empty());
        assert!(decode(TOPIC, json!({"status": "ok"}).to_string().as_bytes()).is_empty());
    }
}

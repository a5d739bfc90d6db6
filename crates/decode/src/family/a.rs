//! Family A: a JSON array of entries tagged by `Format`.
//!
//! One `"Gateway"` entry names the gateway; each `"RawData"` entry is one
//! discovered device. Raw advertisement bytes are inspected for Eddystone-TLM
//! and DX-Smart manufacturer data.

use serde_json::{Map, Value};
use tracing::debug;

use crate::mac::normalize_mac;
use crate::octets::round_to;
use crate::reading::NormalizedReading;

const TLM_MARKER: [u8; 3] = [0xAA, 0xFE, 0x20];
const TLM_MIN_LEN: usize = 14;
const DX_SMART_MARKER: [u8; 2] = [0xE2, 0xC5];
const DX_SMART_MIN_LEN: usize = 16;

pub fn decode(topic: &str, payload: &[u8]) -> Vec<NormalizedReading> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(entries)) => decode_entries(topic, &entries),
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!(topic, error = %e, "family A payload is not JSON");
            Vec::new()
        }
    }
}

fn decode_entries(topic: &str, entries: &[Value]) -> Vec<NormalizedReading> {
    let objects = || entries.iter().filter_map(Value::as_object);

    let Some(gateway) = objects()
        .find(|e| format_of(e) == Some("Gateway"))
        .and_then(|e| e.get("GatewayMAC"))
        .and_then(Value::as_str)
        .and_then(normalize_mac)
    else {
        return Vec::new();
    };

    objects()
        .filter(|e| format_of(e) == Some("RawData"))
        .filter_map(|e| reading_from_entry(topic, &gateway, e))
        .collect()
}

fn format_of(entry: &Map<String, Value>) -> Option<&str> {
    entry.get("Format").and_then(Value::as_str)
}

fn reading_from_entry(topic: &str, gateway: &str, entry: &Map<String, Value>) -> Option<NormalizedReading> {
    let mac = entry.get("BLEMAC").and_then(Value::as_str).and_then(normalize_mac)?;
    let rssi = entry.get("RSSI").and_then(Value::as_f64)?;

    let mut reading = NormalizedReading::new(topic, mac, gateway.to_string(), rssi.round() as i64);
    reading.adv_type = entry.get("AdvType").and_then(Value::as_str).map(str::to_string);
    for (from, to) in [("TimeStamp", "source_timestamp"), ("BLEName", "ble_name")] {
        if let Some(v) = entry.get(from) {
            reading.additional.insert(to.to_string(), v.clone());
        }
    }

    if let Some(raw) = entry.get("RawData").and_then(Value::as_str) {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        reading.raw_payload = Some(raw.to_string());
        match hex::decode(raw) {
            Ok(bytes) => inspect_manufacturer_data(&bytes, &mut reading),
            Err(e) => {
                reading
                    .additional
                    .insert("decode_error".into(), e.to_string().into());
            }
        }
    }

    Some(reading)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn inspect_manufacturer_data(bytes: &[u8], reading: &mut NormalizedReading) {
    if let Some(at) = find(bytes, &TLM_MARKER) {
        let frame = &bytes[at + TLM_MARKER.len()..];
        if frame.len() < TLM_MIN_LEN {
            return;
        }
        reading.battery_mv = Some(i64::from(u16_at(frame, 1)));
        let raw_temp = u16_at(frame, 3) as i16;
        // 0x8000 means the beacon has no temperature sensor
        if raw_temp != i16::MIN {
            reading.temperature_c = Some(round_to(f64::from(raw_temp) / 256.0, 1));
        }
        let extra = &mut reading.additional;
        extra.insert("tlm_version".into(), frame[0].into());
        extra.insert("adv_count".into(), u32_at(frame, 5).into());
        extra.insert("sec_count".into(), u32_at(frame, 9).into());
    } else if let Some(at) = find(bytes, &DX_SMART_MARKER) {
        let Some(slice) = at.checked_sub(2).map(|start| &bytes[start..]) else {
            return;
        };
        if slice.len() < DX_SMART_MIN_LEN {
            return;
        }
        let movement = u16_at(slice, 6);
        reading.battery_mv = Some(i64::from(u16_at(slice, 4)));
        reading.movement_count = Some(i64::from(movement));
        let extra = &mut reading.additional;
        extra.insert("movement_counter".into(), movement.into());
        extra.insert("interval_counter".into(), u32_at(slice, 8).into());
    }
}

//! Decoders for the three JSON/text firmware generations.
//!
//! None of these return errors: a payload they cannot read simply yields
//! no readings.

pub mod a;
pub mod b;
pub mod c;

use serde_json::{Map, Value};

use crate::mac::normalize_mac;
use crate::reading::{battery_millivolts, first_str, first_value, numeric, NormalizedReading};

/// Build a reading from a flat device record keyed by the usual aliases.
///
/// The whole record is kept as additional data. `None` when the MAC does
/// not normalize or the RSSI is not a JSON number.
pub(crate) fn reading_from_record(
    topic: &str,
    gateway_mac: &str,
    record: &Map<String, Value>,
    mac_keys: &[&str],
) -> Option<NormalizedReading> {
    let mac = first_str(record, mac_keys).and_then(normalize_mac)?;
    let rssi = first_value(record, &["RSSI", "rssi"]).and_then(Value::as_f64)?;

    let mut reading = NormalizedReading::new(topic, mac, gateway_mac.to_string(), rssi.round() as i64);
    reading.adv_type = record.get("AdvType").and_then(Value::as_str).map(str::to_string);
    reading.raw_payload = record.get("RawData").and_then(Value::as_str).map(str::to_string);
    reading.battery_mv = first_value(record, &["BattVoltage", "BaTtVol"])
        .and_then(numeric)
        .map(battery_millivolts);
    reading.additional = record.clone();
    Some(reading)
}

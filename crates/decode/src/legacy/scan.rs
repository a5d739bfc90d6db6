//! Discovered-device lists (flags `30a0`/`30b2`) and the per-advertisement
//! parsers behind them.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::cursor::TlvCursor;
use crate::octets::{be_signed, be_uint, latin1, parse_time, round_to, to_hex};
use crate::DecodeError;

use super::section::{bit_object, timestamp};

/// Advertisement family of a scanned device, from the 1-byte type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdvType {
    #[serde(rename = "ibeacon")]
    IBeacon,
    #[serde(rename = "eddystone-uid")]
    EddystoneUid,
    #[serde(rename = "eddystone-url")]
    EddystoneUrl,
    #[serde(rename = "eddystone-tlm")]
    EddystoneTlm,
    #[serde(rename = "bxp-devinfo")]
    BxpDevInfo,
    #[serde(rename = "bxp-acc")]
    BxpAcc,
    #[serde(rename = "bxp-th")]
    BxpTh,
    #[serde(rename = "bxp-button")]
    BxpButton,
    #[serde(rename = "bxp-tag")]
    BxpTag,
    #[serde(rename = "pir")]
    Pir,
    #[serde(rename = "other")]
    Other,
    #[serde(rename = "tof")]
    Tof,
}

impl AdvType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::IBeacon,
            1 => Self::EddystoneUid,
            2 => Self::EddystoneUrl,
            3 => Self::EddystoneTlm,
            4 => Self::BxpDevInfo,
            5 => Self::BxpAcc,
            6 => Self::BxpTh,
            7 => Self::BxpButton,
            8 => Self::BxpTag,
            9 => Self::Pir,
            10 => Self::Other,
            11 => Self::Tof,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IBeacon => "ibeacon",
            Self::EddystoneUid => "eddystone-uid",
            Self::EddystoneUrl => "eddystone-url",
            Self::EddystoneTlm => "eddystone-tlm",
            Self::BxpDevInfo => "bxp-devinfo",
            Self::BxpAcc => "bxp-acc",
            Self::BxpTh => "bxp-th",
            Self::BxpButton => "bxp-button",
            Self::BxpTag => "bxp-tag",
            Self::Pir => "pir",
            Self::Other => "other",
            Self::Tof => "tof",
        }
    }
}

/// One BLE device as reported in a scan frame.
///
/// Common attributes are typed; type-specific values land in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScannedDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv_type: Option<AdvType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv_packet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_packet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_mv: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_count: Option<i64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl ScannedDevice {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }
}

/// Decode a scan list. Tags 0-4 carry fixed-width values behind an unused
/// length; everything else is length-prefixed.
pub(crate) fn decode(cursor: &mut TlvCursor<'_>) -> Result<Vec<ScannedDevice>, DecodeError> {
    let mut devices = Vec::new();
    let mut current = ScannedDevice::default();

    while !cursor.is_exhausted() {
        let tag = cursor.read_tag()?;
        match tag {
            0x00 => {
                cursor.advance(2)?;
                if !current.is_empty() {
                    devices.push(std::mem::take(&mut current));
                }
                let code = cursor.read_tag()?;
                current.type_code = Some(code);
                current.adv_type = AdvType::from_code(code);
            }
            0x01 => {
                cursor.advance(2)?;
                current.mac = Some(to_hex(cursor.take(6)?));
            }
            0x02 => {
                cursor.advance(2)?;
                current.connectable = Some(cursor.read_tag()? != 0);
            }
            0x03 => {
                cursor.advance(2)?;
                let ts = timestamp(be_uint(cursor.take(4)?)?)?;
                let tz = cursor.read_tag()?;
                current.timestamp = Some(ts);
                current.timezone = Some(tz);
                current.current_time = Some(parse_time(ts, i64::from(tz))?);
            }
            0x04 => {
                cursor.advance(2)?;
                current.rssi = Some(i64::from(cursor.read_tag()?) - 256);
            }
            0x05 => {
                current.adv_packet = Some(to_hex(cursor.read_length_prefixed_value()?));
            }
            0x06 => {
                current.response_packet = Some(to_hex(cursor.read_length_prefixed_value()?));
            }
            _ => {
                let value = cursor.read_length_prefixed_value()?;
                if tag < 0x0A {
                    continue;
                }
                if let Some(kind) = current.adv_type {
                    if let Err(e) = parse_adv_field(&mut current, kind, tag, value) {
                        warn!(adv_type = kind.as_str(), tag, error = %e, "advertisement field not decoded");
                    }
                }
            }
        }
    }

    if !current.is_empty() {
        devices.push(current);
    }
    Ok(devices)
}

fn first(value: &[u8]) -> Result<u8, DecodeError> {
    value.first().copied().ok_or(DecodeError::Truncated {
        offset: 0,
        wanted: 1,
        remaining: 0,
    })
}

fn signed_byte(value: &[u8]) -> Result<i64, DecodeError> {
    Ok(i64::from(first(value)? as i8))
}

fn axis(value: &[u8]) -> Value {
    let mut out = Map::new();
    for (label, b) in ["x", "y", "z"].iter().zip(value) {
        out.insert((*label).to_string(), to_hex(&[*b]).into());
    }
    Value::Object(out)
}

fn label(table: &[&'static str], code: u8) -> Option<&'static str> {
    table.get(usize::from(code)).copied()
}

const SAMPLING_RATES: &[&str] = &["1hz", "10hz", "25hz", "50hz", "100hz"];
const FULL_SCALES: &[&str] = &["2g", "4g", "8g", "16g"];
const FRAME_TYPES: &[&str] = &["Single press mode", "Double press mode", "Long press mode", "Abnormal"];
const PIR_LEVELS: &[&str] = &["Low", "Medium", "High"];

fn parse_adv_field(d: &mut ScannedDevice, kind: AdvType, tag: u8, v: &[u8]) -> Result<(), DecodeError> {
    match (kind, tag) {
        // iBeacon
        (AdvType::IBeacon, 0x0A) => d.set("uuid", to_hex(v)),
        (AdvType::IBeacon, 0x0B) => d.set("major", be_uint(v)?),
        (AdvType::IBeacon, 0x0C) => d.set("minor", be_uint(v)?),
        (AdvType::IBeacon, 0x0D) => d.set("rssi_1m", signed_byte(v)?),

        // Eddystone
        (AdvType::EddystoneUid, 0x0A) => d.set("namespace", to_hex(v)),
        (AdvType::EddystoneUid, 0x0B) => d.set("rssi_0m", signed_byte(v)?),
        (AdvType::EddystoneUid, 0x0C) => d.set("instance", to_hex(v)),
        (AdvType::EddystoneUrl, 0x0A) => d.set("url", latin1(v)),
        (AdvType::EddystoneUrl, 0x0B) => d.set("rssi_0m", signed_byte(v)?),
        (AdvType::EddystoneTlm, 0x0A) => d.set("tlm_version", be_uint(v)?),
        (AdvType::EddystoneTlm, 0x0B) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::EddystoneTlm, 0x0C) => {
            d.temperature_c = Some(round_to(be_signed(v)? as f64 / 256.0, 1));
        }
        (AdvType::EddystoneTlm, 0x0D) => d.set("adv_cnt", be_uint(v)?),
        (AdvType::EddystoneTlm, 0x0E) => d.set("sec_cnt", be_uint(v)?),

        // Shared BXP framing
        (AdvType::BxpDevInfo | AdvType::BxpAcc | AdvType::BxpTh, 0x0A) => {
            d.set("tx_power", signed_byte(v)?);
        }
        (AdvType::BxpDevInfo | AdvType::BxpAcc | AdvType::BxpTh, 0x0B) => {
            d.set("ranging_data", signed_byte(v)?);
        }
        (AdvType::BxpDevInfo | AdvType::BxpAcc | AdvType::BxpTh, 0x0C) => {
            d.set("adv_interval_ms", u64::from(first(v)?) * 100);
        }

        // BXP device info
        (AdvType::BxpDevInfo, 0x0D) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::BxpDevInfo, 0x0E) => {
            let b = first(v)?;
            d.set("password_verification_enabled", b & 0x03 == 0);
            d.set("ambient_light_sensor_enabled", (b >> 2) & 0x01 == 0);
            d.set("hall_door_sensor_enabled", (b >> 3) & 0x01 == 0);
        }
        (AdvType::BxpDevInfo, 0x0F) => {
            let b = first(v)?;
            d.set("connectable", b & 0x01 == 0);
            d.set("ambient_light", (b >> 1) & 0x01 == 0);
            d.set("door_open", (b >> 2) & 0x01 == 0);
        }
        (AdvType::BxpDevInfo, 0x10) => d.set("firmware_version", latin1(v)),
        (AdvType::BxpDevInfo, 0x11) => d.set("device_name", latin1(v)),

        // BXP accelerometer
        (AdvType::BxpAcc, 0x0D) => {
            if let Some(rate) = label(SAMPLING_RATES, first(v)?) {
                d.set("sampling_rate", rate);
            }
        }
        (AdvType::BxpAcc, 0x0E) => {
            if let Some(scale) = label(FULL_SCALES, first(v)?) {
                d.set("full_scale", scale);
            }
        }
        (AdvType::BxpAcc, 0x0F) => d.set("motion_threshold_g", round_to(f64::from(first(v)?) * 0.1, 1)),
        (AdvType::BxpAcc, 0x10) => d.set("axis", axis(v)),
        (AdvType::BxpAcc, 0x11) => d.battery_mv = Some(be_uint(v)? as i64),

        // BXP temperature/humidity
        (AdvType::BxpTh, 0x0D) => d.temperature_c = Some(round_to(be_signed(v)? as f64 * 0.1, 1)),
        (AdvType::BxpTh, 0x0E) => d.humidity = Some(round_to(be_signed(v)? as f64 * 0.1, 1)),
        (AdvType::BxpTh, 0x0F) => d.battery_mv = Some(be_uint(v)? as i64),

        // BXP button
        (AdvType::BxpButton, 0x0A) => {
            if let Some(frame) = label(FRAME_TYPES, first(v)? & 0x0F) {
                d.set("frame_type", frame);
            }
        }
        (AdvType::BxpButton, 0x0B) => {
            let b = first(v)?;
            d.set("password_verify_flag", b & 0x01);
            d.set("trigger_status", (b >> 1) & 0x01);
        }
        (AdvType::BxpButton, 0x0C) => d.trigger_count = Some(be_uint(v)? as i64),
        (AdvType::BxpButton, 0x0D) => d.set("device_id", to_hex(v)),
        (AdvType::BxpButton, 0x0E) => d.set("firmware_type", first(v)?),
        (AdvType::BxpButton, 0x0F) => d.set("device_name", latin1(v)),
        (AdvType::BxpButton, 0x10) => {
            if let Some(scale) = label(FULL_SCALES, first(v)?) {
                d.set("full_scale", scale);
            }
        }
        (AdvType::BxpButton, 0x11) => d.set("motion_threshold_g", round_to(f64::from(first(v)?) * 0.1, 1)),
        (AdvType::BxpButton, 0x12) => d.set("axis", axis(v)),
        (AdvType::BxpButton, 0x13) => d.temperature_c = Some(round_to(be_signed(v)? as f64 * 0.25, 1)),
        (AdvType::BxpButton, 0x14) => d.set("ranging_data", signed_byte(v)?),
        (AdvType::BxpButton, 0x15) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::BxpButton, 0x16) => d.set("tx_power", signed_byte(v)?),

        // BXP tag
        (AdvType::BxpTag, 0x0A) => {
            d.set(
                "sensor_status",
                bit_object(&["hall_sensor", "axis", "axis_equipped"], u64::from(first(v)?)),
            );
        }
        (AdvType::BxpTag, 0x0B) => d.set("hall_trigger_event_count", be_uint(v)?),
        (AdvType::BxpTag, 0x0C) => d.trigger_count = Some(be_uint(v)? as i64),
        (AdvType::BxpTag, 0x0D) => d.set("axis", axis(v)),
        (AdvType::BxpTag, 0x0E) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::BxpTag, 0x0F) => d.set("tag_id", to_hex(v)),
        (AdvType::BxpTag, 0x10) => d.set("device_name", latin1(v)),

        // PIR
        (AdvType::Pir, 0x0A) => {
            if let Some(level) = label(PIR_LEVELS, first(v)?) {
                d.set("delay_response_status", level);
            }
        }
        (AdvType::Pir, 0x0B) => d.set("door_status", if first(v)? == 0 { "open" } else { "close" }),
        (AdvType::Pir, 0x0C) => {
            if let Some(level) = label(PIR_LEVELS, first(v)?) {
                d.set("sensor_sensitivity", level);
            }
        }
        (AdvType::Pir, 0x0D) => d.set(
            "sensor_detection_status",
            if first(v)? == 0 { "no effective motion" } else { "effective motion" },
        ),
        (AdvType::Pir, 0x0E) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::Pir, 0x0F) => d.set("major", be_uint(v)?),
        (AdvType::Pir, 0x10) => d.set("minor", be_uint(v)?),
        (AdvType::Pir, 0x11) => d.set("rssi_1m", signed_byte(v)?),
        (AdvType::Pir, 0x12) => d.set("tx_power", signed_byte(v)?),
        (AdvType::Pir, 0x13) => d.set("device_name", latin1(v)),

        // TOF
        (AdvType::Tof, 0x0A) => d.set("manufacturer_vendor_code", be_uint(v)?),
        (AdvType::Tof, 0x0B) => d.battery_mv = Some(be_uint(v)? as i64),
        (AdvType::Tof, 0x0C) => d.set("user_data", be_uint(v)?),
        (AdvType::Tof, 0x0D) => d.set("ranging_distance", be_uint(v)?),

        // Other: ten opaque data blocks
        (AdvType::Other, 0x0A..=0x13) => {
            d.set(&format!("data_block_{}", tag - 0x09), to_hex(v));
        }

        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan(data: &[u8]) -> Vec<ScannedDevice> {
        decode(&mut TlvCursor::new(data)).unwrap()
    }

    /// Common header for one device: type, mac, connectable, time, rssi.
    fn device_header(type_code: u8, mac_last: u8, rssi_byte: u8) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, type_code];
        out.extend([0x01, 0x00, 0x06, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, mac_last]);
        out.extend([0x02, 0x00, 0x01, 0x01]);
        out.extend([0x03, 0x00, 0x05, 0x65, 0x53, 0xF1, 0x00, 0x00]);
        out.extend([0x04, 0x00, 0x01, rssi_byte]);
        out
    }

    #[test]
    fn ibeacon_device() {
        let mut data = device_header(0, 0x01, 0xC4);
        data.extend([0x05, 0x00, 0x03, 0x02, 0x01, 0x06]);
        data.extend([0x0A, 0x00, 0x02, 0xE2, 0xC5]);
        data.extend([0x0B, 0x00, 0x02, 0x00, 0x0A]);
        data.extend([0x0C, 0x00, 0x02, 0x00, 0x14]);
        data.extend([0x0D, 0x00, 0x01, 0xC5]);

        let devices = scan(&data);
        assert_eq!(devices.len(), 1);
        let d = &devices[0];
        assert_eq!(d.adv_type, Some(AdvType::IBeacon));
        assert_eq!(d.mac.as_deref(), Some("AABBCCDDEE01"));
        assert_eq!(d.connectable, Some(true));
        assert_eq!(d.current_time.as_deref(), Some("2023-11-14 22:13:20"));
        assert_eq!(d.rssi, Some(0xC4 - 256));
        assert_eq!(d.adv_packet.as_deref(), Some("020106"));
        assert_eq!(d.fields["uuid"], json!("E2C5"));
        assert_eq!(d.fields["major"], json!(10));
        assert_eq!(d.fields["minor"], json!(20));
        assert_eq!(d.fields["rssi_1m"], json!(-59));
    }

    #[test]
    fn two_devices_are_split_on_type_tag() {
        let mut data = device_header(3, 0x01, 0xB0);
        data.extend([0x0B, 0x00, 0x02, 0x0B, 0xB8]); // 3000 mV
        data.extend([0x0C, 0x00, 0x02, 0x17, 0x80]); // 23.5 C
        data.extend(device_header(6, 0x02, 0xA0));
        data.extend([0x0D, 0x00, 0x02, 0x00, 0xEB]); // 23.5 C
        data.extend([0x0E, 0x00, 0x02, 0x01, 0xF4]); // 50.0 %
        data.extend([0x0F, 0x00, 0x02, 0x0C, 0x1C]); // 3100 mV

        let devices = scan(&data);
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].adv_type, Some(AdvType::EddystoneTlm));
        assert_eq!(devices[0].battery_mv, Some(3000));
        assert_eq!(devices[0].temperature_c, Some(23.5));

        assert_eq!(devices[1].adv_type, Some(AdvType::BxpTh));
        assert_eq!(devices[1].temperature_c, Some(23.5));
        assert_eq!(devices[1].humidity, Some(50.0));
        assert_eq!(devices[1].battery_mv, Some(3100));
    }

    #[test]
    fn negative_temperatures_sign_extend() {
        let mut data = device_header(7, 0x03, 0xB0);
        data.extend([0x13, 0x00, 0x02, 0xFF, 0xEC]); // -20 * 0.25
        data.extend([0x0A, 0x00, 0x01, 0x01]);
        data.extend([0x0C, 0x00, 0x02, 0x00, 0x07]);

        let d = &scan(&data)[0];
        assert_eq!(d.temperature_c, Some(-5.0));
        assert_eq!(d.fields["frame_type"], json!("Double press mode"));
        assert_eq!(d.trigger_count, Some(7));
    }

    #[test]
    fn unknown_type_code_keeps_common_fields() {
        let mut data = device_header(0x2A, 0x04, 0xB0);
        data.extend([0x0A, 0x00, 0x01, 0xFF]);

        let d = &scan(&data)[0];
        assert_eq!(d.type_code, Some(0x2A));
        assert_eq!(d.adv_type, None);
        assert!(d.fields.is_empty());
        assert_eq!(d.mac.as_deref(), Some("AABBCCDDEE04"));
    }

    #[test]
    fn other_data_blocks_are_numbered() {
        let mut data = device_header(10, 0x05, 0xB0);
        data.extend([0x0A, 0x00, 0x01, 0x11]);
        data.extend([0x13, 0x00, 0x01, 0x22]);

        let d = &scan(&data)[0];
        assert_eq!(d.fields["data_block_1"], json!("11"));
        assert_eq!(d.fields["data_block_10"], json!("22"));
    }

    #[test]
    fn truncated_mac_is_an_error() {
        let data = [0x01, 0x00, 0x06, 0xAA, 0xBB];
        assert!(decode(&mut TlvCursor::new(&data)).is_err());
    }

    #[test]
    fn adv_type_codes_round_trip_names() {
        assert_eq!(AdvType::from_code(4).map(AdvType::as_str), Some("bxp-devinfo"));
        assert_eq!(AdvType::from_code(11).map(AdvType::as_str), Some("tof"));
        assert_eq!(AdvType::from_code(12), None);
    }
}

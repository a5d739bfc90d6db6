//! Flag-dispatched TLV frames from the older gateway firmware.
//!
//! ```text
//! byte  0      1..=2   3..=8         9..=10   11..
//!       unused flag    gateway MAC   length   device-data TLV stream
//! ```
//!
//! The flag selects a handler from [`handler_for`]. Settings handlers fill a
//! named section; scan handlers produce a list of discovered devices.

mod fix;
pub mod scan;
mod section;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cursor::TlvCursor;
use crate::mac::normalize_mac;
use crate::octets::{parse_octets, to_hex};
use crate::reading::NormalizedReading;
use crate::DecodeError;

pub use scan::{AdvType, ScannedDevice};
use section::Section;

/// Frames of this many octets or fewer carry no device data.
const HEADER_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyFrame {
    /// Lower-case hex flag, e.g. `"30a0"`.
    pub flag: String,
    pub gateway_mac: String,
    /// Length field from the header.
    pub length: u16,
    /// Device-data bytes consumed by the handler.
    pub consumed: usize,
    pub body: FrameBody,
}

impl LegacyFrame {
    /// Scan frames as normalized readings. Devices without a MAC or an RSSI
    /// are dropped; settings frames yield nothing.
    pub fn readings(&self, topic: &str) -> Vec<NormalizedReading> {
        let FrameBody::Scan { devices } = &self.body else {
            return Vec::new();
        };
        devices
            .iter()
            .filter_map(|d| {
                let mac = d.mac.as_deref().and_then(normalize_mac)?;
                let mut r = NormalizedReading::new(topic, mac, self.gateway_mac.clone(), d.rssi?);
                r.adv_type = d.adv_type.map(|t| t.as_str().to_string());
                r.raw_payload = d.adv_packet.clone();
                r.battery_mv = d.battery_mv;
                r.temperature_c = d.temperature_c;
                r.humidity = d.humidity;
                r.movement_count = d.trigger_count;
                if let Ok(Value::Object(extra)) = serde_json::to_value(d) {
                    r.additional = extra;
                }
                r.additional.insert("legacy_flag".into(), self.flag.clone().into());
                Some(r)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameBody {
    Section {
        name: &'static str,
        fields: Map<String, Value>,
    },
    Scan {
        devices: Vec<ScannedDevice>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Handler {
    Section(&'static Section),
    Fix,
    Scan,
}

fn handler_for(flag: u16) -> Option<Handler> {
    use section::*;

    let section = match flag {
        0x2003 => &DEVICE_INFO,
        0x3004 => &DEVICE_STATUS,
        0x3006 => &OTA_RESULT,
        0x2007 => &NTP,
        0x2008 => &CURRENT_TIME,
        0x2009 => &COMMUNICATION_TIMEOUT,
        0x200a => &INDICATOR,
        0x200b => &UPDATE_STATUS,
        0x200c => &REPORT_SETTINGS,
        0x200d => &POWER_OFF_NOTIFY,
        0x200e => &BLE_PASSWORD,
        0x200f => &PASSWORD_VERIFY,
        0x3010 => &POWER_OFF_ALARM,
        0x3011 => &LOW_POWER_ALARM,
        0x2012 => &LOW_POWER,
        0x2013 => &BATTERY,
        0x2015 => &POWER_ON,
        0x2020 => &NETWORK_SETTINGS,
        0x2021 => &CONNECT,
        0x2030 => &MQTT_SETTINGS,
        0x3032 => &MQTT_CERT_RESULT,
        0x2040 => &SCANNER_REPORT_MODE,
        0x2041 => &ALWAYS_SCAN,
        0x2042 => &PERIODIC_SCAN_IMMEDIATE_REPORT,
        0x2043 => &PERIODIC_SCAN_PERIODIC_REPORT,
        0x2050 => &FILTER_RELATIONSHIP,
        0x2051 => &FILTER_RSSI,
        0x2052 => &FILTER_PHY,
        0x2053 => &FILTER_MAC,
        0x2054 => &FILTER_NAME,
        0x2055 => &FILTER_RAWDATA,
        0x2056 => &FILTER_IBEACON,
        0x2057 => &FILTER_EDDYSTONE_UID,
        0x2058 => &FILTER_EDDYSTONE_URL,
        0x2059 => &FILTER_EDDYSTONE_TLM,
        0x205a => &FILTER_BXP_DEVICE_INFO,
        0x205b => &FILTER_BXP_ACC,
        0x205c => &FILTER_BXP_TH,
        0x205d => &FILTER_BXP_BUTTON,
        0x205e => &FILTER_BXP_TAG,
        0x205f => &FILTER_PIR,
        0x2060 => &FILTER_TOF,
        0x2061 => &FILTER_OTHER,
        0x2062 => &FILTER_DUPLICATE,
        0x2070 => &ADV_SETTINGS,
        0x2071 => &IBEACON_SETTINGS,
        0x2080 => &FIX_MODE,
        0x2081 => &PERIODIC_FIX,
        0x2082 => &AXIS_PARAMS,
        0x2083 => &MOTION_START,
        0x2084 => &MOTION_IN_TRIP,
        0x2085 => &MOTION_STOP,
        0x2086 => &STATIONARY,
        0x2087 => &GPS_PARAMS,
        0x2090 => &IBEACON_PAYLOAD,
        0x2091 => &EDDYSTONE_UID_PAYLOAD,
        0x2092 => &EDDYSTONE_URL_PAYLOAD,
        0x2093 => &EDDYSTONE_TLM_PAYLOAD,
        0x2094 => &BXP_DEVICE_INFO_PAYLOAD,
        0x2095 => &BXP_ACC_PAYLOAD,
        0x2096 => &BXP_TH_PAYLOAD,
        0x2097 => &BXP_BUTTON_PAYLOAD,
        0x2098 => &BXP_TAG_PAYLOAD,
        0x2099 => &PIR_PAYLOAD,
        0x209a => &TOF_PAYLOAD,
        0x209b => &OTHER_PAYLOAD,
        0x3089 | 0x30b1 => return Some(Handler::Fix),
        0x30a0 | 0x30b2 => return Some(Handler::Scan),
        _ => return None,
    };
    Some(Handler::Section(section))
}

/// Decode a whitespace-tolerant hex payload.
///
/// `Ok(None)` means there was nothing to decode: the frame is too short or
/// the flag is not one we know.
pub fn handle_payload(payload: &str) -> Result<Option<LegacyFrame>, DecodeError> {
    let octets = parse_octets(payload).inspect_err(|e| {
        warn!(error = %e, len = payload.len(), "legacy payload is not hex");
    })?;
    decode_frame(&octets)
}

/// Decode a frame that is already in octets.
pub fn decode_frame(octets: &[u8]) -> Result<Option<LegacyFrame>, DecodeError> {
    if octets.len() <= HEADER_LEN {
        return Ok(None);
    }

    let flag_code = u16::from_be_bytes([octets[1], octets[2]]);
    let flag = format!("{flag_code:04x}");
    let Some(handler) = handler_for(flag_code) else {
        debug!(flag, "unknown legacy flag");
        return Ok(None);
    };

    let gateway_mac = to_hex(&octets[3..9]);
    let length = u16::from_be_bytes([octets[9], octets[10]]);
    let mut cursor = TlvCursor::new(&octets[HEADER_LEN..]);

    let body = match handler {
        Handler::Section(section) => section
            .decode(&mut cursor)
            .map(|fields| FrameBody::Section { name: section.name, fields }),
        Handler::Fix => fix::decode(&mut cursor).map(|fields| FrameBody::Section {
            name: "fix_data",
            fields,
        }),
        Handler::Scan => scan::decode(&mut cursor).map(|devices| FrameBody::Scan { devices }),
    };

    let body = body.inspect_err(|e| {
        warn!(
            flag,
            gateway = %gateway_mac,
            offset = cursor.position(),
            hex = %to_hex(&octets[..octets.len().min(64)]),
            error = %e,
            "legacy frame decode failed"
        );
    })?;

    Ok(Some(LegacyFrame {
        flag,
        gateway_mac,
        length,
        consumed: cursor.position(),
        body,
    }))
}

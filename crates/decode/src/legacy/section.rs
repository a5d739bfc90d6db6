//! Declarative field tables for the settings/info handlers.
//!
//! Each flag maps to a [`Section`]: a name plus the tags it understands and
//! how each tag's value bytes turn into a JSON field. Tags missing from a
//! table are skipped by their declared length.

use serde_json::{Map, Value};
use tracing::debug;

use crate::cursor::TlvCursor;
use crate::octets::{be_uint, latin1, parse_time, to_hex};
use crate::DecodeError;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    /// Latin-1 string.
    Text,
    /// Big-endian unsigned over the whole value.
    Uint,
    /// First octet, unsigned.
    Byte,
    /// First octet, two's complement.
    SignedByte,
    Hex,
    /// First octet equals 1.
    Switch,
    /// Named bits of the first octet, LSB first.
    Flags(&'static [&'static str]),
    /// Named bits of the whole value, LSB first.
    Mask(&'static [&'static str]),
    /// First octet indexes a label table.
    Choice(&'static [&'static str]),
    HexList,
    TextList,
    /// Unsigned seconds plus a formatted `<name>_str` at UTC.
    UnixTime,
    /// Signed hour offset; formats the section's `timestamp` into `time_str`.
    TimeZone,
    /// Three raw axis octets.
    Axis,
    /// `{type, start, end, data}` match rule, appended.
    Rules,
}

#[derive(Debug)]
pub(crate) struct Field {
    tag: u8,
    name: &'static str,
    kind: Kind,
}

const fn f(tag: u8, name: &'static str, kind: Kind) -> Field {
    Field { tag, name, kind }
}

#[derive(Debug)]
pub(crate) struct Section {
    pub(crate) name: &'static str,
    fields: &'static [Field],
}

impl Section {
    /// Walk the TLV stream to its end, filling one JSON object.
    pub(crate) fn decode(&self, cursor: &mut TlvCursor<'_>) -> Result<Map<String, Value>, DecodeError> {
        let mut out = Map::new();
        while !cursor.is_exhausted() {
            let tag = cursor.read_tag()?;
            let value = cursor.read_length_prefixed_value()?;
            match self.fields.iter().find(|fld| fld.tag == tag) {
                Some(field) => field.write(value, &mut out)?,
                None => debug!(section = self.name, tag, "skipping unknown tag"),
            }
        }
        Ok(out)
    }
}

impl Field {
    fn write(&self, v: &[u8], out: &mut Map<String, Value>) -> Result<(), DecodeError> {
        let name = self.name;
        match self.kind {
            Kind::Text => {
                out.insert(name.into(), latin1(v).into());
            }
            Kind::Uint => {
                out.insert(name.into(), be_uint(v)?.into());
            }
            Kind::Byte => {
                if let Some(&b) = v.first() {
                    out.insert(name.into(), b.into());
                }
            }
            Kind::SignedByte => {
                if let Some(&b) = v.first() {
                    out.insert(name.into(), (b as i8).into());
                }
            }
            Kind::Hex => {
                out.insert(name.into(), to_hex(v).into());
            }
            Kind::Switch => {
                if let Some(&b) = v.first() {
                    out.insert(name.into(), (b == 1).into());
                }
            }
            Kind::Flags(bits) => {
                if let Some(&b) = v.first() {
                    out.insert(name.into(), bit_object(bits, u64::from(b)));
                }
            }
            Kind::Mask(bits) => {
                out.insert(name.into(), bit_object(bits, be_uint(v)?));
            }
            Kind::Choice(labels) => match v.first().and_then(|&b| labels.get(usize::from(b))) {
                Some(label) => {
                    out.insert(name.into(), (*label).into());
                }
                None => debug!(field = name, code = ?v.first(), "code outside label table"),
            },
            Kind::HexList => push(out, name, to_hex(v).into()),
            Kind::TextList => push(out, name, latin1(v).into()),
            Kind::UnixTime => {
                let ts = timestamp(be_uint(v)?)?;
                out.insert(name.into(), ts.into());
                out.insert(format!("{name}_str"), parse_time(ts, 0)?.into());
            }
            Kind::TimeZone => {
                if let Some(&b) = v.first() {
                    let tz = i64::from(b as i8);
                    out.insert(name.into(), tz.into());
                    if let Some(ts) = out.get("timestamp").and_then(Value::as_i64) {
                        out.insert("time_str".into(), parse_time(ts, tz)?.into());
                    }
                }
            }
            Kind::Axis => {
                let mut axis = Map::new();
                for (label, b) in ["x", "y", "z"].iter().zip(v) {
                    axis.insert((*label).into(), to_hex(&[*b]).into());
                }
                out.insert(name.into(), Value::Object(axis));
            }
            Kind::Rules => {
                if let [kind, start, end, data @ ..] = v {
                    let mut rule = Map::new();
                    rule.insert("type".into(), to_hex(&[*kind]).into());
                    rule.insert("start".into(), (*start).into());
                    rule.insert("end".into(), (*end).into());
                    rule.insert("data".into(), to_hex(data).into());
                    push(out, name, Value::Object(rule));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn bit_object(names: &[&str], value: u64) -> Value {
    let map = names
        .iter()
        .enumerate()
        .map(|(i, n)| ((*n).to_string(), Value::Bool((value >> i) & 1 == 1)))
        .collect();
    Value::Object(map)
}

fn push(out: &mut Map<String, Value>, name: &str, item: Value) {
    let slot = out
        .entry(name.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = slot {
        items.push(item);
    }
}

pub(crate) fn timestamp(raw: u64) -> Result<i64, DecodeError> {
    i64::try_from(raw).map_err(|_| DecodeError::TimestampOutOfRange(i64::MAX))
}

// ---------------------------------------------------------------------------
// Label tables
// ---------------------------------------------------------------------------

const LOW_POWER_LEVELS: &[&str] = &["10%", "20%", "30%", "40%", "50%"];
const SCANNER_REPORT_MODES: &[&str] = &[
    "Scanner off",
    "Always scan",
    "Always scan periodic report",
    "Periodic scan immediate report",
    "Periodic scan periodic report",
];
const PIR_DELAY_FILTER: &[&str] = &["Low delay", "Medium delay", "High delay", "All type"];
const PIR_DOOR_FILTER: &[&str] = &["Close", "Open", "All type"];
const PIR_SENSITIVITY_FILTER: &[&str] = &[
    "Low sensitivity",
    "Medium sensitivity",
    "High sensitivity",
    "All type",
];
const PIR_DETECTION_FILTER: &[&str] = &[
    "No effective motion detected",
    "Effective motion detected",
    "All type",
];
const OTHER_RELATIONS: &[&str] = &["A", "A&B", "A|B", "A&B&C", "(A&B)|C", "A|B|C"];
const DUPLICATE_RULES: &[&str] = &["None", "MAC", "MAC+Data type", "MAC+RAW Data"];
const FIX_MODES: &[&str] = &["OFF", "Periodic fix", "Motion fix"];

const RAW_DATA_TYPES: &[&str] = &[
    "ibeacon",
    "eddystone_uid",
    "eddystone_url",
    "eddystone_tlm",
    "bxp_device_info",
    "bxp_acc",
    "bxp_th",
    "bxp_button",
    "bxp_tag",
    "pir",
    "tof",
    "other",
];

// ---------------------------------------------------------------------------
// Device info / status
// ---------------------------------------------------------------------------

pub(crate) static DEVICE_INFO: Section = Section {
    name: "device_info",
    fields: &[
        f(0, "device_name", Kind::Text),
        f(1, "product_model", Kind::Text),
        f(2, "company_name", Kind::Text),
        f(3, "hardware_version", Kind::Text),
        f(4, "software_version", Kind::Text),
        f(5, "firmware_version", Kind::Text),
        f(6, "imei", Kind::Text),
        f(7, "iccid", Kind::Text),
    ],
};

pub(crate) static DEVICE_STATUS: Section = Section {
    name: "device_status",
    fields: &[
        f(0, "timestamp", Kind::Uint),
        f(1, "network_type", Kind::Text),
        f(2, "csq", Kind::Byte),
        f(3, "batt_voltage_mv", Kind::Uint),
        f(4, "axis", Kind::Axis),
        f(5, "acc_status", Kind::Byte),
        f(6, "imei", Kind::Text),
    ],
};

pub(crate) static OTA_RESULT: Section = Section {
    name: "ota_result",
    fields: &[f(0, "result", Kind::SignedByte)],
};

pub(crate) static NTP: Section = Section {
    name: "ntp",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "host", Kind::Text),
        f(2, "interval", Kind::Byte),
    ],
};

pub(crate) static CURRENT_TIME: Section = Section {
    name: "current_time",
    fields: &[f(0, "timestamp", Kind::Uint), f(1, "timezone", Kind::TimeZone)],
};

pub(crate) static COMMUNICATION_TIMEOUT: Section = Section {
    name: "communication_timeout",
    fields: &[f(0, "timeout", Kind::Byte)],
};

pub(crate) static INDICATOR: Section = Section {
    name: "indicator",
    fields: &[f(0, "status", Kind::Flags(&["power", "switch", "network", "gps"]))],
};

pub(crate) static UPDATE_STATUS: Section = Section {
    name: "update_status",
    fields: &[f(0, "updating", Kind::Switch)],
};

pub(crate) static REPORT_SETTINGS: Section = Section {
    name: "report_settings",
    fields: &[
        f(0, "interval", Kind::Uint),
        f(1, "content", Kind::Flags(&["batt_voltage", "axis_data", "acc_status"])),
    ],
};

pub(crate) static POWER_OFF_NOTIFY: Section = Section {
    name: "power_off_notify",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static BLE_PASSWORD: Section = Section {
    name: "ble_password",
    fields: &[f(0, "password", Kind::Text)],
};

pub(crate) static PASSWORD_VERIFY: Section = Section {
    name: "password_verify",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static POWER_OFF_ALARM: Section = Section {
    name: "power_off_alarm",
    fields: &[f(0, "timestamp", Kind::UnixTime), f(1, "batt_voltage_mv", Kind::Uint)],
};

pub(crate) static LOW_POWER_ALARM: Section = Section {
    name: "low_power_alarm",
    fields: &[f(0, "timestamp", Kind::UnixTime), f(1, "batt_voltage_mv", Kind::Uint)],
};

pub(crate) static LOW_POWER: Section = Section {
    name: "low_power",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "percentage", Kind::Choice(LOW_POWER_LEVELS)),
    ],
};

pub(crate) static BATTERY: Section = Section {
    name: "battery",
    fields: &[f(0, "voltage_mv", Kind::Uint)],
};

pub(crate) static POWER_ON: Section = Section {
    name: "power_on",
    fields: &[f(0, "enable", Kind::Byte)],
};

// ---------------------------------------------------------------------------
// Network / MQTT
// ---------------------------------------------------------------------------

pub(crate) static NETWORK_SETTINGS: Section = Section {
    name: "network_settings",
    fields: &[
        f(0, "priority", Kind::Byte),
        f(1, "apn", Kind::Text),
        f(2, "apn_username", Kind::Text),
        f(3, "apn_password", Kind::Text),
    ],
};

pub(crate) static CONNECT: Section = Section {
    name: "connect",
    fields: &[f(0, "timeout", Kind::Uint)],
};

pub(crate) static MQTT_SETTINGS: Section = Section {
    name: "mqtt_settings",
    fields: &[
        f(0, "ssl_mode", Kind::Byte),
        f(1, "host", Kind::Text),
        f(2, "port", Kind::Uint),
        f(3, "client_id", Kind::Text),
        f(4, "username", Kind::Text),
        f(5, "password", Kind::Text),
        f(6, "subscribe_topic", Kind::Text),
        f(7, "publish_topic", Kind::Text),
        f(8, "qos", Kind::Byte),
        f(9, "clean_session", Kind::Byte),
        f(10, "keep_alive", Kind::Byte),
    ],
};

pub(crate) static MQTT_CERT_RESULT: Section = Section {
    name: "mqtt_cert_result",
    fields: &[f(0, "result", Kind::Byte)],
};

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub(crate) static SCANNER_REPORT_MODE: Section = Section {
    name: "scanner_report_mode",
    fields: &[
        f(0, "mode", Kind::Choice(SCANNER_REPORT_MODES)),
        f(1, "auto_switch", Kind::Byte),
    ],
};

pub(crate) static ALWAYS_SCAN: Section = Section {
    name: "always_scan",
    fields: &[f(0, "interval", Kind::Uint)],
};

pub(crate) static PERIODIC_SCAN_IMMEDIATE_REPORT: Section = Section {
    name: "periodic_scan_immediate_report",
    fields: &[f(0, "duration", Kind::Uint), f(1, "interval", Kind::Uint)],
};

pub(crate) static PERIODIC_SCAN_PERIODIC_REPORT: Section = Section {
    name: "periodic_scan_periodic_report",
    fields: &[
        f(0, "duration", Kind::Uint),
        f(1, "interval", Kind::Uint),
        f(2, "report_interval", Kind::Uint),
        f(3, "data_retention_priority", Kind::Byte),
    ],
};

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

pub(crate) static FILTER_RELATIONSHIP: Section = Section {
    name: "filter_relationship",
    fields: &[f(0, "relation", Kind::Byte)],
};

pub(crate) static FILTER_RSSI: Section = Section {
    name: "filter_rssi",
    fields: &[f(0, "rssi", Kind::SignedByte)],
};

pub(crate) static FILTER_PHY: Section = Section {
    name: "filter_phy",
    fields: &[f(0, "phy", Kind::Byte)],
};

pub(crate) static FILTER_MAC: Section = Section {
    name: "filter_mac",
    fields: &[
        f(0, "precise", Kind::Byte),
        f(1, "reverse", Kind::Byte),
        f(2, "macs", Kind::HexList),
    ],
};

pub(crate) static FILTER_NAME: Section = Section {
    name: "filter_name",
    fields: &[
        f(0, "precise", Kind::Byte),
        f(1, "reverse", Kind::Byte),
        f(2, "names", Kind::TextList),
    ],
};

pub(crate) static FILTER_RAWDATA: Section = Section {
    name: "filter_rawdata",
    fields: &[f(0, "types", Kind::Mask(RAW_DATA_TYPES))],
};

pub(crate) static FILTER_IBEACON: Section = Section {
    name: "filter_ibeacon",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "min_major", Kind::Uint),
        f(2, "max_major", Kind::Uint),
        f(3, "min_minor", Kind::Uint),
        f(4, "max_minor", Kind::Uint),
        f(5, "uuid", Kind::Hex),
    ],
};

pub(crate) static FILTER_EDDYSTONE_UID: Section = Section {
    name: "filter_eddystone_uid",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "namespace", Kind::Hex),
        f(2, "instance", Kind::Hex),
    ],
};

pub(crate) static FILTER_EDDYSTONE_URL: Section = Section {
    name: "filter_eddystone_url",
    fields: &[f(0, "enable", Kind::Byte), f(1, "url", Kind::Text)],
};

pub(crate) static FILTER_EDDYSTONE_TLM: Section = Section {
    name: "filter_eddystone_tlm",
    fields: &[f(0, "enable", Kind::Byte), f(1, "tlm_version", Kind::Byte)],
};

pub(crate) static FILTER_BXP_DEVICE_INFO: Section = Section {
    name: "filter_bxp_device_info",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static FILTER_BXP_ACC: Section = Section {
    name: "filter_bxp_acc",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static FILTER_BXP_TH: Section = Section {
    name: "filter_bxp_th",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static FILTER_BXP_BUTTON: Section = Section {
    name: "filter_bxp_button",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(
            1,
            "alarm_types",
            Kind::Flags(&["single_press", "double_press", "long_press", "abnormal_inactivity"]),
        ),
    ],
};

pub(crate) static FILTER_BXP_TAG: Section = Section {
    name: "filter_bxp_tag",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "precise", Kind::Byte),
        f(2, "reverse", Kind::Byte),
        f(3, "tag_ids", Kind::HexList),
    ],
};

pub(crate) static FILTER_PIR: Section = Section {
    name: "filter_pir",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "delay_response_status", Kind::Choice(PIR_DELAY_FILTER)),
        f(2, "door_status", Kind::Choice(PIR_DOOR_FILTER)),
        f(3, "sensor_sensitivity", Kind::Choice(PIR_SENSITIVITY_FILTER)),
        f(4, "sensor_detection_status", Kind::Choice(PIR_DETECTION_FILTER)),
        f(5, "min_major", Kind::Uint),
        f(6, "max_major", Kind::Uint),
        f(7, "min_minor", Kind::Uint),
        f(8, "max_minor", Kind::Uint),
    ],
};

pub(crate) static FILTER_TOF: Section = Section {
    name: "filter_tof",
    fields: &[f(0, "enable", Kind::Byte), f(1, "codes", Kind::HexList)],
};

pub(crate) static FILTER_OTHER: Section = Section {
    name: "filter_other",
    fields: &[
        f(0, "enable", Kind::Byte),
        f(1, "relation", Kind::Choice(OTHER_RELATIONS)),
        f(2, "rules", Kind::Rules),
    ],
};

pub(crate) static FILTER_DUPLICATE: Section = Section {
    name: "filter_duplicate",
    fields: &[f(0, "rule", Kind::Choice(DUPLICATE_RULES))],
};

// ---------------------------------------------------------------------------
// Advertising
// ---------------------------------------------------------------------------

pub(crate) static ADV_SETTINGS: Section = Section {
    name: "adv_settings",
    fields: &[
        f(0, "resp_enable", Kind::Byte),
        f(1, "adv_name", Kind::Text),
        f(2, "adv_interval", Kind::Byte),
        f(3, "tx_power", Kind::SignedByte),
        f(4, "adv_timeout", Kind::Byte),
    ],
};

pub(crate) static IBEACON_SETTINGS: Section = Section {
    name: "ibeacon_settings",
    fields: &[
        f(0, "major", Kind::Uint),
        f(1, "minor", Kind::Uint),
        f(2, "uuid", Kind::Hex),
        f(3, "rssi_1m", Kind::SignedByte),
    ],
};

// ---------------------------------------------------------------------------
// Positioning / motion
// ---------------------------------------------------------------------------

pub(crate) static FIX_MODE: Section = Section {
    name: "fix_mode",
    fields: &[f(0, "mode", Kind::Choice(FIX_MODES))],
};

pub(crate) static PERIODIC_FIX: Section = Section {
    name: "periodic_fix",
    fields: &[f(0, "interval", Kind::Uint)],
};

pub(crate) static AXIS_PARAMS: Section = Section {
    name: "axis_params",
    fields: &[
        f(0, "wakeup_threshold", Kind::Uint),
        f(1, "wakeup_duration", Kind::Uint),
        f(2, "motion_threshold", Kind::Uint),
        f(3, "motion_duration", Kind::Uint),
    ],
};

pub(crate) static MOTION_START: Section = Section {
    name: "motion_start_params",
    fields: &[f(0, "enable", Kind::Byte)],
};

pub(crate) static MOTION_IN_TRIP: Section = Section {
    name: "motion_in_trip_params",
    fields: &[f(0, "enable", Kind::Byte), f(1, "interval", Kind::Uint)],
};

pub(crate) static MOTION_STOP: Section = Section {
    name: "motion_stop_params",
    fields: &[f(0, "enable", Kind::Byte), f(1, "timeout", Kind::Byte)],
};

pub(crate) static STATIONARY: Section = Section {
    name: "stationary_params",
    fields: &[f(0, "enable", Kind::Byte), f(1, "interval", Kind::Uint)],
};

pub(crate) static GPS_PARAMS: Section = Section {
    name: "gps_params",
    fields: &[f(0, "timeout", Kind::Uint), f(1, "pdop", Kind::Byte)],
};

// ---------------------------------------------------------------------------
// Report payload content masks
// ---------------------------------------------------------------------------

pub(crate) static IBEACON_PAYLOAD: Section = Section {
    name: "ibeacon_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&["rssi", "timestamp", "uuid", "major", "minor", "rssi_1m", "raw_adv", "raw_resp"]),
    )],
};

pub(crate) static EDDYSTONE_UID_PAYLOAD: Section = Section {
    name: "eddystone_uid_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&["rssi", "timestamp", "rssi_0m", "namespace", "instance", "raw_adv", "raw_resp"]),
    )],
};

pub(crate) static EDDYSTONE_URL_PAYLOAD: Section = Section {
    name: "eddystone_url_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&["rssi", "timestamp", "rssi_0m", "url", "raw_adv", "raw_resp"]),
    )],
};

pub(crate) static EDDYSTONE_TLM_PAYLOAD: Section = Section {
    name: "eddystone_tlm_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "tlm_version",
            "batt_voltage",
            "temperature",
            "adv_cnt",
            "sec_cnt",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static BXP_DEVICE_INFO_PAYLOAD: Section = Section {
    name: "bxp_device_info_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "tx_power",
            "ranging_data",
            "adv_interval",
            "batt_voltage",
            "device_property_indicator",
            "switch_status_indicator",
            "firmware_version",
            "device_name",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static BXP_ACC_PAYLOAD: Section = Section {
    name: "bxp_acc_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "tx_power",
            "ranging_data",
            "adv_interval",
            "sampling_rate",
            "full_scale",
            "motion_threshold",
            "axis_data",
            "batt_voltage",
            "raw_adv",
        ]),
    )],
};

pub(crate) static BXP_TH_PAYLOAD: Section = Section {
    name: "bxp_th_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "tx_power",
            "ranging_data",
            "adv_interval",
            "temperature",
            "humidity",
            "batt_voltage",
            "raw_adv",
        ]),
    )],
};

pub(crate) static BXP_BUTTON_PAYLOAD: Section = Section {
    name: "bxp_button_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "frame_type",
            "status_flag",
            "trigger_count",
            "device_id",
            "firmware_type",
            "device_name",
            "full_scale",
            "motion_threshold",
            "axis_data",
            "temperature",
            "ranging_data",
            "batt_voltage",
            "tx_power",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static BXP_TAG_PAYLOAD: Section = Section {
    name: "bxp_tag_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "sensor_data",
            "hall_trigger_event_count",
            "motion_trigger_event_count",
            "axis_data",
            "batt_voltage",
            "tag_id",
            "device_name",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static PIR_PAYLOAD: Section = Section {
    name: "pir_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "pir_delay_response_status",
            "door_status",
            "sensor_sensitivity",
            "sensor_detection_status",
            "batt_voltage",
            "major",
            "minor",
            "rssi_1m",
            "tx_power",
            "adv_name",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static TOF_PAYLOAD: Section = Section {
    name: "tof_payload",
    fields: &[f(
        0,
        "content",
        Kind::Mask(&[
            "rssi",
            "timestamp",
            "manufacturer_vendor_code",
            "batt_voltage",
            "user_data",
            "ranging_distance",
            "raw_adv",
            "raw_resp",
        ]),
    )],
};

pub(crate) static OTHER_PAYLOAD: Section = Section {
    name: "other_payload",
    fields: &[
        f(0, "content", Kind::Mask(&["rssi", "timestamp", "raw_adv", "raw_resp"])),
        f(1, "rules", Kind::Rules),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(section: &Section, data: &[u8]) -> Map<String, Value> {
        section.decode(&mut TlvCursor::new(data)).unwrap()
    }

    #[test]
    fn unknown_tags_are_skipped_by_length() {
        // tag 9 is not part of ntp; tag 1 after it must still decode
        let data = [0x09, 0x00, 0x02, 0xAA, 0xBB, 0x01, 0x00, 0x02, b'h', b'i'];
        let out = decode(&NTP, &data);
        assert_eq!(out.get("host"), Some(&json!("hi")));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn timezone_formats_section_timestamp() {
        let data = [
            0x00, 0x00, 0x04, 0x65, 0x53, 0xF1, 0x00, // 1_700_000_000
            0x01, 0x00, 0x01, 0x08,
        ];
        let out = decode(&CURRENT_TIME, &data);
        assert_eq!(out["timestamp"], json!(1_700_000_000u64));
        assert_eq!(out["timezone"], json!(8));
        assert_eq!(out["time_str"], json!("2023-11-15 06:13:20"));
    }

    #[test]
    fn choice_out_of_range_is_omitted() {
        let out = decode(&LOW_POWER, &[0x00, 0x00, 0x01, 0x01, 0x01, 0x00, 0x01, 0x09]);
        assert_eq!(out["enable"], json!(1));
        assert!(out.get("percentage").is_none());
    }

    #[test]
    fn choice_in_range_maps_label() {
        let out = decode(&SCANNER_REPORT_MODE, &[0x00, 0x00, 0x01, 0x03]);
        assert_eq!(out["mode"], json!("Periodic scan immediate report"));
    }

    #[test]
    fn lists_accumulate() {
        let data = [
            0x02, 0x00, 0x02, 0xAA, 0xBB, //
            0x02, 0x00, 0x01, 0xCC,
        ];
        let out = decode(&FILTER_MAC, &data);
        assert_eq!(out["macs"], json!(["AABB", "CC"]));
    }

    #[test]
    fn mask_spans_two_bytes() {
        // bit 0 (ibeacon) and bit 11 (other)
        let out = decode(&FILTER_RAWDATA, &[0x00, 0x00, 0x02, 0x08, 0x01]);
        let types = &out["types"];
        assert_eq!(types["ibeacon"], json!(true));
        assert_eq!(types["other"], json!(true));
        assert_eq!(types["tof"], json!(false));
    }

    #[test]
    fn rules_split_type_range_and_data() {
        let data = [0x02, 0x00, 0x05, 0xFF, 0x00, 0x02, 0x4C, 0x00];
        let out = decode(&FILTER_OTHER, &data);
        assert_eq!(
            out["rules"],
            json!([{"type": "FF", "start": 0, "end": 2, "data": "4C00"}])
        );
    }

    #[test]
    fn unix_time_adds_formatted_string() {
        let data = [0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x3C, 0x01, 0x00, 0x02, 0x0B, 0xB8];
        let out = decode(&POWER_OFF_ALARM, &data);
        assert_eq!(out["timestamp_str"], json!("1970-01-01 00:01:00"));
        assert_eq!(out["batt_voltage_mv"], json!(3000));
    }

    #[test]
    fn signed_byte_fields() {
        let out = decode(&FILTER_RSSI, &[0x00, 0x00, 0x01, 0xB0]);
        assert_eq!(out["rssi"], json!(-80));
    }
}

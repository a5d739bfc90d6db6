//! GPS/LBS fix reports (flags `3089`/`30b1`).

use serde_json::{Map, Value};

use crate::cursor::TlvCursor;
use crate::octets::{be_signed, be_uint, parse_time, round_to};
use crate::DecodeError;

use super::section::timestamp;

const FIX_MODES: &[&str] = &["Periodic", "Motion", "Downlink"];
const FIX_RESULTS: &[&str] = &[
    "GPS fix success",
    "LBS fix success",
    "Interrupted by Downlink",
    "GPS serial port is used",
    "GPS aiding timeout",
    "GPS timeout",
    "PDOP limit",
    "LBS failure",
];

/// Coordinates arrive as signed integers scaled by 1e7.
const COORD_SCALE: f64 = 1e-7;

pub(crate) fn decode(cursor: &mut TlvCursor<'_>) -> Result<Map<String, Value>, DecodeError> {
    let mut out = Map::new();
    while !cursor.is_exhausted() {
        let tag = cursor.read_tag()?;
        let v = cursor.read_length_prefixed_value()?;
        match tag {
            0 => {
                let ts = timestamp(be_uint(v)?)?;
                out.insert("timestamp".into(), ts.into());
                out.insert("current_time".into(), parse_time(ts, 0)?.into());
            }
            1 => {
                if let Some(mode) = v.first().and_then(|&b| FIX_MODES.get(usize::from(b))) {
                    out.insert("fix_mode".into(), (*mode).into());
                }
            }
            2 => {
                if let Some(result) = v.first().and_then(|&b| FIX_RESULTS.get(usize::from(b))) {
                    out.insert("fix_result".into(), (*result).into());
                }
            }
            3 if v.len() >= 4 => {
                // longitude is everything before the final four bytes
                let (lon, lat) = v.split_at(v.len() - 4);
                out.insert(
                    "longitude".into(),
                    round_to(be_signed(lon)? as f64 * COORD_SCALE, 7).into(),
                );
                out.insert(
                    "latitude".into(),
                    round_to(be_signed(lat)? as f64 * COORD_SCALE, 7).into(),
                );
            }
            4 => {
                let cell = be_uint(v)?;
                out.insert("tac_lac".into(), (cell & 0xFFFF).into());
                out.insert("ci".into(), ((cell >> 4) & 0xFFFF_FFFF).into());
            }
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_gps_fix() {
        let mut data = vec![0x00, 0x00, 0x04, 0x65, 0x53, 0xF1, 0x00];
        data.extend([0x01, 0x00, 0x01, 0x01]);
        data.extend([0x02, 0x00, 0x01, 0x00]);
        // lon 113.9421234, lat -22.5412345
        data.extend([0x03, 0x00, 0x08]);
        data.extend(1_139_421_234i32.to_be_bytes());
        data.extend((-225_412_345i32).to_be_bytes());

        let out = decode(&mut TlvCursor::new(&data)).unwrap();
        assert_eq!(out["current_time"], json!("2023-11-14 22:13:20"));
        assert_eq!(out["fix_mode"], json!("Motion"));
        assert_eq!(out["fix_result"], json!("GPS fix success"));
        assert_eq!(out["longitude"], json!(113.9421234));
        assert_eq!(out["latitude"], json!(-22.5412345));
    }

    #[test]
    fn decodes_cell_identity() {
        let data = [0x04, 0x00, 0x04, 0x00, 0x01, 0x23, 0x45];
        let out = decode(&mut TlvCursor::new(&data)).unwrap();
        assert_eq!(out["tac_lac"], json!(0x2345));
        assert_eq!(out["ci"], json!(0x1234));
    }
}

//! Byte-level primitives shared by the legacy handlers and the family
//! decoders: octet parsing, big-endian integers, two's complement of
//! arbitrary width, Latin-1 strings and the gateway timestamp format.

use time::OffsetDateTime;

use crate::DecodeError;

/// Longest prefix of offending input kept in an error message.
const ERR_SNIPPET: usize = 64;

/// Strip whitespace and parse the remaining text as hex octets.
pub fn parse_octets(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|_| DecodeError::InvalidHex(compact.chars().take(ERR_SNIPPET).collect()))
}

/// Uppercase hex rendering of a byte run.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Big-endian unsigned value of up to eight octets.
pub fn be_uint(bytes: &[u8]) -> Result<u64, DecodeError> {
    if bytes.len() > 8 {
        return Err(DecodeError::ValueTooWide(bytes.len()));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Big-endian two's-complement value whose width is the length of `bytes`.
pub fn be_signed(bytes: &[u8]) -> Result<i64, DecodeError> {
    let raw = be_uint(bytes)?;
    Ok(sign_extend(raw, bytes.len() as u32 * 8))
}

/// Interpret `hex` as a two's-complement integer `4 * hex.len()` bits wide.
///
/// `"7F"` is 127, `"80"` is -128, `"FFFF"` is -1. Up to 16 hex digits.
pub fn signed_hex_to_int(hex: &str) -> Result<i64, DecodeError> {
    if hex.is_empty() || hex.len() > 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(hex.chars().take(ERR_SNIPPET).collect()));
    }
    let raw = u64::from_str_radix(hex, 16)
        .map_err(|_| DecodeError::InvalidHex(hex.to_string()))?;
    Ok(sign_extend(raw, hex.len() as u32 * 4))
}

/// Inverse of [`signed_hex_to_int`]: render `value` as `width` uppercase hex
/// digits of two's complement.
pub fn to_signed_hex(value: i64, width: usize) -> String {
    let bits = (width * 4).min(64) as u32;
    let masked = if bits == 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << bits) - 1)
    };
    format!("{masked:0width$X}")
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return raw as i64;
    }
    if (raw >> (bits - 1)) & 1 == 0 {
        raw as i64
    } else {
        raw as i64 - (1i64 << bits)
    }
}

/// One octet per character, Latin-1. Not UTF-8 aware.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Format a gateway timestamp as `YYYY-MM-DD HH:MM:SS` (UTC after offset).
///
/// The timezone octet is biased: values above 64 mean `tz - 128` hours.
/// Negative results clamp to the epoch.
pub fn parse_time(timestamp: i64, timezone: i64) -> Result<String, DecodeError> {
    let hours = if timezone > 64 { timezone - 128 } else { timezone };
    let adjusted = timestamp.saturating_add(hours * 3600).max(0);
    let t = OffsetDateTime::from_unix_timestamp(adjusted)
        .map_err(|_| DecodeError::TimestampOutOfRange(adjusted))?;

    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    ))
}

/// Round to a fixed number of decimals, the way gateway values are reported.
pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // -- signed_hex_to_int --------------------------------------------------

    #[test]
    fn signed_known_values() {
        assert_eq!(signed_hex_to_int("7F").unwrap(), 127);
        assert_eq!(signed_hex_to_int("80").unwrap(), -128);
        assert_eq!(signed_hex_to_int("FF").unwrap(), -1);
        assert_eq!(signed_hex_to_int("FFFF").unwrap(), -1);
        assert_eq!(signed_hex_to_int("8000").unwrap(), -32768);
        assert_eq!(signed_hex_to_int("00").unwrap(), 0);
    }

    #[test]
    fn signed_odd_widths() {
        // 12-bit and 24-bit values, both sides of the sign bit
        assert_eq!(signed_hex_to_int("7FF").unwrap(), 2047);
        assert_eq!(signed_hex_to_int("800").unwrap(), -2048);
        assert_eq!(signed_hex_to_int("FFFF38").unwrap(), -200);
        assert_eq!(signed_hex_to_int("F").unwrap(), -1);
    }

    #[test]
    fn signed_full_width() {
        assert_eq!(signed_hex_to_int("FFFFFFFFFFFFFFFF").unwrap(), -1);
        assert_eq!(signed_hex_to_int("8000000000000000").unwrap(), i64::MIN);
    }

    #[test]
    fn signed_rejects_garbage() {
        assert!(signed_hex_to_int("").is_err());
        assert!(signed_hex_to_int("+1").is_err());
        assert!(signed_hex_to_int("GG").is_err());
        assert!(signed_hex_to_int("00000000000000000").is_err());
    }

    proptest! {
        #[test]
        fn signed_hex_round_trips(hex in "[0-9A-F]{1,16}") {
            let value = signed_hex_to_int(&hex).unwrap();
            prop_assert_eq!(to_signed_hex(value, hex.len()), hex);
        }

        #[test]
        fn signed_bytes_agree_with_hex(bytes in proptest::collection::vec(any::<u8>(), 1..=8)) {
            let via_hex = signed_hex_to_int(&to_hex(&bytes)).unwrap();
            prop_assert_eq!(be_signed(&bytes).unwrap(), via_hex);
        }
    }

    // -- octets / unsigned --------------------------------------------------

    #[test]
    fn octets_ignore_whitespace() {
        assert_eq!(parse_octets("0a 0B\n ff").unwrap(), vec![0x0a, 0x0b, 0xff]);
    }

    #[test]
    fn octets_reject_odd_length() {
        assert!(matches!(parse_octets("abc"), Err(DecodeError::InvalidHex(_))));
    }

    #[test]
    fn be_uint_concatenates() {
        assert_eq!(be_uint(&[0x01, 0x02]).unwrap(), 0x0102);
        assert_eq!(be_uint(&[]).unwrap(), 0);
        assert_eq!(be_uint(&[0; 9]), Err(DecodeError::ValueTooWide(9)));
    }

    #[test]
    fn latin1_maps_each_octet() {
        assert_eq!(latin1(b"MKGW"), "MKGW");
        assert_eq!(latin1(&[0xE9]), "\u{e9}");
    }

    // -- parse_time ---------------------------------------------------------

    #[test]
    fn parse_time_utc() {
        assert_eq!(parse_time(0, 0).unwrap(), "1970-01-01 00:00:00");
        assert_eq!(parse_time(1_700_000_000, 0).unwrap(), "2023-11-14 22:13:20");
    }

    #[test]
    fn parse_time_positive_offset() {
        assert_eq!(parse_time(1_700_000_000, 8).unwrap(), "2023-11-15 06:13:20");
    }

    #[test]
    fn parse_time_biased_negative_offset() {
        // 0x7B = 123 > 64, so the offset is 123 - 128 = -5 hours
        assert_eq!(parse_time(1_700_000_000, 0x7B).unwrap(), "2023-11-14 17:13:20");
    }

    #[test]
    fn parse_time_keeps_bias_threshold_at_64() {
        // 64 itself is not biased
        assert_eq!(parse_time(0, 64).unwrap(), "1970-01-03 16:00:00");
    }

    #[test]
    fn parse_time_clamps_before_epoch() {
        assert_eq!(parse_time(100, 0x7F).unwrap(), "1970-01-01 00:00:00");
    }
}

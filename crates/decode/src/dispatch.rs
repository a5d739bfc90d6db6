use std::fmt;

use crate::family::{a, b, c};
use crate::octets::to_hex;
use crate::reading::NormalizedReading;

/// Gateway generation, taken from the last segment of the MQTT topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Mk1,
    Mk2,
    Mk3,
    Mk4,
    /// Access-control readers. Shares the broker; never decoded here.
    Rf1,
}

impl Topic {
    pub const ALL: [Topic; 5] = [Topic::Mk1, Topic::Mk2, Topic::Mk3, Topic::Mk4, Topic::Rf1];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Mk1 => "MK1",
            Topic::Mk2 => "MK2",
            Topic::Mk3 => "MK3",
            Topic::Mk4 => "MK4",
            Topic::Rf1 => "RF1",
        }
    }

    /// Accepts `"devices/MK2"` or just `"MK2"`, whatever the prefix.
    pub fn parse(topic: &str) -> Option<Self> {
        let name = topic.rsplit('/').next()?;
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Payload as written to the raw message log: hex for MK2, text
    /// otherwise.
    pub fn stored_payload(self, payload: &[u8]) -> String {
        match self {
            Topic::Mk2 => to_hex(payload),
            _ => String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route a payload to its decoder family. Unknown and RF1 topics yield
/// nothing.
pub fn dispatch(topic: &str, payload: &[u8]) -> Vec<NormalizedReading> {
    match Topic::parse(topic) {
        Some(Topic::Mk1) => a::decode(topic, payload),
        Some(Topic::Mk2 | Topic::Mk4) => b::decode(topic, payload),
        Some(Topic::Mk3) => c::decode(topic, payload),
        Some(Topic::Rf1) | None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_topic_names() {
        assert_eq!(Topic::parse("devices/MK1"), Some(Topic::Mk1));
        assert_eq!(Topic::parse("site-a/devices/MK4"), Some(Topic::Mk4));
        assert_eq!(Topic::parse("RF1"), Some(Topic::Rf1));
        assert_eq!(Topic::parse("devices/mk1"), None);
        assert_eq!(Topic::parse("devices/MK9"), None);
    }

    #[test]
    fn routes_by_topic() {
        let family_c = json!({
            "gateway": "AC233F000003",
            "devices": [{"mac": "C3000000000F", "rssi": -49}]
        })
        .to_string();

        let readings = dispatch("devices/MK3", family_c.as_bytes());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].topic, "devices/MK3");

        // same payload means nothing to Family A
        assert!(dispatch("devices/MK1", family_c.as_bytes()).is_empty());
    }

    #[test]
    fn mk4_uses_family_b() {
        let body = json!({
            "gatewayMac": "AC233F000002",
            "records": [{"mac": "C3000000000C", "rssi": -70}]
        })
        .to_string();
        let readings = dispatch("devices/MK4", body.as_bytes());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].topic, "devices/MK4");
    }

    #[test]
    fn rf1_and_unknown_are_ignored() {
        assert!(dispatch("devices/RF1", b"card=1234").is_empty());
        assert!(dispatch("devices/OTHER", b"[]").is_empty());
    }

    #[test]
    fn stored_payload_is_hex_only_for_mk2() {
        assert_eq!(Topic::Mk2.stored_payload(b"{}"), "7B7D");
        assert_eq!(Topic::Mk3.stored_payload(b"{}"), "{}");
    }
}

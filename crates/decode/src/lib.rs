//! Decoding of BLE gateway telemetry frames into normalized device readings.
//!
//! Everything in this crate is pure computation: no I/O and no clocks. The
//! hub crate owns persistence and the MQTT connection.

pub mod cursor;
pub mod dispatch;
mod error;
pub mod family;
pub mod legacy;
pub mod mac;
pub mod octets;
pub mod reading;

pub use dispatch::{dispatch, Topic};
pub use error::DecodeError;
pub use mac::normalize_mac;
pub use reading::NormalizedReading;

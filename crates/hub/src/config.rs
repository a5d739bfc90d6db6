//! Environment settings, the TOML config file, validation, and database
//! seeding for places, categories, gateways, devices and alarm rules.

use anyhow::{bail, Context, Result};
use beacon_decode::normalize_mac;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::db::{AlarmRule, AlarmScope, Db, DeviceConfig, GatewayConfig};
use crate::reconcile::Windows;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Env {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub db_url: String,
    pub config_path: String,
    pub web_port: u16,
}

impl Env {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let port = |key: &str, default: u16| get(key).and_then(|s| s.parse().ok()).unwrap_or(default);
        Self {
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: port("MQTT_PORT", 1883),
            mqtt_username: get("MQTT_USERNAME").filter(|s| !s.is_empty()),
            mqtt_password: get("MQTT_PASSWORD"),
            db_url: get("DB_URL").unwrap_or_else(|| "sqlite:beacon.db?mode=rwc".to_string()),
            config_path: get("CONFIG_PATH").unwrap_or_else(|| "config.toml".to_string()),
            web_port: port("WEB_PORT", 8080),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub ingest: IngestConfig,
    pub alarms: AlarmsConfig,
    pub places: Vec<PlaceEntry>,
    pub categories: Vec<CategoryEntry>,
    pub gateways: Vec<GatewayEntry>,
    pub devices: Vec<DeviceEntry>,
    pub alarm_configs: Vec<AlarmConfigEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_sec: u64,
    /// Capacity of the rumqttc request channel.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: "beacon-hub".to_string(),
            topic_prefix: "devices".to_string(),
            keep_alive_sec: 30,
            channel_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Concurrent reconcile tasks.
    pub workers: usize,
    /// Decoded messages buffered between the MQTT loop and the workers.
    pub queue_depth: usize,
    pub skip_window_sec: i64,
    pub merge_window_sec: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let w = Windows::default();
        Self {
            workers: 4,
            queue_depth: 256,
            skip_window_sec: w.skip_sec,
            merge_window_sec: w.merge_sec,
        }
    }
}

impl IngestConfig {
    pub fn windows(&self) -> Windows {
        Windows {
            skip_sec: self.skip_window_sec,
            merge_sec: self.merge_window_sec,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlarmsConfig {
    pub interval_sec: u64,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self { interval_sec: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceEntry {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryEntry {
    pub name: String,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEntry {
    pub mac: String,
    pub name: Option<String>,
    /// Place name; becomes the gateway's active assignment.
    pub place: Option<String>,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub mac: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub owner_id: Option<i64>,
    #[serde(default = "yes")]
    pub active: bool,
}

/// At most one of `device` (a MAC), `category` or `place` may be set.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfigEntry {
    pub name: String,
    pub threshold_seconds: i64,
    pub device: Option<String>,
    pub category: Option<String>,
    pub place: Option<String>,
    pub handler_group: Option<String>,
    pub owner_id: Option<i64>,
    #[serde(default = "yes")]
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Push an error for an empty or duplicate key.
fn check_key<'a>(errors: &mut Vec<String>, seen: &mut HashSet<&'a str>, ctx: &str, field: &str, key: &'a str) {
    if key.trim().is_empty() {
        errors.push(format!("{ctx}: {field} is empty"));
    } else if !seen.insert(key) {
        errors.push(format!("{ctx}: duplicate {field} '{key}'"));
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_seeds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        if m.topic_prefix.trim().is_empty() || m.topic_prefix.contains(['+', '#']) {
            errors.push(format!("mqtt: topic_prefix '{}' is not a plain topic", m.topic_prefix));
        }
        if m.keep_alive_sec < 5 {
            errors.push(format!("mqtt: keep_alive_sec must be at least 5, got {}", m.keep_alive_sec));
        }
        if m.channel_capacity == 0 {
            errors.push("mqtt: channel_capacity must be positive".to_string());
        }

        let i = &self.ingest;
        if i.workers == 0 {
            errors.push("ingest: workers must be positive".to_string());
        }
        if i.queue_depth == 0 {
            errors.push("ingest: queue_depth must be positive".to_string());
        }
        if i.skip_window_sec <= 0 {
            errors.push(format!("ingest: skip_window_sec must be positive, got {}", i.skip_window_sec));
        }
        if i.merge_window_sec <= 0 {
            errors.push(format!("ingest: merge_window_sec must be positive, got {}", i.merge_window_sec));
        }
        if i.merge_window_sec < i.skip_window_sec {
            errors.push(format!(
                "ingest: merge_window_sec ({}) is less than skip_window_sec ({})",
                i.merge_window_sec, i.skip_window_sec
            ));
        }

        if self.alarms.interval_sec == 0 {
            errors.push("alarms: interval_sec must be positive".to_string());
        }
    }

    fn validate_seeds(&self, errors: &mut Vec<String>) {
        let mut places = HashSet::new();
        for (i, p) in self.places.iter().enumerate() {
            check_key(errors, &mut places, &format!("places[{i}]"), "name", &p.name);
        }
        let mut categories = HashSet::new();
        for (i, c) in self.categories.iter().enumerate() {
            check_key(errors, &mut categories, &format!("categories[{i}]"), "name", &c.name);
        }

        let mut gateway_macs = HashSet::new();
        for (i, g) in self.gateways.iter().enumerate() {
            let ctx = format!("gateways[{i}]");
            match normalize_mac(&g.mac) {
                None => errors.push(format!("{ctx}: mac '{}' is not a MAC address", g.mac)),
                Some(mac) if !gateway_macs.insert(mac.clone()) => {
                    errors.push(format!("{ctx}: duplicate mac '{mac}'"));
                }
                Some(_) => {}
            }
            if let Some(place) = &g.place {
                if !places.contains(place.as_str()) {
                    errors.push(format!("{ctx}: place '{place}' does not match any defined place"));
                }
            }
        }

        let mut device_macs = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            let ctx = format!("devices[{i}]");
            match normalize_mac(&d.mac) {
                None => errors.push(format!("{ctx}: mac '{}' is not a MAC address", d.mac)),
                Some(mac) if !device_macs.insert(mac.clone()) => {
                    errors.push(format!("{ctx}: duplicate mac '{mac}'"));
                }
                Some(_) => {}
            }
            if let Some(category) = &d.category {
                if !categories.contains(category.as_str()) {
                    errors.push(format!("{ctx}: category '{category}' does not match any defined category"));
                }
            }
        }

        let mut alarm_names = HashSet::new();
        for (i, a) in self.alarm_configs.iter().enumerate() {
            let ctx = if a.name.trim().is_empty() {
                format!("alarm_configs[{i}]")
            } else {
                format!("alarm config '{}'", a.name)
            };
            check_key(errors, &mut alarm_names, &ctx, "name", &a.name);

            if a.threshold_seconds <= 0 {
                errors.push(format!(
                    "{ctx}: threshold_seconds must be positive, got {}",
                    a.threshold_seconds
                ));
            }

            let scopes = [a.device.is_some(), a.category.is_some(), a.place.is_some()];
            if scopes.iter().filter(|s| **s).count() > 1 {
                errors.push(format!("{ctx}: set at most one of device, category, place"));
            }
            if let Some(device) = &a.device {
                if !normalize_mac(device).is_some_and(|m| device_macs.contains(&m)) {
                    errors.push(format!("{ctx}: device '{device}' does not match any defined device"));
                }
            }
            if let Some(category) = &a.category {
                if !categories.contains(category.as_str()) {
                    errors.push(format!("{ctx}: category '{category}' does not match any defined category"));
                }
            }
            if let Some(place) = &a.place {
                if !places.contains(place.as_str()) {
                    errors.push(format!("{ctx}: place '{place}' does not match any defined place"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means all
/// defaults and no seed data.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

fn lookup(ids: &HashMap<String, i64>, kind: &str, key: &str) -> Result<i64> {
    ids.get(key)
        .copied()
        .with_context(|| format!("{kind} '{key}' was not seeded"))
}

/// Upsert every seed entry into the database. `now` stamps new gateway
/// place assignments.
pub async fn apply(config: &Config, db: &Db, now: i64) -> Result<()> {
    let mut places = HashMap::new();
    for p in &config.places {
        places.insert(p.name.clone(), db.upsert_place(&p.name).await?);
    }

    let mut categories = HashMap::new();
    for c in &config.categories {
        categories.insert(c.name.clone(), db.upsert_category(&c.name).await?);
    }

    for g in &config.gateways {
        let mac = normalize_mac(&g.mac).with_context(|| format!("bad gateway mac '{}'", g.mac))?;
        let id = db
            .upsert_gateway(&GatewayConfig {
                mac_address: mac.clone(),
                name: g.name.clone(),
                active: g.active,
            })
            .await?;
        if let Some(place) = &g.place {
            let place_id = lookup(&places, "place", place)?;
            if db.assign_gateway_place(id, place_id, now).await? {
                tracing::info!(gateway = %mac, place = %place, "gateway assigned to place");
            }
        }
    }

    let mut devices = HashMap::new();
    for d in &config.devices {
        let mac = normalize_mac(&d.mac).with_context(|| format!("bad device mac '{}'", d.mac))?;
        let category_id = d
            .category
            .as_deref()
            .map(|c| lookup(&categories, "category", c))
            .transpose()?;
        let id = db
            .upsert_device(&DeviceConfig {
                ble_mac: mac.clone(),
                name: d.name.clone(),
                active: d.active,
                owner_id: d.owner_id,
                category_id,
            })
            .await?;
        devices.insert(mac, id);
    }

    for a in &config.alarm_configs {
        let scope = if let Some(device) = &a.device {
            let mac = normalize_mac(device).with_context(|| format!("bad device mac '{device}'"))?;
            AlarmScope::Device(lookup(&devices, "device", &mac)?)
        } else if let Some(category) = &a.category {
            AlarmScope::Category(lookup(&categories, "category", category)?)
        } else if let Some(place) = &a.place {
            AlarmScope::Place(lookup(&places, "place", place)?)
        } else {
            AlarmScope::Global
        };
        db.upsert_alarm_config(&AlarmRule {
            name: a.name.clone(),
            owner_id: a.owner_id,
            threshold_seconds: a.threshold_seconds,
            scope,
            handler_group: a.handler_group.clone(),
            active: a.active,
        })
        .await
        .with_context(|| format!("failed to upsert alarm config '{}'", a.name))?;
    }

    tracing::info!(
        places = config.places.len(),
        categories = config.categories.len(),
        gateways = config.gateways.len(),
        devices = config.devices.len(),
        alarm_configs = config.alarm_configs.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[mqtt]
client_id = "hub-1"
topic_prefix = "site-a/devices"

[ingest]
workers = 2
skip_window_sec = 20

[alarms]
interval_sec = 60

[[places]]
name = "Dock"

[[places]]
name = "Yard"

[[categories]]
name = "forklifts"

[[gateways]]
mac = "ac:23:3f:00:00:01"
name = "dock gw"
place = "Dock"

[[gateways]]
mac = "AC233F000002"

[[devices]]
mac = "c3:00:00:00:00:0a"
name = "forklift 1"
category = "forklifts"
owner_id = 3

[[devices]]
mac = "C3000000000B"
active = false

[[alarm_configs]]
name = "forklift silence"
threshold_seconds = 300
category = "forklifts"
handler_group = "ops"

[[alarm_configs]]
name = "tag b"
threshold_seconds = 600
device = "C3-00-00-00-00-0B"

[[alarm_configs]]
name = "catch-all"
threshold_seconds = 900
"#;

    fn full() -> Config {
        toml::from_str(FULL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_defaults() {
        let env = Env::from_lookup(|_| None);
        assert_eq!(env.mqtt_host, "127.0.0.1");
        assert_eq!(env.mqtt_port, 1883);
        assert_eq!(env.db_url, "sqlite:beacon.db?mode=rwc");
        assert_eq!(env.config_path, "config.toml");
        assert_eq!(env.web_port, 8080);
        assert_eq!(env.mqtt_username, None);
    }

    #[test]
    fn env_overrides_and_bad_ports() {
        let vars: HashMap<&str, &str> = [
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USERNAME", "hub"),
            ("MQTT_PASSWORD", "secret"),
            ("WEB_PORT", "9000"),
        ]
        .into_iter()
        .collect();
        let env = Env::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(env.mqtt_host, "broker.local");
        assert_eq!(env.mqtt_port, 1883);
        assert_eq!(env.mqtt_username.as_deref(), Some("hub"));
        assert_eq!(env.mqtt_password.as_deref(), Some("secret"));
        assert_eq!(env.web_port, 9000);
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let cfg = parse(FULL).unwrap();
        assert_eq!(cfg.mqtt.client_id, "hub-1");
        assert_eq!(cfg.mqtt.keep_alive_sec, 30);
        assert_eq!(cfg.ingest.workers, 2);
        assert_eq!(cfg.ingest.windows(), Windows { skip_sec: 20, merge_sec: 300 });
        assert_eq!(cfg.alarms.interval_sec, 60);
        assert_eq!(cfg.gateways.len(), 2);
        assert!(cfg.gateways[1].active);
        assert!(!cfg.devices[1].active);
        assert_eq!(cfg.alarm_configs.len(), 3);
    }

    #[test]
    fn parse_empty_config() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.mqtt.topic_prefix, "devices");
        assert_eq!(cfg.ingest.windows(), Windows::default());
        assert_eq!(cfg.alarms.interval_sec, 30);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn missing_file_means_defaults() {
        let cfg = load("/nonexistent/beacon/config.toml").unwrap();
        assert!(cfg.gateways.is_empty());
    }

    // -- Validation: settings ---------------------------------------------

    #[test]
    fn zero_windows_rejected() {
        let mut cfg = full();
        cfg.ingest.skip_window_sec = 0;
        cfg.ingest.merge_window_sec = -1;
        assert_validation_err(&cfg, "skip_window_sec must be positive");
        assert_validation_err(&cfg, "merge_window_sec must be positive");
    }

    #[test]
    fn merge_window_below_skip_rejected() {
        let mut cfg = full();
        cfg.ingest.skip_window_sec = 60;
        cfg.ingest.merge_window_sec = 30;
        assert_validation_err(&cfg, "merge_window_sec (30) is less than skip_window_sec (60)");
    }

    #[test]
    fn wildcard_prefix_rejected() {
        let mut cfg = full();
        cfg.mqtt.topic_prefix = "devices/+".into();
        assert_validation_err(&cfg, "is not a plain topic");
    }

    #[test]
    fn zero_workers_and_interval_rejected() {
        let mut cfg = full();
        cfg.ingest.workers = 0;
        cfg.alarms.interval_sec = 0;
        assert_validation_err(&cfg, "workers must be positive");
        assert_validation_err(&cfg, "interval_sec must be positive");
    }

    // -- Validation: seeds ------------------------------------------------

    #[test]
    fn full_config_passes() {
        full().validate().unwrap();
    }

    #[test]
    fn bad_gateway_mac_rejected() {
        let mut cfg = full();
        cfg.gateways[0].mac = "ac:23:3f".into();
        assert_validation_err(&cfg, "mac 'ac:23:3f' is not a MAC address");
    }

    #[test]
    fn duplicate_macs_compare_normalized() {
        let mut cfg = full();
        cfg.devices[1].mac = "C3-00-00-00-00-0A".into();
        assert_validation_err(&cfg, "duplicate mac 'C3000000000A'");
    }

    #[test]
    fn duplicate_place_rejected() {
        let mut cfg = full();
        cfg.places.push(PlaceEntry { name: "Dock".into() });
        assert_validation_err(&cfg, "duplicate name 'Dock'");
    }

    #[test]
    fn unknown_references_rejected() {
        let mut cfg = full();
        cfg.gateways[0].place = Some("Roof".into());
        cfg.devices[0].category = Some("drones".into());
        assert_validation_err(&cfg, "place 'Roof' does not match any defined place");
        assert_validation_err(&cfg, "category 'drones' does not match any defined category");
    }

    #[test]
    fn alarm_with_two_scopes_rejected() {
        let mut cfg = full();
        cfg.alarm_configs[0].place = Some("Dock".into());
        assert_validation_err(&cfg, "set at most one of device, category, place");
    }

    #[test]
    fn alarm_threshold_must_be_positive() {
        let mut cfg = full();
        cfg.alarm_configs[1].threshold_seconds = 0;
        assert_validation_err(&cfg, "threshold_seconds must be positive, got 0");
    }

    #[test]
    fn alarm_unknown_device_rejected() {
        let mut cfg = full();
        cfg.alarm_configs[1].device = Some("C30000000099".into());
        assert_validation_err(&cfg, "device 'C30000000099' does not match any defined device");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = full();
        cfg.places[0].name = " ".into();
        cfg.devices[0].mac = "nope".into();
        cfg.alarm_configs[2].threshold_seconds = -5;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("name is empty"), "{msg}");
        assert!(msg.contains("mac 'nope'"), "{msg}");
        assert!(msg.contains("threshold_seconds must be positive"), "{msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let cfg = full();
        apply(&cfg, &db, 1_000).await.unwrap();
        // applying twice is a no-op
        apply(&cfg, &db, 2_000).await.unwrap();

        let dev = db.device_by_mac("C3000000000A").await.unwrap().unwrap();
        assert_eq!(dev.name.as_deref(), Some("forklift 1"));
        assert_eq!(dev.owner_id, Some(3));
        assert!(dev.category_id.is_some());
        assert!(!db.device_by_mac("C3000000000B").await.unwrap().unwrap().active);

        let configs = db.active_alarm_configs().await.unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].rule.scope, AlarmScope::Category(dev.category_id.unwrap()));
        assert!(matches!(configs[1].rule.scope, AlarmScope::Device(_)));
        assert_eq!(configs[2].rule.scope, AlarmScope::Global);

        let assignments: Vec<(i64, i64)> =
            sqlx::query_as("SELECT place_id, assigned_at FROM gateway_places WHERE active = 1")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].1, 1_000);
    }
}

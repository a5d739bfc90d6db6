use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::alarms::SweepSummary;
use crate::reconcile::Outcome;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Messages received per topic.
    pub messages: BTreeMap<String, u64>,
    pub readings: ReadingCounters,
    pub last_sweep: Option<SweepSummary>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadingCounters {
    pub decoded: u64,
    /// Messages on a decoded topic that yielded no readings.
    pub empty_messages: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub unknown_gateway: u64,
    pub unknown_device: u64,
    pub store_errors: u64,
    /// Messages lost because the ingest queue was full.
    pub dropped_messages: u64,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Alarm,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub messages: BTreeMap<String, u64>,
    pub readings: ReadingCounters,
    pub last_sweep: Option<SweepSummary>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            messages: BTreeMap::new(),
            readings: ReadingCounters::default(),
            last_sweep: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Count an inbound message and how many readings it decoded to.
    pub fn record_message(&mut self, topic: &str, readings: usize) {
        *self.messages.entry(topic.to_string()).or_default() += 1;
        self.readings.decoded += readings as u64;
        if readings == 0 {
            self.readings.empty_messages += 1;
        }
        self.push_event(EventKind::Message, format!("{topic}: {readings} reading(s)"));
    }

    pub fn record_outcome(&mut self, outcome: Outcome) {
        let c = &mut self.readings;
        match outcome {
            Outcome::Inserted => c.inserted += 1,
            Outcome::Updated => c.updated += 1,
            Outcome::Skipped => c.skipped += 1,
            Outcome::UnknownGateway => c.unknown_gateway += 1,
            Outcome::UnknownDevice => c.unknown_device += 1,
        }
    }

    pub fn record_dropped(&mut self, topic: &str) {
        self.readings.dropped_messages += 1;
        self.push_event(EventKind::Error, format!("{topic}: ingest queue full, message dropped"));
    }

    pub fn record_store_error(&mut self, detail: String) {
        self.readings.store_errors += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Keep the latest sweep; log an event only when it changed something.
    pub fn record_sweep(&mut self, summary: SweepSummary) {
        if summary.opened + summary.resolved + summary.failed_configs > 0 {
            self.push_event(
                EventKind::Alarm,
                format!(
                    "sweep: {} opened, {} resolved, {} rule(s) failed",
                    summary.opened, summary.resolved, summary.failed_configs
                ),
            );
        }
        self.last_sweep = Some(summary);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            messages: self.messages.clone(),
            readings: self.readings.clone(),
            last_sweep: self.last_sweep.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");

        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 24));
    }

    #[test]
    fn counters_accumulate() {
        let mut st = SystemState::new();
        st.record_message("devices/MK1", 3);
        st.record_message("devices/MK1", 0);
        st.record_message("devices/MK3", 1);
        st.record_outcome(Outcome::Inserted);
        st.record_outcome(Outcome::Skipped);
        st.record_outcome(Outcome::Skipped);

        assert_eq!(st.messages["devices/MK1"], 2);
        assert_eq!(st.messages["devices/MK3"], 1);
        assert_eq!(st.readings.decoded, 4);
        assert_eq!(st.readings.inserted, 1);
        assert_eq!(st.readings.skipped, 2);
        assert_eq!(st.readings.empty_messages, 1);
    }

    #[test]
    fn quiet_sweep_adds_no_event() {
        let mut st = SystemState::new();
        st.record_sweep(SweepSummary {
            configs: 2,
            targets: 4,
            ..SweepSummary::default()
        });
        assert!(st.events.is_empty());
        assert_eq!(st.last_sweep.as_ref().unwrap().targets, 4);

        st.record_sweep(SweepSummary {
            opened: 1,
            ..SweepSummary::default()
        });
        assert_eq!(st.events.back().unwrap().kind, EventKind::Alarm);
    }

    #[test]
    fn dropped_messages_counted() {
        let mut st = SystemState::new();
        st.record_dropped("devices/MK1");
        st.record_dropped("devices/MK1");
        assert_eq!(st.readings.dropped_messages, 2);
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }
}

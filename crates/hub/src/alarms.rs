//! Staleness alarms: a fixed-interval sweep over every active alarm rule.
//!
//! ## Per-(device, rule) lifecycle
//!
//! ```text
//!           stale > threshold                fresh again
//! (none) ──────────────────────▶ OPEN ───────────────────────▶ RESOLVED
//!                                  │                               ▲
//!                        operator  ▼             fresh again       │
//!                             ACKNOWLEDGED ────────────────────────┘
//! ```
//!
//! A sweep only ever opens, refreshes `breach_seconds`, or resolves. It
//! never reopens or edits a RESOLVED row; a later breach opens a new one.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::{now_unix, AlarmConfig, Db, DeviceSeen};
use crate::state::SharedState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub at: i64,
    pub configs: usize,
    pub targets: usize,
    pub opened: usize,
    pub refreshed: usize,
    pub resolved: usize,
    pub failed_configs: usize,
}

/// `breach_seconds` recorded for a device that has never reported: the
/// largest integer a JSON reader holds exactly.
pub const NEVER_SEEN_BREACH: i64 = 9_007_199_254_740_991;

/// Seconds since the device last reported. A device never seen is
/// maximally stale.
fn staleness(device: &DeviceSeen, now: i64) -> i64 {
    match device.last_seen_at {
        Some(seen) => now - seen,
        None => NEVER_SEEN_BREACH,
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the monitor until `shutdown` flips to true. The first sweep runs
/// immediately; a sweep always finishes before the next tick is taken.
pub async fn run(db: Db, interval_sec: u64, shared: SharedState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_sec, "alarm monitor started");
    {
        let mut st = shared.write().await;
        st.record_system(format!("alarm monitor started (every {interval_sec}s)"));
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match sweep(&db, now_unix()).await {
            Ok(summary) => {
                if summary.opened + summary.resolved > 0 {
                    info!(
                        opened = summary.opened,
                        resolved = summary.resolved,
                        targets = summary.targets,
                        "alarm sweep changed state"
                    );
                }
                let mut st = shared.write().await;
                st.record_sweep(summary);
            }
            Err(e) => {
                error!("alarm sweep failed: {e:#}");
                let mut st = shared.write().await;
                st.record_error(format!("alarm sweep failed: {e:#}"));
            }
        }
    }

    info!("alarm monitor stopped");
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Evaluate every active rule once at time `now`. A rule whose evaluation
/// fails is logged and counted; the others still run.
pub async fn sweep(db: &Db, now: i64) -> Result<SweepSummary> {
    let configs = db.active_alarm_configs().await?;
    let mut summary = SweepSummary {
        at: now,
        configs: configs.len(),
        ..SweepSummary::default()
    };

    for config in &configs {
        if let Err(e) = evaluate_config(db, config, now, &mut summary).await {
            warn!(config = %config.rule.name, "alarm rule evaluation failed: {e:#}");
            summary.failed_configs += 1;
        }
    }

    Ok(summary)
}

async fn evaluate_config(db: &Db, config: &AlarmConfig, now: i64, summary: &mut SweepSummary) -> Result<()> {
    let targets = db.alarm_targets(config.rule.scope).await?;
    summary.targets += targets.len();

    for device in &targets {
        let stale_for = staleness(device, now);
        let breach = Some(stale_for);
        let live = db.live_alarm(device.id, config.id).await?;

        if stale_for > config.rule.threshold_seconds {
            match live {
                None => {
                    if db.open_alarm(device.id, config.id, breach, now).await? {
                        info!(
                            device_id = device.id,
                            config = %config.rule.name,
                            breach_seconds = ?breach,
                            "alarm opened"
                        );
                        summary.opened += 1;
                    }
                }
                Some(alarm) => {
                    db.update_breach(alarm.id, breach, now).await?;
                    summary.refreshed += 1;
                }
            }
        } else if let Some(alarm) = live {
            db.resolve_alarm(alarm.id, now).await?;
            info!(
                device_id = device.id,
                config = %config.rule.name,
                from = %alarm.status,
                "alarm resolved"
            );
            summary.resolved += 1;
        }
    }

    // Devices that left the rule's scope or were deactivated.
    let covered: HashSet<i64> = targets.iter().map(|d| d.id).collect();
    for alarm in db.live_alarms_for_config(config.id).await? {
        if covered.contains(&alarm.device_id) {
            continue;
        }
        db.resolve_alarm(alarm.id, now).await?;
        info!(
            device_id = alarm.device_id,
            config = %config.rule.name,
            "alarm resolved, device no longer targeted"
        );
        summary.resolved += 1;
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

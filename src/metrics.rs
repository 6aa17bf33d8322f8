//! Process-wide counters for the chat runtime.
//! Read through [`snapshot`] by the periodic status log line.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_ROUTED: AtomicU64 = AtomicU64::new(0);
static FLOOD_WARNINGS: AtomicU64 = AtomicU64::new(0);
static BANS_APPLIED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_KICKED: AtomicU64 = AtomicU64::new(0);
static RENDERS_FAILED: AtomicU64 = AtomicU64::new(0);
static AUDIO_SUPPRESSED: AtomicU64 = AtomicU64::new(0);

static EVENT_FIRINGS: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

pub fn inc_connections_accepted() {
    CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connections_rejected() {
    CONNECTIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_routed() {
    MESSAGES_ROUTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_flood_warnings() {
    FLOOD_WARNINGS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_bans_applied() {
    BANS_APPLIED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sessions_kicked() {
    SESSIONS_KICKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_renders_failed() {
    RENDERS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_audio_suppressed() {
    AUDIO_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
}

fn event_lock() -> &'static Mutex<HashMap<String, u64>> {
    EVENT_FIRINGS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Count one firing of the named world event and return the new total.
pub fn record_event_firing(name: &str) -> u64 {
    let mut guard = match event_lock().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let counter = guard.entry(name.to_string()).or_default();
    *counter = counter.saturating_add(1);
    *counter
}

pub fn event_firings_snapshot() -> HashMap<String, u64> {
    match event_lock().lock() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub messages_routed: u64,
    pub flood_warnings: u64,
    pub bans_applied: u64,
    pub sessions_kicked: u64,
    pub renders_failed: u64,
    pub audio_suppressed: u64,
    pub event_firings: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
        connections_rejected: CONNECTIONS_REJECTED.load(Ordering::Relaxed),
        messages_routed: MESSAGES_ROUTED.load(Ordering::Relaxed),
        flood_warnings: FLOOD_WARNINGS.load(Ordering::Relaxed),
        bans_applied: BANS_APPLIED.load(Ordering::Relaxed),
        sessions_kicked: SESSIONS_KICKED.load(Ordering::Relaxed),
        renders_failed: RENDERS_FAILED.load(Ordering::Relaxed),
        audio_suppressed: AUDIO_SUPPRESSED.load(Ordering::Relaxed),
        event_firings: event_firings_snapshot().values().sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_firings_accumulate_per_name() {
        let first = record_event_firing("metrics-test-event");
        let second = record_event_firing("metrics-test-event");
        assert_eq!(second, first + 1);
        let snap = event_firings_snapshot();
        assert_eq!(snap.get("metrics-test-event").copied(), Some(second));
    }

    #[test]
    fn counters_are_monotonic() {
        let before = snapshot();
        inc_flood_warnings();
        inc_bans_applied();
        let after = snapshot();
        assert!(after.flood_warnings >= before.flood_warnings + 1);
        assert!(after.bans_applied >= before.bans_applied + 1);
    }
}

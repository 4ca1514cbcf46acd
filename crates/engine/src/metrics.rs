//! Process-wide loop counters.
//!
//! Plain atomics rather than a metrics registry: the engine crate stays
//! embeddable and the host process decides how (or whether) to export the
//! numbers. `snapshot` is cheap enough to call from a health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static STEPS_ATTEMPTED: AtomicU64 = AtomicU64::new(0);
static STEPS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static STEPS_FAILED: AtomicU64 = AtomicU64::new(0);
static ITERATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static REFLECTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static INVESTIGATION_CYCLES_TOTAL: AtomicU64 = AtomicU64::new(0);
static INVESTIGATION_CYCLES_READY: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_step_attempted() {
    STEPS_ATTEMPTED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_step_completed() {
    STEPS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_step_failed() {
    STEPS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_iteration() {
    ITERATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_reflection() {
    REFLECTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_investigation_cycle(ready: bool) {
    INVESTIGATION_CYCLES_TOTAL.fetch_add(1, Ordering::Relaxed);
    if ready {
        INVESTIGATION_CYCLES_READY.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the loop counters.
#[derive(Clone, Debug, Serialize)]
pub struct EngineMetricsSnapshot {
    pub steps_attempted: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub iterations_total: u64,
    pub reflections_total: u64,
    pub investigation_cycles_total: u64,
    pub investigation_cycles_ready: u64,
}

pub fn snapshot() -> EngineMetricsSnapshot {
    EngineMetricsSnapshot {
        steps_attempted: STEPS_ATTEMPTED.load(Ordering::Relaxed),
        steps_completed: STEPS_COMPLETED.load(Ordering::Relaxed),
        steps_failed: STEPS_FAILED.load(Ordering::Relaxed),
        iterations_total: ITERATIONS_TOTAL.load(Ordering::Relaxed),
        reflections_total: REFLECTIONS_TOTAL.load(Ordering::Relaxed),
        investigation_cycles_total: INVESTIGATION_CYCLES_TOTAL.load(Ordering::Relaxed),
        investigation_cycles_ready: INVESTIGATION_CYCLES_READY.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_monotonically() {
        let before = snapshot();
        record_step_attempted();
        record_iteration();
        record_investigation_cycle(true);
        let after = snapshot();
        assert!(after.steps_attempted >= before.steps_attempted + 1);
        assert!(after.iterations_total >= before.iterations_total + 1);
        assert!(after.investigation_cycles_ready >= before.investigation_cycles_ready + 1);
    }
}

use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref REGISTRY_SESSIONS_TOTAL: IntGauge = IntGauge::new(
        "taskloop_registry_sessions_total",
        "Total registered workflow sessions"
    )
    .unwrap();
    static ref REGISTRY_SESSIONS_CREATED: IntCounter = IntCounter::new(
        "taskloop_registry_sessions_created_total",
        "Workflow sessions created"
    )
    .unwrap();
    static ref REGISTRY_SESSIONS_DESTROYED: IntCounter = IntCounter::new(
        "taskloop_registry_sessions_destroyed_total",
        "Workflow sessions destroyed"
    )
    .unwrap();
    static ref REGISTRY_SESSIONS_SWEPT: IntCounter = IntCounter::new(
        "taskloop_registry_sessions_swept_total",
        "Workflow sessions evicted by the idle sweep"
    )
    .unwrap();
    static ref REGISTRY_STEPS_COMPLETED: IntCounter = IntCounter::new(
        "taskloop_registry_steps_completed_total",
        "Steps recorded as completed"
    )
    .unwrap();
    static ref REGISTRY_STEPS_FAILED: IntCounter = IntCounter::new(
        "taskloop_registry_steps_failed_total",
        "Steps recorded as failed"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register taskloop registry metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, REGISTRY_SESSIONS_TOTAL.clone());
    register(registry, REGISTRY_SESSIONS_CREATED.clone());
    register(registry, REGISTRY_SESSIONS_DESTROYED.clone());
    register(registry, REGISTRY_SESSIONS_SWEPT.clone());
    register(registry, REGISTRY_STEPS_COMPLETED.clone());
    register(registry, REGISTRY_STEPS_FAILED.clone());
}

pub fn set_session_count(count: usize) {
    REGISTRY_SESSIONS_TOTAL.set(count as i64);
}

pub fn record_session_created() {
    REGISTRY_SESSIONS_CREATED.inc();
}

pub fn record_session_destroyed() {
    REGISTRY_SESSIONS_DESTROYED.inc();
}

pub fn record_sessions_swept(count: usize) {
    REGISTRY_SESSIONS_SWEPT.inc_by(count as u64);
}

pub fn record_step_outcome(completed: bool) {
    if completed {
        REGISTRY_STEPS_COMPLETED.inc();
    } else {
        REGISTRY_STEPS_FAILED.inc();
    }
}

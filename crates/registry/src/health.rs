use serde::{Deserialize, Serialize};

use taskloop_core_types::SessionStatus;

/// Point-in-time count of sessions by status.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub total: usize,
    pub initializing: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cleanup: usize,
}

impl RegistryHealth {
    pub fn observe(&mut self, status: SessionStatus) {
        self.total += 1;
        match status {
            SessionStatus::Initializing => self.initializing += 1,
            SessionStatus::Active => self.active += 1,
            SessionStatus::Paused => self.paused += 1,
            SessionStatus::Completed => self.completed += 1,
            SessionStatus::Failed => self.failed += 1,
            SessionStatus::Cancelled => self.cancelled += 1,
            SessionStatus::Cleanup => self.cleanup += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_tallies_by_status() {
        let mut health = RegistryHealth::default();
        health.observe(SessionStatus::Active);
        health.observe(SessionStatus::Active);
        health.observe(SessionStatus::Failed);
        assert_eq!(health.total, 3);
        assert_eq!(health.active, 2);
        assert_eq!(health.failed, 1);
    }
}

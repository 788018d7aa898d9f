//! [`KernelService`] – lifecycle contract of every kernel service.
//!
//! A service moves through the states below.  `start` returns once the
//! service has reached [`ServiceState::Running`]; `stop` returns once it has
//! reached [`ServiceState::Terminated`].
//!
//! ```text
//! New ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Terminated
//!                    │                              │
//!                    └──────────▶ Failed ◀──────────┘
//! ```
//!
//! Services that must be started in a fixed order advertise a
//! [`KernelService::start_priority`]; services that must be stopped in a
//! fixed order advertise a [`KernelService::stop_priority`].  Lower values
//! go first.  See [`ServiceManager`][crate::orchestrator::ServiceManager].

use std::fmt;

use agora_types::AgoraError;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Lifecycle state of a [`KernelService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::New => "new",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Terminated => "terminated",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait KernelService: Send + Sync {
    fn name(&self) -> &str;

    fn start_priority(&self) -> Option<u32> {
        None
    }

    fn stop_priority(&self) -> Option<u32> {
        None
    }

    fn state(&self) -> ServiceState;

    async fn start(&self) -> Result<(), AgoraError>;

    async fn stop(&self) -> Result<(), AgoraError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Lifecycle bookkeeping shared by the stock services
// ────────────────────────────────────────────────────────────────────────────

/// Guarded [`ServiceState`] cell.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ServiceState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(ServiceState::New),
        }
    }
}

impl Lifecycle {
    pub fn get(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn set(&self, state: ServiceState) {
        *self.state.lock() = state;
    }

    pub fn is_running(&self) -> bool {
        self.get() == ServiceState::Running
    }

    /// Enter `Starting`.  Returns `false` when the service is already
    /// starting or running, in which case the caller must do nothing.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Starting | ServiceState::Running => false,
            _ => {
                *state = ServiceState::Starting;
                true
            }
        }
    }

    /// Enter `Stopping`.  Returns `false` when there is nothing to stop.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Starting | ServiceState::Running => {
                *state = ServiceState::Stopping;
                true
            }
            ServiceState::New => {
                *state = ServiceState::Terminated;
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_entered_once() {
        let lifecycle = Lifecycle::default();
        assert!(lifecycle.begin_start());
        assert!(!lifecycle.begin_start());
        lifecycle.set(ServiceState::Running);
        assert!(!lifecycle.begin_start());
        assert!(lifecycle.is_running());
    }

    #[test]
    fn stopping_a_new_service_terminates_it() {
        let lifecycle = Lifecycle::default();
        assert!(!lifecycle.begin_stop());
        assert_eq!(lifecycle.get(), ServiceState::Terminated);
    }

    #[test]
    fn terminated_service_may_restart() {
        let lifecycle = Lifecycle::default();
        lifecycle.set(ServiceState::Terminated);
        assert!(lifecycle.begin_start());
    }
}

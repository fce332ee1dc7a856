//! Teardown auditing for long-lived observables.
//!
//! The host bootstrap owns one `ObservableRegistry`, hands it to every
//! `OpCapture` and `SyncTransport` it creates, and calls
//! `audit_teardown()` at shutdown to find anything still alive.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} observable(s) still alive at teardown: {}", .leaked.len(), .leaked.join(", "))]
pub struct TeardownError {
    pub leaked: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    initialized: bool,
    next_id: u64,
    live: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservableRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ObservableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new audit period.
    pub fn init(&self) {
        let mut state = self.state.lock();
        if !state.live.is_empty() {
            log::warn!(
                "Registry re-initialised with {} live observables",
                state.live.len()
            );
        }
        state.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Track an observable until the returned guard drops.
    pub fn register(&self, label: impl Into<String>) -> RegistryGuard {
        let label = label.into();
        let mut state = self.state.lock();
        if !state.initialized {
            log::debug!("Registering {label} before init()");
        }
        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id, label);
        RegistryGuard {
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Labels of everything currently registered.
    pub fn live(&self) -> Vec<String> {
        self.state.lock().live.values().cloned().collect()
    }

    /// End the audit period. Fails when anything registered is still alive.
    pub fn audit_teardown(&self) -> Result<(), TeardownError> {
        let mut state = self.state.lock();
        state.initialized = false;
        if state.live.is_empty() {
            return Ok(());
        }
        let leaked: Vec<String> = state.live.values().cloned().collect();
        log::warn!("Teardown audit found {} live observables", leaked.len());
        Err(TeardownError { leaked })
    }
}

/// Unregisters its observable on drop.
#[derive(Debug)]
pub struct RegistryGuard {
    id: u64,
    state: Weak<Mutex<RegistryState>>,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().live.remove(&self.id);
        }
    }
}

//! Connection state machine: caller intent plus observed socket status.
//!
//! Pure bookkeeping, no I/O. The transport actor feeds it socket events
//! and asks it whether (and when) to retry.
//!
//! ```text
//!   connect()          open ok              close
//! ┌──────────────┐  ┌────────────┐  ┌──────────────────┐
//! │ Disconnected ├─►│ Connecting ├─►│    Connected     │
//! └──────▲───────┘  └─────┬──────┘  └────────┬─────────┘
//!        │   open failed  │                  │
//!        └────────────────┴──────────────────┘
//!          retry after min(2^failures × 100ms, max_backoff)
//!          while intent = Connected and failures < budget
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Observed socket readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// What the caller wants, independent of transient socket loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub intent: Intent,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            intent: Intent::Disconnected,
        }
    }
}

/// Result of a socket closing (or failing to open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// The socket had reached `Connected` before it closed.
    pub was_connected: bool,
    /// Delay before the next attempt, if one should be made.
    pub retry_in: Option<Duration>,
}

/// `min(2^failures × 100ms, max_backoff)`.
pub fn backoff_delay(failures: u32, max_backoff: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    BASE_BACKOFF.saturating_mul(factor).min(max_backoff)
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    /// Consecutive attempts that closed before reaching `Connected`.
    failures: u32,
    max_backoff: Duration,
    max_connection_errors: u32,
    destroyed: bool,
}

impl ConnectionStateMachine {
    pub fn new(max_backoff: Duration, max_connection_errors: u32) -> Self {
        Self {
            state: ConnectionState::default(),
            failures: 0,
            max_backoff,
            max_connection_errors,
            destroyed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    pub fn intent(&self) -> Intent {
        self.state.intent
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Caller wants to be connected. Resets the retry budget.
    pub fn connect(&mut self) {
        if self.destroyed {
            return;
        }
        self.state.intent = Intent::Connected;
        self.failures = 0;
    }

    /// Caller wants to be disconnected. The socket still has to be closed
    /// and reported through [`closed`](Self::closed).
    pub fn disconnect(&mut self) {
        self.state.intent = Intent::Disconnected;
    }

    /// A URL change invalidates past failures.
    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }

    /// Start an attempt. Returns false when no attempt should be made.
    pub fn begin_attempt(&mut self) -> bool {
        if self.destroyed
            || self.state.intent != Intent::Connected
            || self.state.status != ConnectionStatus::Disconnected
        {
            return false;
        }
        self.state.status = ConnectionStatus::Connecting;
        true
    }

    pub fn opened(&mut self) {
        self.state.status = ConnectionStatus::Connected;
        self.failures = 0;
    }

    /// The socket closed or the attempt failed on its own. Counts as a
    /// failure if it never reached `Connected` while the caller wanted it.
    pub fn closed(&mut self) -> CloseOutcome {
        let failed = self.state.status != ConnectionStatus::Connected
            && self.state.intent == Intent::Connected;
        self.finish(failed)
    }

    /// The caller tore the socket or attempt down (disconnect, URL change).
    /// Never counts against the retry budget.
    pub fn abandoned(&mut self) -> CloseOutcome {
        self.finish(false)
    }

    fn finish(&mut self, failed: bool) -> CloseOutcome {
        let was_connected = self.state.status == ConnectionStatus::Connected;
        if failed {
            self.failures = self.failures.saturating_add(1);
        }
        self.state.status = ConnectionStatus::Disconnected;

        let retry = !self.destroyed
            && self.state.intent == Intent::Connected
            && self.failures < self.max_connection_errors;
        CloseOutcome {
            was_connected,
            retry_in: retry.then(|| backoff_delay(self.failures, self.max_backoff)),
        }
    }

    /// Terminal: no further attempts, intent dropped.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.state = ConnectionState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new(Duration::from_millis(2500), 10)
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = Duration::from_millis(2500);
        assert_eq!(backoff_delay(0, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(3, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, max), max);
        assert_eq!(backoff_delay(64, max), max);
    }

    #[test]
    fn test_open_close_open_sequence() {
        let mut m = machine();
        m.connect();
        assert!(m.begin_attempt());
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        m.opened();

        let outcome = m.closed();
        assert!(outcome.was_connected);
        assert_eq!(outcome.retry_in, Some(Duration::from_millis(100)));
        assert_eq!(m.intent(), Intent::Connected);

        assert!(m.begin_attempt());
        m.opened();
        assert_eq!(m.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_no_retry_after_disconnect() {
        let mut m = machine();
        m.connect();
        m.begin_attempt();
        m.opened();
        m.disconnect();
        let outcome = m.closed();
        assert!(outcome.was_connected);
        assert_eq!(outcome.retry_in, None);
        assert!(!m.begin_attempt());
    }

    #[test]
    fn test_failures_grow_backoff_until_budget() {
        let mut m = ConnectionStateMachine::new(Duration::from_secs(60), 3);
        m.connect();
        let mut delays = Vec::new();
        loop {
            assert!(m.begin_attempt());
            match m.closed().retry_in {
                Some(d) => delays.push(d),
                None => break,
            }
        }
        assert_eq!(
            delays,
            vec![Duration::from_millis(200), Duration::from_millis(400)]
        );
        assert_eq!(m.failures(), 3);
        assert_eq!(m.intent(), Intent::Connected);

        // An explicit connect restores the budget.
        m.connect();
        assert_eq!(m.failures(), 0);
        assert!(m.begin_attempt());
    }

    #[test]
    fn test_successful_open_resets_failures() {
        let mut m = machine();
        m.connect();
        m.begin_attempt();
        m.closed();
        m.begin_attempt();
        m.closed();
        assert_eq!(m.failures(), 2);
        m.begin_attempt();
        m.opened();
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_caller_teardown_is_not_a_failure() {
        let mut m = machine();
        m.connect();
        m.begin_attempt();
        m.closed();
        assert_eq!(m.failures(), 1);

        // URL rotation mid-attempt: retried at the base delay, budget untouched.
        m.reset_failures();
        m.begin_attempt();
        let outcome = m.abandoned();
        assert_eq!(m.failures(), 0);
        assert_eq!(outcome.retry_in, Some(Duration::from_millis(100)));

        // Disconnect mid-attempt.
        m.begin_attempt();
        m.disconnect();
        assert_eq!(m.abandoned().retry_in, None);
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_close_without_intent_is_not_a_failure() {
        let mut m = machine();
        m.connect();
        m.begin_attempt();
        m.disconnect();
        assert_eq!(m.closed().retry_in, None);
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_destroy_is_terminal() {
        let mut m = machine();
        m.connect();
        m.begin_attempt();
        m.destroy();
        assert_eq!(m.state(), ConnectionState::default());
        m.connect();
        assert!(!m.begin_attempt());
        assert_eq!(m.closed().retry_in, None);
    }
}

//! State machines: supervisor lifecycle and per-message resolution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ShuttleError;

/// Lifecycle of a `WorkerSupervisor`.
///
/// State transitions:
/// - Idle -> Configuring -> Running -> Stopping -> Stopped
/// - Configuring -> Idle (option validation failed)
///
/// Running -> Idle is not allowed: a stopped supervisor is never reused,
/// build a new one instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupervisorState {
    Idle,
    Configuring,
    Running,
    Stopping,
    Stopped,
}

impl SupervisorState {
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Idle, Configuring)
                | (Configuring, Idle)
                | (Configuring, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: SupervisorState) -> Result<SupervisorState, ShuttleError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ShuttleError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Has `start` already been called on this supervisor?
    pub fn is_started(self) -> bool {
        !matches!(self, SupervisorState::Idle)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the pipeline settled one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Handler succeeded; message acknowledged.
    Accepted,

    /// Another consumer holds (or recently held) the dedup lock; the
    /// delivery was removed without running the handler.
    Duplicate,

    /// Rejected and handed back to the broker for redelivery.
    Retried {
        retry_attempts: u32,
        delay: Duration,
    },

    /// Rejected with the retry budget used up; removed for good.
    RetryExceeded,

    /// Rejected on a queue with retries disabled; removed for good.
    Discarded,

    /// Handler set the `drop` flag; removed for good.
    Dropped,
}

impl Resolution {
    /// Is the message gone from the queue after this resolution?
    pub fn is_final(&self) -> bool {
        !matches!(self, Resolution::Retried { .. })
    }
}

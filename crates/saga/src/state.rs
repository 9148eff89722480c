//! Per-message state machine.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// The state of one inbound message while it is being consumed.
///
/// State transitions:
/// ```text
/// Received ──┬──► Done                           (already processed)
///            ├──► Allocating ──┬──► Confirmed ──┐
///            │                 └──► Failed ─────┤
///            ├──► Failed ───────────────────────┤
///            └──► Releasing ────────────────────┴──► Recorded ──► Acknowledged
/// ```
///
/// A message that loses the idempotency claim inside its transaction moves to
/// `Done` from `Allocating`, `Releasing` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageState {
    #[default]
    Received,

    /// Duplicate delivery, acknowledged without effect (terminal state).
    Done,

    /// Reservation lines are being allocated.
    Allocating,

    /// Outstanding allocations are being restored.
    Releasing,

    /// Every line was satisfied.
    Confirmed,

    /// A line could not be satisfied; the failure is being recorded.
    Failed,

    /// Outcome, idempotency marker and stock changes are committed.
    Recorded,

    /// The inbound delivery has been acknowledged (terminal state).
    Acknowledged,
}

impl MessageState {
    /// Returns true if the protocol allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;

        matches!(
            (self, next),
            (Received, Done | Allocating | Releasing | Failed)
                | (Allocating, Confirmed | Failed | Done)
                | (Releasing, Recorded | Done)
                | (Confirmed, Recorded)
                | (Failed, Recorded | Done)
                | (Recorded, Acknowledged)
        )
    }

    /// Moves to `next`, or reports the illegal transition.
    pub fn transition_to(self, next: MessageState) -> Result<MessageState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SagaError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Done | MessageState::Acknowledged)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Received => "Received",
            MessageState::Done => "Done",
            MessageState::Allocating => "Allocating",
            MessageState::Releasing => "Releasing",
            MessageState::Confirmed => "Confirmed",
            MessageState::Failed => "Failed",
            MessageState::Recorded => "Recorded",
            MessageState::Acknowledged => "Acknowledged",
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Operation state machine
//!
//! ```text
//! RECEIVED -> VALIDATED -> RESERVED -> COMMITTED
//!     |           |            \
//!     +-----------+-> FAILED    +-> ROLLED_BACK
//! ```
//!
//! A replayed idempotency key goes straight from VALIDATED to COMMITTED.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Received,
    Validated,
    /// Inside the atomic scope; runs to COMMITTED or ROLLED_BACK
    Reserved,
    Committed,
    Failed,
    RolledBack,
}

impl OperationState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Committed | OperationState::Failed | OperationState::RolledBack
        )
    }

    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Failed)
                | (Validated, Reserved)
                | (Validated, Committed)
                | (Validated, Failed)
                | (Reserved, Committed)
                | (Reserved, RolledBack)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Received => "RECEIVED",
            OperationState::Validated => "VALIDATED",
            OperationState::Reserved => "RESERVED",
            OperationState::Committed => "COMMITTED",
            OperationState::Failed => "FAILED",
            OperationState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one operation, logging every transition
#[derive(Debug)]
pub struct StateTracker {
    operation_id: Uuid,
    state: OperationState,
}

impl StateTracker {
    pub fn new(operation_id: Uuid) -> Self {
        tracing::debug!(operation_id = %operation_id, state = "RECEIVED", "Operation received");
        Self {
            operation_id,
            state: OperationState::Received,
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn advance(&mut self, next: OperationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(
            operation_id = %self.operation_id,
            from = %self.state,
            to = %next,
            "Operation state transition"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(OperationState::Committed.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::RolledBack.is_terminal());

        assert!(!OperationState::Received.is_terminal());
        assert!(!OperationState::Validated.is_terminal());
        assert!(!OperationState::Reserved.is_terminal());
    }

    #[test]
    fn test_transitions() {
        use OperationState::*;

        assert!(Received.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Reserved));
        assert!(Reserved.can_transition_to(Committed));
        assert!(Reserved.can_transition_to(RolledBack));

        // Once reserved the scope must finish; it cannot fail validation
        assert!(!Reserved.can_transition_to(Failed));
        assert!(!Received.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(RolledBack));
    }

    #[test]
    fn test_tracker_advances() {
        let mut tracker = StateTracker::new(Uuid::new_v4());
        tracker.advance(OperationState::Validated);
        tracker.advance(OperationState::Reserved);
        tracker.advance(OperationState::Committed);
        assert_eq!(tracker.state(), OperationState::Committed);
    }
}

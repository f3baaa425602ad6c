//! Relay pair state machine
//!
//! ```text
//! ACTIVE --(A closed)--> A_CLOSED --(B closed)--> TERMINATED
//! ACTIVE --(B closed)--> B_CLOSED --(A closed)--> TERMINATED
//! any non-terminal --(error)--> TERMINATED
//! ```
//!
//! TERMINATED is absorbing. Transitions return `None` when the event does not
//! change the state, which is how repeated close events become no-ops.

use crate::side::Side;
use std::fmt;

/// Lifecycle state of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Both sides open
    Active,
    /// Side A closed, side B still open
    AClosed,
    /// Side B closed, side A still open
    BClosed,
    /// Both sides closed or failed; no further forwarding
    Terminated,
}

impl RelayState {
    pub fn is_terminated(self) -> bool {
        self == RelayState::Terminated
    }

    /// Whether `side` has been closed in this state
    pub fn is_closed(self, side: Side) -> bool {
        match (self, side) {
            (RelayState::Terminated, _) => true,
            (RelayState::AClosed, Side::A) | (RelayState::BClosed, Side::B) => true,
            _ => false,
        }
    }

    /// State after `side` closes, or `None` if it was already closed
    pub fn on_closed(self, side: Side) -> Option<RelayState> {
        match (self, side) {
            (RelayState::Active, Side::A) => Some(RelayState::AClosed),
            (RelayState::Active, Side::B) => Some(RelayState::BClosed),
            (RelayState::AClosed, Side::B) | (RelayState::BClosed, Side::A) => {
                Some(RelayState::Terminated)
            }
            _ => None,
        }
    }

    /// State after an error on either side, or `None` if already terminated
    pub fn on_error(self) -> Option<RelayState> {
        if self.is_terminated() {
            None
        } else {
            Some(RelayState::Terminated)
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Active => "ACTIVE",
            RelayState::AClosed => "A_CLOSED",
            RelayState::BClosed => "B_CLOSED",
            RelayState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

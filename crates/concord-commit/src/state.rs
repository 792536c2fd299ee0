//! Transaction state machines.
//!
//! ```text
//! Coordinator:
//!   INIT ──► PREPARING ──► COMMITTING ──► COMMITTED
//!    │            │
//!    └────────────┴──────► ABORTING ────► ABORTED
//!
//! Participant:
//!   ACTIVE ──► PREPARED ──► COMMITTED
//!     │           │
//!     └───────────┴───────► ABORTED
//! ```
//!
//! Both machines only move forward.

use std::fmt;

use serde::{Deserialize, Serialize};

use concord_common::types::Decision;

/// Global transaction state, owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// Participants enlisted, operations being executed.
    Init,
    /// Votes requested.
    Preparing,
    /// Commit decided and logged, being disseminated.
    Committing,
    /// Abort decided and logged, being disseminated.
    Aborting,
    /// Every participant acknowledged the commit.
    Committed,
    /// Every participant acknowledged the abort.
    Aborted,
}

impl CoordinatorState {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns the decision this state implies, if one was reached.
    pub fn decision(&self) -> Option<Decision> {
        match self {
            Self::Committing | Self::Committed => Some(Decision::Commit),
            Self::Aborting | Self::Aborted => Some(Decision::Abort),
            Self::Init | Self::Preparing => None,
        }
    }

    /// Checks whether moving to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (Init, Preparing)
                | (Init, Aborting)
                | (Preparing, Committing)
                | (Preparing, Aborting)
                | (Committing, Committed)
                | (Aborting, Aborted)
        )
    }

    /// State entered once `decision` is logged.
    pub fn deciding(decision: Decision) -> Self {
        match decision {
            Decision::Commit => Self::Committing,
            Decision::Abort => Self::Aborting,
        }
    }

    /// State entered once `decision` is acknowledged by everyone.
    pub fn finished(decision: Decision) -> Self {
        match decision {
            Decision::Commit => Self::Committed,
            Decision::Abort => Self::Aborted,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Preparing => "PREPARING",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Local transaction state, owned by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    /// Executing operations; may still abort on its own.
    Active,
    /// Voted commit; waits for the coordinator's decision.
    Prepared,
    /// Committed locally.
    Committed,
    /// Aborted locally.
    Aborted,
}

impl ParticipantState {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns the local outcome, if reached.
    pub fn decision(&self) -> Option<Decision> {
        match self {
            Self::Committed => Some(Decision::Commit),
            Self::Aborted => Some(Decision::Abort),
            Self::Active | Self::Prepared => None,
        }
    }

    /// Checks whether moving to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (self, next),
            (Active, Prepared) | (Active, Aborted) | (Prepared, Committed) | (Prepared, Aborted)
        )
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

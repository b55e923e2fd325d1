//! Update-only run mode entered after a validated image crashes.
//!
//! The loop has no exit of its own: the device leaves it only through a
//! restart, normally after a completed transfer.

use core::fmt;

use crate::coordinator::{FatalError, RollbackCoordinator};
use crate::partition::PartitionOracle;
use crate::reset::{ResetClassifier, ResetReason};
use crate::store::StateStore;
use crate::transfer::UpdateService;

/// Safe-mode sub-state tracking network association.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SafeModeState {
    AwaitingLink,
    ServingUpdates,
}

impl SafeModeState {
    #[must_use]
    pub const fn index(self) -> u16 {
        match self {
            SafeModeState::AwaitingLink => 0,
            SafeModeState::ServingUpdates => 1,
        }
    }

    #[must_use]
    pub const fn from_index(index: u16) -> Option<Self> {
        match index {
            0 => Some(SafeModeState::AwaitingLink),
            1 => Some(SafeModeState::ServingUpdates),
            _ => None,
        }
    }
}

impl fmt::Display for SafeModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeModeState::AwaitingLink => f.write_str("awaiting-link"),
            SafeModeState::ServingUpdates => f.write_str("serving-updates"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SafeModeLoop {
    reason: ResetReason,
    state: SafeModeState,
}

impl SafeModeLoop {
    /// Enters safe mode, making sure the update service is running.
    ///
    /// Failing to start the service leaves the device with no way to receive
    /// a fix, so it is reported as fatal.
    pub fn enter<S, P, R, U>(
        coordinator: &mut RollbackCoordinator<S, P, R, U>,
        reason: ResetReason,
    ) -> Result<Self, FatalError>
    where
        S: StateStore,
        P: PartitionOracle,
        R: ResetClassifier,
        U: UpdateService,
    {
        coordinator
            .ensure_service_running()
            .map_err(FatalError::SafeModeService)?;
        Ok(Self {
            reason,
            state: SafeModeState::AwaitingLink,
        })
    }

    /// Follows the link state; returns the new state on a transition.
    pub fn on_link(&mut self, up: bool) -> Option<SafeModeState> {
        let next = if up {
            SafeModeState::ServingUpdates
        } else {
            SafeModeState::AwaitingLink
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }

    #[must_use]
    pub const fn state(&self) -> SafeModeState {
        self.state
    }

    /// Reset cause that triggered safe mode.
    #[must_use]
    pub const fn reason(&self) -> ResetReason {
        self.reason
    }
}

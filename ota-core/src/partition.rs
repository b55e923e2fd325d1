//! Boot slot bookkeeping for dual-image devices.

use core::fmt;

/// One of the two firmware image slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    /// Returns the opposite slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    /// Compact code used by telemetry payloads.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            0 => Some(SlotId::A),
            1 => Some(SlotId::B),
            _ => None,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::A => f.write_str("A"),
            SlotId::B => f.write_str("B"),
        }
    }
}

/// Failure reported when the platform refuses to change the boot slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActivationError {
    /// Boot configuration is locked or could not be unlocked.
    Locked,
    /// Writing the boot configuration failed.
    Program,
    /// The slot does not hold a bootable image.
    InvalidImage,
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActivationError::Locked => "boot configuration locked",
            ActivationError::Program => "boot configuration write failed",
            ActivationError::InvalidImage => "slot holds no bootable image",
        };
        f.write_str(label)
    }
}

/// Error surfaced when a rollback cannot be scheduled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RollbackError {
    /// No alternate slot could be resolved from the running one.
    AlternateNotFound { current: SlotId },
    /// The platform refused to mark the alternate slot for the next boot.
    Activation(ActivationError),
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::AlternateNotFound { current } => {
                write!(f, "no alternate for slot {current}")
            }
            RollbackError::Activation(err) => write!(f, "activation failed: {err}"),
        }
    }
}

/// Platform view of the two image slots.
pub trait PartitionOracle {
    /// Slot the running image was booted from.
    fn current_slot(&self) -> SlotId;

    /// Slot that becomes active on rollback, if one exists.
    fn alternate_of(&self, slot: SlotId) -> Option<SlotId>;

    /// Marks `slot` as the one to boot after the next restart.
    fn set_next_boot(&mut self, slot: SlotId) -> Result<(), ActivationError>;
}

/// Designates the alternate of the running slot as the next boot target.
pub fn request_rollback<P>(oracle: &mut P) -> Result<SlotId, RollbackError>
where
    P: PartitionOracle + ?Sized,
{
    let current = oracle.current_slot();
    let alternate = oracle
        .alternate_of(current)
        .ok_or(RollbackError::AlternateNotFound { current })?;
    oracle
        .set_next_boot(alternate)
        .map_err(RollbackError::Activation)?;
    Ok(alternate)
}

/// In-memory slot table used by host tooling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotTable {
    current: SlotId,
    next: SlotId,
    alternate_present: bool,
    activation_failure: Option<ActivationError>,
    activations: u32,
}

impl SlotTable {
    /// Creates a table booted from `current` with both slots populated.
    #[must_use]
    pub const fn new(current: SlotId) -> Self {
        Self {
            current,
            next: current,
            alternate_present: true,
            activation_failure: None,
            activations: 0,
        }
    }

    /// Slot selected for the next restart.
    #[must_use]
    pub const fn next_boot(&self) -> SlotId {
        self.next
    }

    /// Number of successful `set_next_boot` calls.
    #[must_use]
    pub const fn activations(&self) -> u32 {
        self.activations
    }

    /// Removes or restores the alternate slot.
    pub fn set_alternate_present(&mut self, present: bool) {
        self.alternate_present = present;
    }

    /// Makes subsequent activations fail with `error`.
    pub fn fail_activation(&mut self, error: Option<ActivationError>) {
        self.activation_failure = error;
    }

    /// Stages a freshly written image in the inactive slot.
    pub fn stage_update(&mut self) {
        self.alternate_present = true;
        self.next = self.current.other();
    }

    /// Applies the pending selection as a restart would.
    pub fn restart(&mut self) {
        self.current = self.next;
    }
}

impl PartitionOracle for SlotTable {
    fn current_slot(&self) -> SlotId {
        self.current
    }

    fn alternate_of(&self, slot: SlotId) -> Option<SlotId> {
        self.alternate_present.then_some(slot.other())
    }

    fn set_next_boot(&mut self, slot: SlotId) -> Result<(), ActivationError> {
        if let Some(error) = self.activation_failure {
            return Err(error);
        }
        self.next = slot;
        self.activations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_targets_the_other_slot() {
        let mut table = SlotTable::new(SlotId::B);
        assert_eq!(request_rollback(&mut table), Ok(SlotId::A));
        assert_eq!(table.next_boot(), SlotId::A);

        table.restart();
        assert_eq!(table.current_slot(), SlotId::A);
    }

    #[test]
    fn missing_alternate_is_reported() {
        let mut table = SlotTable::new(SlotId::A);
        table.set_alternate_present(false);
        assert_eq!(
            request_rollback(&mut table),
            Err(RollbackError::AlternateNotFound { current: SlotId::A })
        );
        assert_eq!(table.activations(), 0);
    }

    #[test]
    fn activation_failure_is_propagated() {
        let mut table = SlotTable::new(SlotId::A);
        table.fail_activation(Some(ActivationError::Locked));
        assert_eq!(
            request_rollback(&mut table),
            Err(RollbackError::Activation(ActivationError::Locked))
        );
        assert_eq!(table.next_boot(), SlotId::A);
    }
}

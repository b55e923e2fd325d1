//! Persisted probation state shared by firmware and host targets.
//!
//! Two values survive resets: the signed test-boot counter and the flag that
//! decides whether the update service starts at boot. [`StateStore`] is the
//! seam the coordinator talks to; [`JournalStore`] implements it on top of any
//! two-bank [`NvStorage`] backend so a torn write can never surface a value
//! that was not committed.

use core::fmt;

mod journal;
mod ram;

pub use journal::{JournalStore, RECORD_LEN};
pub use ram::RamStorage;

/// Raw counter value meaning "validated as stable".
pub const VALIDATED_RAW: i8 = -1;

/// Remaining test boots for the running image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestCounter {
    /// The image has been accepted; no rollback will ever be scheduled.
    Validated,
    /// The image is on probation with the given number of boots left.
    Probation(u8),
}

/// Result of interpreting a raw persisted counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SanitizedCounter {
    pub counter: TestCounter,
    /// Raw value that was out of range and replaced, if any.
    pub corrupted: Option<i8>,
}

impl TestCounter {
    /// Interprets a raw counter, treating anything outside `{-1} ∪ 0..=limit`
    /// as validated and flagging the replacement.
    #[must_use]
    pub fn from_raw(raw: i8, limit: u8) -> SanitizedCounter {
        match u8::try_from(raw) {
            Ok(remaining) if remaining <= limit => SanitizedCounter {
                counter: TestCounter::Probation(remaining),
                corrupted: None,
            },
            _ if raw == VALIDATED_RAW => SanitizedCounter {
                counter: TestCounter::Validated,
                corrupted: None,
            },
            _ => SanitizedCounter {
                counter: TestCounter::Validated,
                corrupted: Some(raw),
            },
        }
    }

    /// Encodes the counter into its persisted form.
    #[must_use]
    pub fn to_raw(self) -> i8 {
        match self {
            TestCounter::Validated => VALIDATED_RAW,
            TestCounter::Probation(remaining) => i8::try_from(remaining).unwrap_or(i8::MAX),
        }
    }

    /// Returns `true` while the image is still being evaluated.
    #[must_use]
    pub const fn is_testing(self) -> bool {
        matches!(self, TestCounter::Probation(_))
    }

    /// Value persisted by the boot-time decrement, if one applies.
    #[must_use]
    pub fn decremented(self) -> Option<i8> {
        match self {
            TestCounter::Validated => None,
            TestCounter::Probation(remaining) => Some(TestCounter::Probation(remaining).to_raw() - 1),
        }
    }
}

impl fmt::Display for TestCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestCounter::Validated => f.write_str("validated"),
            TestCounter::Probation(remaining) => write!(f, "probation({remaining})"),
        }
    }
}

/// Snapshot of every persisted value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PersistedState {
    pub raw_counter: i8,
    pub update_service: bool,
}

impl PersistedState {
    /// State reported when nothing has ever been written.
    pub const DEFAULT: Self = Self {
        raw_counter: VALIDATED_RAW,
        update_service: true,
    };
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Failure reported by a non-volatile storage backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvError {
    /// Access fell outside the bank.
    OutOfBounds,
    /// Backend failed to read.
    Read,
    /// Programming did not complete.
    Program,
    /// Bank erase did not complete.
    Erase,
    /// Power was lost part way through an operation.
    Interrupted,
}

impl fmt::Display for NvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NvError::OutOfBounds => "out-of-bounds",
            NvError::Read => "read-failed",
            NvError::Program => "program-failed",
            NvError::Erase => "erase-failed",
            NvError::Interrupted => "interrupted",
        };
        f.write_str(label)
    }
}

/// Error surfaced when persisting state fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// Backend rejected the operation.
    Storage(NvError),
    /// Bank geometry cannot hold a single record.
    Geometry,
}

impl From<NvError> for StoreError {
    fn from(value: NvError) -> Self {
        StoreError::Storage(value)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Storage(err) => write!(f, "storage {err}"),
            StoreError::Geometry => f.write_str("bank too small"),
        }
    }
}

/// Key/value surface used by the rollback coordinator.
///
/// Reads never fail: a missing value yields its default. Writes either commit
/// completely or leave the previously committed value in place.
pub trait StateStore {
    /// Returns the raw test-boot counter (`-1` when absent).
    fn read_raw_counter(&self) -> i8;

    /// Persists the raw test-boot counter.
    fn write_raw_counter(&mut self, raw: i8) -> Result<(), StoreError>;

    /// Returns whether the update service should start at boot (`true` when absent).
    fn read_update_service(&self) -> bool;

    /// Persists the update-service flag.
    fn write_update_service(&mut self, enabled: bool) -> Result<(), StoreError>;
}

/// One of the two erase banks backing a journal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bank {
    First,
    Second,
}

impl Bank {
    /// Returns the opposite bank.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Bank::First => Bank::Second,
            Bank::Second => Bank::First,
        }
    }

    /// Zero-based index for array-backed implementations.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Bank::First => 0,
            Bank::Second => 1,
        }
    }
}

/// Two-bank erase/program storage. Erased bytes read back as `0xFF`.
pub trait NvStorage {
    /// Size of each bank in bytes.
    fn bank_size(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `offset` within `bank`.
    fn read(&mut self, bank: Bank, offset: usize, buf: &mut [u8]) -> Result<(), NvError>;

    /// Programs `data` at `offset` within `bank`. The target must be erased.
    fn write(&mut self, bank: Bank, offset: usize, data: &[u8]) -> Result<(), NvError>;

    /// Erases the whole bank.
    fn erase(&mut self, bank: Bank) -> Result<(), NvError>;
}

//! Reset cause classification.
//!
//! Only an explicit set of benign causes counts as a normal boot; every other
//! cause, including ones the platform cannot name, is treated as a crash.

use core::fmt;

/// Why the previous boot ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetReason {
    PowerOn,
    ExternalReset,
    SoftwareReset,
    DeepSleepWake,
    Panic,
    Watchdog,
    Brownout,
    /// Platform-specific cause without a dedicated variant, carrying the
    /// platform's raw reset flags.
    Unknown(u8),
}

/// Coarse classification of a [`ResetReason`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootOutcome {
    Normal,
    Critical,
}

impl ResetReason {
    #[must_use]
    pub const fn classify(self) -> BootOutcome {
        match self {
            ResetReason::PowerOn
            | ResetReason::ExternalReset
            | ResetReason::SoftwareReset
            | ResetReason::DeepSleepWake => BootOutcome::Normal,
            ResetReason::Panic
            | ResetReason::Watchdog
            | ResetReason::Brownout
            | ResetReason::Unknown(_) => BootOutcome::Critical,
        }
    }

    /// Returns `true` when the previous boot ended abnormally.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self.classify(), BootOutcome::Critical)
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::PowerOn => f.write_str("power-on"),
            ResetReason::ExternalReset => f.write_str("external-reset"),
            ResetReason::SoftwareReset => f.write_str("software-reset"),
            ResetReason::DeepSleepWake => f.write_str("deep-sleep-wake"),
            ResetReason::Panic => f.write_str("panic"),
            ResetReason::Watchdog => f.write_str("watchdog"),
            ResetReason::Brownout => f.write_str("brownout"),
            ResetReason::Unknown(code) => write!(f, "unknown({code:#04x})"),
        }
    }
}

/// Platform hook reporting the cause of the last reset.
pub trait ResetClassifier {
    fn last_reset_reason(&mut self) -> ResetReason;
}

/// Classifier that always reports a fixed reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FixedReset(pub ResetReason);

impl ResetClassifier for FixedReset {
    fn last_reset_reason(&mut self) -> ResetReason {
        self.0
    }
}

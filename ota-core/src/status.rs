//! Status surface shared by the boot banner and host tooling.
//!
//! [`StatusFormatter`] keeps the textual rendering identical across the
//! firmware log and the emulator `status` command.

use core::fmt;

use crate::link::LinkStatus;
use crate::partition::SlotId;
use crate::reset::ResetReason;
use crate::safe_mode::SafeModeState;
use crate::store::TestCounter;

/// Coarse run mode reported in status output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ModeSummary {
    Booting,
    Normal,
    SafeMode(SafeModeState),
    PendingRestart,
}

impl fmt::Display for ModeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeSummary::Booting => f.write_str("booting"),
            ModeSummary::Normal => f.write_str("normal"),
            ModeSummary::SafeMode(state) => write!(f, "safe-mode ({state})"),
            ModeSummary::PendingRestart => f.write_str("restart-pending"),
        }
    }
}

/// Snapshot of the probation state and its collaborators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    /// Counter as read at boot; `None` before the boot decision ran.
    pub counter: Option<TestCounter>,
    pub reset_reason: Option<ResetReason>,
    pub slot: SlotId,
    pub mode: ModeSummary,
    pub service_running: bool,
    pub service_enabled: bool,
    pub transfer_active: bool,
    pub link: LinkStatus,
    pub link_attempts: u32,
}

/// Helper that renders a [`StatusSnapshot`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> StatusFormatter<'a> {
    /// Creates a new formatter for the provided snapshot.
    #[must_use]
    pub const fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    /// Writes the probation line (e.g. `You have 2 session(s) left to evaluate the new firmware.`).
    pub fn write_probation_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        match self.snapshot.counter {
            Some(TestCounter::Probation(remaining)) if remaining >= 1 => write!(
                writer,
                "You have {remaining} session(s) left to evaluate the new firmware."
            ),
            Some(_) => writer.write_str("This firmware is validated as stable."),
            None => writer.write_str("Probation state unknown."),
        }
    }

    /// Writes the boot line (e.g. `boot slot=A reset=power-on mode=normal`).
    pub fn write_boot_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(writer, "boot slot={} reset=", self.snapshot.slot)?;
        match self.snapshot.reset_reason {
            Some(reason) => write!(writer, "{reason}")?,
            None => writer.write_str("n/a")?,
        }
        write!(writer, " mode={}", self.snapshot.mode)
    }

    /// Writes the service line (e.g. `service running=true enabled=true transfer=idle`).
    pub fn write_service_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "service running={} enabled={} transfer={}",
            self.snapshot.service_running,
            self.snapshot.service_enabled,
            if self.snapshot.transfer_active {
                "active"
            } else {
                "idle"
            }
        )
    }

    /// Writes the link line (e.g. `link connected attempts=0`).
    pub fn write_link_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "link {} attempts={}",
            self.snapshot.link, self.snapshot.link_attempts
        )
    }

    /// Writes every line, each terminated by `eol`.
    pub fn write_all<W: fmt::Write>(&self, writer: &mut W, eol: &str) -> fmt::Result {
        self.write_probation_line(writer)?;
        writer.write_str(eol)?;
        self.write_boot_line(writer)?;
        writer.write_str(eol)?;
        self.write_service_line(writer)?;
        writer.write_str(eol)?;
        self.write_link_line(writer)?;
        writer.write_str(eol)
    }
}

//! Binary remote command frames.
//!
//! A frame starts with a little-endian 16-bit opcode; any bytes after it are
//! ignored so senders can pad frames to a fixed size.

use core::fmt;

use winnow::binary::le_u16;
use winnow::error::{ContextError, ModalResult};
use winnow::prelude::*;

/// Commands accepted over the remote command channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoteCommand {
    Restart,
    Validate,
    Rollback,
    StartUpdateService,
    StopUpdateService,
    ResetDiagnosticLog,
}

/// Every command in opcode-table order.
pub const ALL_COMMANDS: [RemoteCommand; 6] = [
    RemoteCommand::Restart,
    RemoteCommand::Validate,
    RemoteCommand::Rollback,
    RemoteCommand::StartUpdateService,
    RemoteCommand::StopUpdateService,
    RemoteCommand::ResetDiagnosticLog,
];

/// Length of the opcode prefix.
pub const OPCODE_LEN: usize = 2;

impl RemoteCommand {
    pub const RESTART: u16 = 0x3B91;
    pub const VALIDATE: u16 = 0xC7A2;
    pub const ROLLBACK: u16 = 0x5ED4;
    pub const START_UPDATE_SERVICE: u16 = 0xF11F;
    pub const STOP_UPDATE_SERVICE: u16 = 0xF00F;
    pub const RESET_DIAGNOSTIC_LOG: u16 = 0xE2B8;

    #[must_use]
    pub const fn opcode(self) -> u16 {
        match self {
            RemoteCommand::Restart => Self::RESTART,
            RemoteCommand::Validate => Self::VALIDATE,
            RemoteCommand::Rollback => Self::ROLLBACK,
            RemoteCommand::StartUpdateService => Self::START_UPDATE_SERVICE,
            RemoteCommand::StopUpdateService => Self::STOP_UPDATE_SERVICE,
            RemoteCommand::ResetDiagnosticLog => Self::RESET_DIAGNOSTIC_LOG,
        }
    }

    #[must_use]
    pub const fn from_opcode(opcode: u16) -> Option<Self> {
        match opcode {
            Self::RESTART => Some(RemoteCommand::Restart),
            Self::VALIDATE => Some(RemoteCommand::Validate),
            Self::ROLLBACK => Some(RemoteCommand::Rollback),
            Self::START_UPDATE_SERVICE => Some(RemoteCommand::StartUpdateService),
            Self::STOP_UPDATE_SERVICE => Some(RemoteCommand::StopUpdateService),
            Self::RESET_DIAGNOSTIC_LOG => Some(RemoteCommand::ResetDiagnosticLog),
            _ => None,
        }
    }

    /// Position in [`ALL_COMMANDS`], used for compact telemetry codes.
    #[must_use]
    pub const fn index(self) -> u16 {
        match self {
            RemoteCommand::Restart => 0,
            RemoteCommand::Validate => 1,
            RemoteCommand::Rollback => 2,
            RemoteCommand::StartUpdateService => 3,
            RemoteCommand::StopUpdateService => 4,
            RemoteCommand::ResetDiagnosticLog => 5,
        }
    }

    #[must_use]
    pub fn from_index(index: u16) -> Option<Self> {
        ALL_COMMANDS.get(usize::from(index)).copied()
    }

    /// Short operator-facing name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            RemoteCommand::Restart => "restart",
            RemoteCommand::Validate => "validate",
            RemoteCommand::Rollback => "rollback",
            RemoteCommand::StartUpdateService => "service-start",
            RemoteCommand::StopUpdateService => "service-stop",
            RemoteCommand::ResetDiagnosticLog => "log-reset",
        }
    }

    /// Looks up a command by its [`label`](Self::label), ignoring ASCII case.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        ALL_COMMANDS
            .into_iter()
            .find(|command| command.label().eq_ignore_ascii_case(label))
    }

    /// Encodes the command as a minimal frame.
    #[must_use]
    pub const fn encode(self) -> [u8; OPCODE_LEN] {
        self.opcode().to_le_bytes()
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reason a frame could not be turned into a [`RemoteCommand`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// Frame is shorter than the opcode.
    Truncated { len: usize },
    /// Opcode does not name a command.
    UnknownOpcode(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => write!(f, "frame truncated ({len} bytes)"),
            DecodeError::UnknownOpcode(opcode) => write!(f, "unknown opcode {opcode:#06x}"),
        }
    }
}

/// Decodes the opcode at the start of `frame`.
pub fn decode(frame: &[u8]) -> Result<RemoteCommand, DecodeError> {
    let mut input = frame;
    let opcode = opcode_prefix
        .parse_next(&mut input)
        .map_err(|_| DecodeError::Truncated { len: frame.len() })?;
    RemoteCommand::from_opcode(opcode).ok_or(DecodeError::UnknownOpcode(opcode))
}

fn opcode_prefix(input: &mut &[u8]) -> ModalResult<u16, ContextError> {
    le_u16.parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_opcodes_little_endian() {
        assert_eq!(decode(&[0x91, 0x3B]), Ok(RemoteCommand::Restart));
        assert_eq!(decode(&[0xA2, 0xC7]), Ok(RemoteCommand::Validate));
        assert_eq!(decode(&[0xD4, 0x5E]), Ok(RemoteCommand::Rollback));
        assert_eq!(decode(&[0x1F, 0xF1]), Ok(RemoteCommand::StartUpdateService));
        assert_eq!(decode(&[0x0F, 0xF0]), Ok(RemoteCommand::StopUpdateService));
        assert_eq!(decode(&[0xB8, 0xE2]), Ok(RemoteCommand::ResetDiagnosticLog));
    }

    #[test]
    fn ignores_trailing_bytes() {
        assert_eq!(
            decode(&[0xA2, 0xC7, 0x00, 0xFF, 0x13]),
            Ok(RemoteCommand::Validate)
        );
    }

    #[test]
    fn rejects_short_and_unknown_frames() {
        assert_eq!(decode(&[]), Err(DecodeError::Truncated { len: 0 }));
        assert_eq!(decode(&[0xA2]), Err(DecodeError::Truncated { len: 1 }));
        assert_eq!(
            decode(&[0xC7, 0xA2]),
            Err(DecodeError::UnknownOpcode(0xA2C7))
        );
    }

    #[test]
    fn encoding_matches_decoder() {
        for command in ALL_COMMANDS {
            assert_eq!(decode(&command.encode()), Ok(command));
            assert_eq!(RemoteCommand::from_index(command.index()), Some(command));
        }
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!(
            RemoteCommand::from_label("Service-Start"),
            Some(RemoteCommand::StartUpdateService)
        );
        assert_eq!(RemoteCommand::from_label("reboot"), None);
    }
}

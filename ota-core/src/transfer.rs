//! Firmware transfer notifications and the update service seam.

use core::fmt;

use heapless::String;

/// Maximum length of the advertised update-service host name.
pub const MAX_HOSTNAME_LEN: usize = 32;
/// Maximum length of the update-service access credential.
pub const MAX_SECRET_LEN: usize = 64;

/// Default port the update service listens on.
pub const DEFAULT_SERVICE_PORT: u16 = 3232;

/// Error code attached to a failed transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferErrorCode {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
    Other(u8),
}

impl TransferErrorCode {
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            TransferErrorCode::Auth => 0,
            TransferErrorCode::Begin => 1,
            TransferErrorCode::Connect => 2,
            TransferErrorCode::Receive => 3,
            TransferErrorCode::End => 4,
            TransferErrorCode::Other(code) => code,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Self {
        match code {
            0 => TransferErrorCode::Auth,
            1 => TransferErrorCode::Begin,
            2 => TransferErrorCode::Connect,
            3 => TransferErrorCode::Receive,
            4 => TransferErrorCode::End,
            other => TransferErrorCode::Other(other),
        }
    }
}

impl fmt::Display for TransferErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferErrorCode::Auth => f.write_str("auth failed"),
            TransferErrorCode::Begin => f.write_str("begin failed"),
            TransferErrorCode::Connect => f.write_str("connect failed"),
            TransferErrorCode::Receive => f.write_str("receive failed"),
            TransferErrorCode::End => f.write_str("end failed"),
            TransferErrorCode::Other(code) => write!(f, "error {code}"),
        }
    }
}

/// Lifecycle notification raised by the transfer collaborator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferEvent {
    Started,
    Completed,
    Failed(TransferErrorCode),
}

/// Identity the update service advertises and the credential it checks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceIdentity {
    pub hostname: String<MAX_HOSTNAME_LEN>,
    pub password: Option<String<MAX_SECRET_LEN>>,
    pub port: u16,
}

/// Failure reported when the update service cannot be started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceError {
    /// Host name is empty.
    InvalidHostname,
    /// Listener could not be bound.
    Bind,
    /// Transport is not available yet.
    Unavailable,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceError::InvalidHostname => "invalid host name",
            ServiceError::Bind => "listener bind failed",
            ServiceError::Unavailable => "transport unavailable",
        };
        f.write_str(label)
    }
}

/// Platform update service that accepts firmware uploads.
///
/// The service reports progress by posting [`TransferEvent`]s to the device
/// event queue; it never mutates persisted state on its own.
pub trait UpdateService {
    fn start(&mut self, identity: &ServiceIdentity) -> Result<(), ServiceError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_upload_protocol_numbering() {
        let fixtures = [
            (TransferErrorCode::Auth, 0),
            (TransferErrorCode::Begin, 1),
            (TransferErrorCode::Connect, 2),
            (TransferErrorCode::Receive, 3),
            (TransferErrorCode::End, 4),
        ];
        for (code, raw) in fixtures {
            assert_eq!(code.to_raw(), raw);
            assert_eq!(TransferErrorCode::from_raw(raw), code);
        }
        assert_eq!(TransferErrorCode::from_raw(9), TransferErrorCode::Other(9));
    }
}

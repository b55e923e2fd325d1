//! Diagnostic event catalog and ring buffer shared by firmware and host targets.
//!
//! Every decision the supervisor makes lands here as a typed event that can be
//! serialized to a compact numeric code for transport over diagnostics
//! channels. The recorder never blocks: once full, the oldest entries are
//! overwritten. The remote `ResetDiagnosticLog` command clears it.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::command::RemoteCommand;
use crate::coordinator::CommandRejection;
use crate::link::LinkStatus;
use crate::partition::SlotId;
use crate::reset::ResetReason;
use crate::safe_mode::SafeModeState;
use crate::store::StoreError;
use crate::transfer::{ServiceError, TransferErrorCode};

/// Identifier attached to each recorded event.
pub type EventId = u32;

/// Discriminated diagnostic events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OtaEventKind {
    ProbationBoot,
    StableBoot,
    CounterSanitized,
    RollbackCommitted(SlotId),
    SafeModeEntered,
    SafeModeState(SafeModeState),
    ServiceStarted,
    ServiceStopped,
    ServiceStartFailed,
    CommandAccepted(RemoteCommand),
    CommandRejected(RemoteCommand),
    CommandIgnored(RemoteCommand),
    UnknownOpcode,
    TransferStarted,
    TransferCompleted,
    TransferFailed,
    TransferPersistFailed,
    LinkUp,
    LinkLost,
    LinkRetry,
    LinkTimeout,
    Heartbeat,
    LogCleared,
    QueueDisconnected,
    FatalHalt,
    Custom(u16),
}

impl fmt::Display for OtaEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaEventKind::ProbationBoot => f.write_str("probation-boot"),
            OtaEventKind::StableBoot => f.write_str("stable-boot"),
            OtaEventKind::CounterSanitized => f.write_str("counter-sanitized"),
            OtaEventKind::RollbackCommitted(slot) => write!(f, "rollback-committed {slot}"),
            OtaEventKind::SafeModeEntered => f.write_str("safe-mode-entered"),
            OtaEventKind::SafeModeState(state) => write!(f, "safe-mode {state}"),
            OtaEventKind::ServiceStarted => f.write_str("service-started"),
            OtaEventKind::ServiceStopped => f.write_str("service-stopped"),
            OtaEventKind::ServiceStartFailed => f.write_str("service-start-failed"),
            OtaEventKind::CommandAccepted(command) => write!(f, "command-accepted {command}"),
            OtaEventKind::CommandRejected(command) => write!(f, "command-rejected {command}"),
            OtaEventKind::CommandIgnored(command) => write!(f, "command-ignored {command}"),
            OtaEventKind::UnknownOpcode => f.write_str("unknown-opcode"),
            OtaEventKind::TransferStarted => f.write_str("transfer-started"),
            OtaEventKind::TransferCompleted => f.write_str("transfer-completed"),
            OtaEventKind::TransferFailed => f.write_str("transfer-failed"),
            OtaEventKind::TransferPersistFailed => f.write_str("transfer-persist-failed"),
            OtaEventKind::LinkUp => f.write_str("link-up"),
            OtaEventKind::LinkLost => f.write_str("link-lost"),
            OtaEventKind::LinkRetry => f.write_str("link-retry"),
            OtaEventKind::LinkTimeout => f.write_str("link-timeout"),
            OtaEventKind::Heartbeat => f.write_str("heartbeat"),
            OtaEventKind::LogCleared => f.write_str("log-cleared"),
            OtaEventKind::QueueDisconnected => f.write_str("queue-disconnected"),
            OtaEventKind::FatalHalt => f.write_str("fatal-halt"),
            OtaEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl OtaEventKind {
    const PROBATION_BOOT_CODE: u16 = 0x0001;
    const STABLE_BOOT_CODE: u16 = 0x0002;
    const COUNTER_SANITIZED_CODE: u16 = 0x0003;
    const ROLLBACK_BASE: u16 = 0x0010;
    const SAFE_MODE_ENTERED_CODE: u16 = 0x0020;
    const SAFE_MODE_STATE_BASE: u16 = 0x0021;
    const SERVICE_STARTED_CODE: u16 = 0x0030;
    const SERVICE_STOPPED_CODE: u16 = 0x0031;
    const SERVICE_START_FAILED_CODE: u16 = 0x0032;
    const COMMAND_ACCEPTED_BASE: u16 = 0x0040;
    const COMMAND_REJECTED_BASE: u16 = 0x0050;
    const COMMAND_IGNORED_BASE: u16 = 0x0060;
    const UNKNOWN_OPCODE_CODE: u16 = 0x006F;
    const TRANSFER_STARTED_CODE: u16 = 0x0070;
    const TRANSFER_COMPLETED_CODE: u16 = 0x0071;
    const TRANSFER_FAILED_CODE: u16 = 0x0072;
    const TRANSFER_PERSIST_FAILED_CODE: u16 = 0x0073;
    const LINK_UP_CODE: u16 = 0x0080;
    const LINK_LOST_CODE: u16 = 0x0081;
    const LINK_RETRY_CODE: u16 = 0x0082;
    const LINK_TIMEOUT_CODE: u16 = 0x0083;
    const HEARTBEAT_CODE: u16 = 0x0090;
    const LOG_CLEARED_CODE: u16 = 0x0091;
    const QUEUE_DISCONNECTED_CODE: u16 = 0x0092;
    const FATAL_HALT_CODE: u16 = 0x00F0;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            OtaEventKind::ProbationBoot => Self::PROBATION_BOOT_CODE,
            OtaEventKind::StableBoot => Self::STABLE_BOOT_CODE,
            OtaEventKind::CounterSanitized => Self::COUNTER_SANITIZED_CODE,
            OtaEventKind::RollbackCommitted(slot) => Self::ROLLBACK_BASE + slot_index(slot),
            OtaEventKind::SafeModeEntered => Self::SAFE_MODE_ENTERED_CODE,
            OtaEventKind::SafeModeState(state) => Self::SAFE_MODE_STATE_BASE + state.index(),
            OtaEventKind::ServiceStarted => Self::SERVICE_STARTED_CODE,
            OtaEventKind::ServiceStopped => Self::SERVICE_STOPPED_CODE,
            OtaEventKind::ServiceStartFailed => Self::SERVICE_START_FAILED_CODE,
            OtaEventKind::CommandAccepted(command) => Self::COMMAND_ACCEPTED_BASE + command.index(),
            OtaEventKind::CommandRejected(command) => Self::COMMAND_REJECTED_BASE + command.index(),
            OtaEventKind::CommandIgnored(command) => Self::COMMAND_IGNORED_BASE + command.index(),
            OtaEventKind::UnknownOpcode => Self::UNKNOWN_OPCODE_CODE,
            OtaEventKind::TransferStarted => Self::TRANSFER_STARTED_CODE,
            OtaEventKind::TransferCompleted => Self::TRANSFER_COMPLETED_CODE,
            OtaEventKind::TransferFailed => Self::TRANSFER_FAILED_CODE,
            OtaEventKind::TransferPersistFailed => Self::TRANSFER_PERSIST_FAILED_CODE,
            OtaEventKind::LinkUp => Self::LINK_UP_CODE,
            OtaEventKind::LinkLost => Self::LINK_LOST_CODE,
            OtaEventKind::LinkRetry => Self::LINK_RETRY_CODE,
            OtaEventKind::LinkTimeout => Self::LINK_TIMEOUT_CODE,
            OtaEventKind::Heartbeat => Self::HEARTBEAT_CODE,
            OtaEventKind::LogCleared => Self::LOG_CLEARED_CODE,
            OtaEventKind::QueueDisconnected => Self::QUEUE_DISCONNECTED_CODE,
            OtaEventKind::FatalHalt => Self::FATAL_HALT_CODE,
            OtaEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant into an event, falling back to [`OtaEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::PROBATION_BOOT_CODE => OtaEventKind::ProbationBoot,
            Self::STABLE_BOOT_CODE => OtaEventKind::StableBoot,
            Self::COUNTER_SANITIZED_CODE => OtaEventKind::CounterSanitized,
            Self::SAFE_MODE_ENTERED_CODE => OtaEventKind::SafeModeEntered,
            Self::SERVICE_STARTED_CODE => OtaEventKind::ServiceStarted,
            Self::SERVICE_STOPPED_CODE => OtaEventKind::ServiceStopped,
            Self::SERVICE_START_FAILED_CODE => OtaEventKind::ServiceStartFailed,
            Self::UNKNOWN_OPCODE_CODE => OtaEventKind::UnknownOpcode,
            Self::TRANSFER_STARTED_CODE => OtaEventKind::TransferStarted,
            Self::TRANSFER_COMPLETED_CODE => OtaEventKind::TransferCompleted,
            Self::TRANSFER_FAILED_CODE => OtaEventKind::TransferFailed,
            Self::TRANSFER_PERSIST_FAILED_CODE => OtaEventKind::TransferPersistFailed,
            Self::LINK_UP_CODE => OtaEventKind::LinkUp,
            Self::LINK_LOST_CODE => OtaEventKind::LinkLost,
            Self::LINK_RETRY_CODE => OtaEventKind::LinkRetry,
            Self::LINK_TIMEOUT_CODE => OtaEventKind::LinkTimeout,
            Self::HEARTBEAT_CODE => OtaEventKind::Heartbeat,
            Self::LOG_CLEARED_CODE => OtaEventKind::LogCleared,
            Self::QUEUE_DISCONNECTED_CODE => OtaEventKind::QueueDisconnected,
            Self::FATAL_HALT_CODE => OtaEventKind::FatalHalt,
            value if (Self::ROLLBACK_BASE..Self::ROLLBACK_BASE + 2).contains(&value) => {
                u8::try_from(value - Self::ROLLBACK_BASE)
                    .ok()
                    .and_then(SlotId::from_raw)
                    .map_or(OtaEventKind::Custom(value), OtaEventKind::RollbackCommitted)
            }
            value if (Self::SAFE_MODE_STATE_BASE..Self::SAFE_MODE_STATE_BASE + 2).contains(&value) => {
                SafeModeState::from_index(value - Self::SAFE_MODE_STATE_BASE)
                    .map_or(OtaEventKind::Custom(value), OtaEventKind::SafeModeState)
            }
            value => decode_command_event(value),
        }
    }
}

const fn slot_index(slot: SlotId) -> u16 {
    match slot {
        SlotId::A => 0,
        SlotId::B => 1,
    }
}

fn decode_command_event(value: u16) -> OtaEventKind {
    let (base, wrap): (u16, fn(RemoteCommand) -> OtaEventKind) = match value {
        0x0040..0x0050 => (OtaEventKind::COMMAND_ACCEPTED_BASE, OtaEventKind::CommandAccepted),
        0x0050..0x0060 => (OtaEventKind::COMMAND_REJECTED_BASE, OtaEventKind::CommandRejected),
        0x0060..0x006F => (OtaEventKind::COMMAND_IGNORED_BASE, OtaEventKind::CommandIgnored),
        _ => return OtaEventKind::Custom(value),
    };
    RemoteCommand::from_index(value - base).map_or(OtaEventKind::Custom(value), wrap)
}

/// Payloads carried alongside events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Raw test-boot counter as read from storage.
    Counter { raw: i8 },
    /// Reset cause attached to boot and safe-mode events.
    Reset(ResetReason),
    /// Why a command was refused.
    Rejection(CommandRejection),
    /// Unrecognized command opcode.
    Opcode(u16),
    /// Transfer error reported by the upload collaborator.
    Transfer(TransferErrorCode),
    /// Persist failure detail.
    Store(StoreError),
    /// Update service failure detail.
    Service(ServiceError),
    /// Link state with the number of association attempts so far.
    Link { status: LinkStatus, attempts: u32 },
    /// Time since boot.
    Uptime(Duration),
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

impl fmt::Display for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryPayload::None => Ok(()),
            TelemetryPayload::Counter { raw } => write!(f, "counter={raw}"),
            TelemetryPayload::Reset(reason) => write!(f, "reset={reason}"),
            TelemetryPayload::Rejection(reason) => write!(f, "reason={reason}"),
            TelemetryPayload::Opcode(opcode) => write!(f, "opcode=0x{opcode:04x}"),
            TelemetryPayload::Transfer(code) => write!(f, "transfer={code}"),
            TelemetryPayload::Store(err) => write!(f, "store={err}"),
            TelemetryPayload::Service(err) => write!(f, "service={err}"),
            TelemetryPayload::Link { status, attempts } => {
                write!(f, "link={status} attempts={attempts}")
            }
            TelemetryPayload::Uptime(elapsed) => write!(f, "uptime={}s", elapsed.as_secs()),
        }
    }
}

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: OtaEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Drops every stored record. Event ids keep increasing.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: OtaEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }

    /// Records the outcome of a remote command.
    pub fn record_command(
        &mut self,
        command: RemoteCommand,
        result: Result<(), CommandRejection>,
        timestamp: TInstant,
    ) -> EventId {
        match result {
            Ok(()) => self.record(
                OtaEventKind::CommandAccepted(command),
                TelemetryPayload::none(),
                timestamp,
            ),
            Err(reason) => self.record(
                OtaEventKind::CommandRejected(command),
                TelemetryPayload::Rejection(reason),
                timestamp,
            ),
        }
    }

    /// Counts records matching `event`.
    pub fn count(&self, event: OtaEventKind) -> usize {
        self.oldest_first()
            .filter(|record| record.event == event)
            .count()
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
    struct MicrosInstant(u64);

    impl TelemetryInstant for MicrosInstant {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_micros(self.0.saturating_sub(earlier.0))
        }
    }

    #[test]
    fn event_codes_round_trip() {
        let fixtures = [
            OtaEventKind::ProbationBoot,
            OtaEventKind::RollbackCommitted(SlotId::B),
            OtaEventKind::SafeModeState(SafeModeState::ServingUpdates),
            OtaEventKind::CommandAccepted(RemoteCommand::Validate),
            OtaEventKind::CommandRejected(RemoteCommand::ResetDiagnosticLog),
            OtaEventKind::CommandIgnored(RemoteCommand::Rollback),
            OtaEventKind::TransferPersistFailed,
            OtaEventKind::LinkTimeout,
            OtaEventKind::FatalHalt,
        ];

        for event in fixtures {
            assert_eq!(OtaEventKind::from_raw(event.to_raw()), event, "{event}");
        }
        assert_eq!(OtaEventKind::from_raw(0x004F), OtaEventKind::Custom(0x004F));
        assert_eq!(OtaEventKind::from_raw(0x1234), OtaEventKind::Custom(0x1234));
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut recorder = TelemetryRecorder::<MicrosInstant, 2>::new();
        recorder.record(OtaEventKind::LinkUp, TelemetryPayload::none(), MicrosInstant(1));
        recorder.record(OtaEventKind::LinkLost, TelemetryPayload::none(), MicrosInstant(2));
        let id = recorder.record(OtaEventKind::LinkRetry, TelemetryPayload::none(), MicrosInstant(3));

        assert_eq!(id, 2);
        assert_eq!(recorder.len(), 2);
        let events: heapless::Vec<OtaEventKind, 2> =
            recorder.oldest_first().map(|record| record.event).collect();
        assert_eq!(events.as_slice(), &[OtaEventKind::LinkLost, OtaEventKind::LinkRetry]);
    }

    #[test]
    fn clear_keeps_event_ids_monotonic() {
        let mut recorder = TelemetryRecorder::<MicrosInstant>::new();
        recorder.record(OtaEventKind::Heartbeat, TelemetryPayload::none(), MicrosInstant(1));
        recorder.clear();
        assert!(recorder.is_empty());

        let id = recorder.record(OtaEventKind::LogCleared, TelemetryPayload::none(), MicrosInstant(2));
        assert_eq!(id, 1);
        assert_eq!(recorder.latest().map(|record| record.event), Some(OtaEventKind::LogCleared));
    }

    #[test]
    fn records_command_rejections_with_reason() {
        let mut recorder = TelemetryRecorder::<MicrosInstant>::new();
        recorder.record_command(
            RemoteCommand::Validate,
            Err(CommandRejection::NotOnProbation),
            MicrosInstant(5),
        );

        let record = recorder.latest().copied().expect("record stored");
        assert_eq!(record.event, OtaEventKind::CommandRejected(RemoteCommand::Validate));
        assert_eq!(
            record.details,
            TelemetryPayload::Rejection(CommandRejection::NotOnProbation)
        );
        assert_eq!(recorder.count(OtaEventKind::CommandRejected(RemoteCommand::Validate)), 1);
    }

    #[test]
    fn payloads_render_as_key_value_pairs() {
        let mut text = heapless::String::<48>::new();
        core::fmt::write(
            &mut text,
            format_args!(
                "{} {}",
                TelemetryPayload::Link {
                    status: LinkStatus::Connecting,
                    attempts: 2
                },
                TelemetryPayload::Opcode(0x1234)
            ),
        )
        .expect("fits");
        assert_eq!(text.as_str(), "link=connecting attempts=2 opcode=0x1234");
    }
}

//! Composition root driving the coordinator from a cooperative tick.
//!
//! The platform calls [`Supervisor::boot`] once and then [`Supervisor::tick`]
//! every [`SERVICE_POLL_INTERVAL`]. Each tick advances network association,
//! drains the event queue one item at a time and records what happened. A
//! returned [`DeviceAction::Restart`] must be honoured before the next tick.

use core::{ops::Add, time::Duration};

use crate::command::RemoteCommand;
use crate::coordinator::{
    BootDecision, CommandError, CommandRejection, FatalError, RollbackCoordinator, ServiceStartup,
    TransferOutcome,
};
use crate::events::{DeviceEvent, EventQueueConsumer};
use crate::link::{LinkEvent, NetworkLink, ReconnectScheduler};
use crate::partition::{PartitionOracle, SlotId};
use crate::reset::ResetClassifier;
use crate::safe_mode::SafeModeLoop;
use crate::status::{ModeSummary, StatusSnapshot};
use crate::store::{StateStore, TestCounter};
use crate::telemetry::{
    OtaEventKind, TELEMETRY_RING_CAPACITY, TelemetryInstant, TelemetryPayload, TelemetryRecorder,
};
use crate::transfer::{TransferEvent, UpdateService};

pub use crate::link::{ASSOCIATION_TIMEOUT, RECONNECT_INTERVAL};

/// Cadence at which the platform should call [`Supervisor::tick`].
pub const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Interval between heartbeat records in normal mode.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Side effect the platform must carry out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceAction {
    Restart,
}

/// Current run mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunMode {
    Booting,
    Normal,
    SafeMode(SafeModeLoop),
    PendingRestart,
}

/// Summary of the boot decision handed to the platform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootReport {
    pub decision: BootDecision,
    pub slot: SlotId,
    pub counter: TestCounter,
    /// Out-of-range raw counter that was treated as validated.
    pub corrupted_raw: Option<i8>,
    /// Update service outcome on the normal path.
    pub service: Option<ServiceStartup>,
}

impl BootReport {
    /// Action the platform must take before continuing, if any.
    #[must_use]
    pub const fn action(&self) -> Option<DeviceAction> {
        match self.decision {
            BootDecision::Rollback { .. } => Some(DeviceAction::Restart),
            _ => None,
        }
    }
}

/// Owns the coordinator, network link, event queue and diagnostics ring.
pub struct Supervisor<S, P, R, U, L, Q, I, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    I: Copy,
{
    coordinator: RollbackCoordinator<S, P, R, U>,
    link: L,
    queue: Q,
    scheduler: ReconnectScheduler<I>,
    telemetry: TelemetryRecorder<I, CAPACITY>,
    mode: RunMode,
    booted_at: Option<I>,
    next_heartbeat: Option<I>,
    queue_disconnected: bool,
}

impl<S, P, R, U, L, Q, I, const CAPACITY: usize> Supervisor<S, P, R, U, L, Q, I, CAPACITY>
where
    S: StateStore,
    P: PartitionOracle,
    R: ResetClassifier,
    U: UpdateService,
    L: NetworkLink,
    Q: EventQueueConsumer,
    I: Copy + Ord + Add<Duration, Output = I> + TelemetryInstant,
{
    pub fn new(coordinator: RollbackCoordinator<S, P, R, U>, link: L, queue: Q) -> Self {
        Self {
            coordinator,
            link,
            queue,
            scheduler: ReconnectScheduler::new(),
            telemetry: TelemetryRecorder::new(),
            mode: RunMode::Booting,
            booted_at: None,
            next_heartbeat: None,
            queue_disconnected: false,
        }
    }

    /// Runs the boot decision and performs normal startup or safe-mode entry.
    pub fn boot(&mut self, now: I) -> Result<BootReport, FatalError> {
        let decision = match self.coordinator.boot() {
            Ok(decision) => decision,
            Err(err) => return Err(self.halt(err, now)),
        };

        if let Some(raw) = self.coordinator.corrupted_raw() {
            self.telemetry.record(
                OtaEventKind::CounterSanitized,
                TelemetryPayload::Counter { raw },
                now,
            );
        }

        let mut service = None;
        match decision {
            BootDecision::Rollback { next } => {
                self.telemetry.record(
                    OtaEventKind::RollbackCommitted(next),
                    TelemetryPayload::none(),
                    now,
                );
                self.mode = RunMode::PendingRestart;
            }
            BootDecision::SafeMode { reason } => {
                let safe = match SafeModeLoop::enter(&mut self.coordinator, reason) {
                    Ok(safe) => safe,
                    Err(err) => return Err(self.halt(err, now)),
                };
                self.telemetry.record(
                    OtaEventKind::SafeModeEntered,
                    TelemetryPayload::Reset(reason),
                    now,
                );
                self.telemetry
                    .record(OtaEventKind::ServiceStarted, TelemetryPayload::none(), now);
                self.mode = RunMode::SafeMode(safe);
            }
            BootDecision::Normal { counter, reason } => {
                let kind = if counter.is_testing() {
                    OtaEventKind::ProbationBoot
                } else {
                    OtaEventKind::StableBoot
                };
                self.telemetry
                    .record(kind, TelemetryPayload::Reset(reason), now);

                let startup = self.coordinator.start_configured_service();
                match startup {
                    ServiceStartup::Started => {
                        self.telemetry.record(
                            OtaEventKind::ServiceStarted,
                            TelemetryPayload::none(),
                            now,
                        );
                    }
                    ServiceStartup::Failed(err) => {
                        self.telemetry.record(
                            OtaEventKind::ServiceStartFailed,
                            TelemetryPayload::Service(err),
                            now,
                        );
                    }
                    ServiceStartup::Disabled => {}
                }
                service = Some(startup);
                self.mode = RunMode::Normal;
                self.next_heartbeat = Some(now + HEARTBEAT_INTERVAL);
            }
        }
        self.booted_at = Some(now);

        Ok(BootReport {
            decision,
            slot: self.coordinator.current_slot(),
            counter: self.coordinator.counter().unwrap_or(TestCounter::Validated),
            corrupted_raw: self.coordinator.corrupted_raw(),
            service,
        })
    }

    /// Advances association, drains queued events and emits heartbeats.
    pub fn tick(&mut self, now: I) -> Option<DeviceAction> {
        if matches!(self.mode, RunMode::Booting | RunMode::PendingRestart) {
            return None;
        }

        if let Some(event) = self.scheduler.poll(&mut self.link, now) {
            self.record_link(event, now);
        }

        let link_up = self.scheduler.is_up();
        if let RunMode::SafeMode(safe) = &mut self.mode {
            if let Some(state) = safe.on_link(link_up) {
                self.telemetry.record(
                    OtaEventKind::SafeModeState(state),
                    TelemetryPayload::none(),
                    now,
                );
            }
        }

        loop {
            match self.queue.try_dequeue() {
                Ok(Some(event)) => {
                    if let Some(action) = self.handle_event(event, now) {
                        return Some(action);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if !self.queue_disconnected {
                        self.queue_disconnected = true;
                        self.telemetry.record(
                            OtaEventKind::QueueDisconnected,
                            TelemetryPayload::none(),
                            now,
                        );
                    }
                    break;
                }
            }
        }

        self.heartbeat(now);
        None
    }

    /// Handles a single event outside the tick loop.
    pub fn handle_event(&mut self, event: DeviceEvent, now: I) -> Option<DeviceAction> {
        match event {
            DeviceEvent::Command(command) => self.handle_command(command, now),
            DeviceEvent::UnknownOpcode(opcode) => {
                self.telemetry.record(
                    OtaEventKind::UnknownOpcode,
                    TelemetryPayload::Opcode(opcode),
                    now,
                );
                None
            }
            DeviceEvent::Transfer(event) => self.handle_transfer(event, now),
        }
    }

    fn handle_command(&mut self, command: RemoteCommand, now: I) -> Option<DeviceAction> {
        match self.mode {
            RunMode::Normal => {}
            RunMode::SafeMode(_) => {
                self.telemetry.record(
                    OtaEventKind::CommandIgnored(command),
                    TelemetryPayload::Rejection(CommandRejection::SafeMode),
                    now,
                );
                return None;
            }
            RunMode::Booting | RunMode::PendingRestart => {
                self.telemetry.record(
                    OtaEventKind::CommandIgnored(command),
                    TelemetryPayload::Rejection(CommandRejection::NotBooted),
                    now,
                );
                return None;
            }
        }

        let was_running = self.coordinator.service_running();
        let result = match command {
            RemoteCommand::Restart => {
                self.telemetry.record_command(command, Ok(()), now);
                self.mode = RunMode::PendingRestart;
                return Some(DeviceAction::Restart);
            }
            RemoteCommand::ResetDiagnosticLog => {
                self.telemetry.clear();
                self.telemetry
                    .record(OtaEventKind::LogCleared, TelemetryPayload::none(), now);
                return None;
            }
            RemoteCommand::Validate => self.coordinator.validate(),
            RemoteCommand::Rollback => self.coordinator.rollback().map(|_| ()),
            RemoteCommand::StartUpdateService => self.coordinator.start_update_service(),
            RemoteCommand::StopUpdateService => self.coordinator.stop_update_service(),
        };

        // A command can change the service state and still fail to persist.
        match (was_running, self.coordinator.service_running()) {
            (false, true) => {
                self.telemetry
                    .record(OtaEventKind::ServiceStarted, TelemetryPayload::none(), now);
            }
            (true, false) => {
                self.telemetry
                    .record(OtaEventKind::ServiceStopped, TelemetryPayload::none(), now);
            }
            _ => {}
        }

        match result {
            Ok(()) => {
                self.telemetry.record_command(command, Ok(()), now);
            }
            Err(CommandError::Rejected(reason)) => {
                self.telemetry.record_command(command, Err(reason), now);
            }
            Err(err) => {
                let payload = match err {
                    CommandError::Store(err) => TelemetryPayload::Store(err),
                    CommandError::Service(err) => TelemetryPayload::Service(err),
                    CommandError::Rollback(_) | CommandError::Rejected(_) => {
                        TelemetryPayload::none()
                    }
                };
                self.telemetry
                    .record(OtaEventKind::CommandRejected(command), payload, now);
            }
        }
        None
    }

    fn handle_transfer(&mut self, event: TransferEvent, now: I) -> Option<DeviceAction> {
        match self.coordinator.on_transfer(event) {
            TransferOutcome::InProgress => {
                self.telemetry
                    .record(OtaEventKind::TransferStarted, TelemetryPayload::none(), now);
                None
            }
            TransferOutcome::Restart => {
                self.telemetry.record(
                    OtaEventKind::TransferCompleted,
                    TelemetryPayload::none(),
                    now,
                );
                self.mode = RunMode::PendingRestart;
                Some(DeviceAction::Restart)
            }
            TransferOutcome::PersistFailed(err) => {
                self.telemetry.record(
                    OtaEventKind::TransferPersistFailed,
                    TelemetryPayload::Store(err),
                    now,
                );
                None
            }
            TransferOutcome::Aborted(code) => {
                self.telemetry.record(
                    OtaEventKind::TransferFailed,
                    TelemetryPayload::Transfer(code),
                    now,
                );
                None
            }
        }
    }

    fn record_link(&mut self, event: LinkEvent, now: I) {
        let kind = match event {
            LinkEvent::Associated => OtaEventKind::LinkUp,
            LinkEvent::Lost => OtaEventKind::LinkLost,
            LinkEvent::Retrying { .. } => OtaEventKind::LinkRetry,
            LinkEvent::TimedOut => OtaEventKind::LinkTimeout,
        };
        self.telemetry.record(
            kind,
            TelemetryPayload::Link {
                status: self.link.status(),
                attempts: self.scheduler.attempts(),
            },
            now,
        );
    }

    fn heartbeat(&mut self, now: I) {
        if self.mode != RunMode::Normal || self.coordinator.transfer_active() {
            return;
        }
        let (Some(due), Some(booted_at)) = (self.next_heartbeat, self.booted_at) else {
            return;
        };
        if now < due {
            return;
        }
        self.telemetry.record(
            OtaEventKind::Heartbeat,
            TelemetryPayload::Uptime(now.saturating_duration_since(booted_at)),
            now,
        );
        self.next_heartbeat = Some(now + HEARTBEAT_INTERVAL);
    }

    fn halt(&mut self, err: FatalError, now: I) -> FatalError {
        self.telemetry
            .record(OtaEventKind::FatalHalt, TelemetryPayload::none(), now);
        err
    }

    /// Captures the current state for status output.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            counter: self.coordinator.counter(),
            reset_reason: self.coordinator.reset_reason(),
            slot: self.coordinator.current_slot(),
            mode: self.mode_summary(),
            service_running: self.coordinator.service_running(),
            service_enabled: self.coordinator.service_enabled(),
            transfer_active: self.coordinator.transfer_active(),
            link: self.link.status(),
            link_attempts: self.scheduler.attempts(),
        }
    }

    #[must_use]
    pub fn mode_summary(&self) -> ModeSummary {
        match self.mode {
            RunMode::Booting => ModeSummary::Booting,
            RunMode::Normal => ModeSummary::Normal,
            RunMode::SafeMode(safe) => ModeSummary::SafeMode(safe.state()),
            RunMode::PendingRestart => ModeSummary::PendingRestart,
        }
    }

    #[must_use]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn coordinator(&self) -> &RollbackCoordinator<S, P, R, U> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut RollbackCoordinator<S, P, R, U> {
        &mut self.coordinator
    }

    pub fn telemetry(&self) -> &TelemetryRecorder<I, CAPACITY> {
        &self.telemetry
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// Releases the owned collaborators.
    pub fn into_parts(self) -> (RollbackCoordinator<S, P, R, U>, L, Q) {
        (self.coordinator, self.link, self.queue)
    }
}

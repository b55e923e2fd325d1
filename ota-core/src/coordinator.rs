//! Boot-time probation logic and the commands that change it.
//!
//! [`RollbackCoordinator`] owns the persisted store, the partition oracle,
//! the reset classifier and the update service. It runs the boot decision
//! exactly once and then answers commands and transfer notifications. The
//! counter is only ever written by three paths: the boot decrement, a
//! successful validate, and a completed transfer.

use core::fmt;

use crate::partition::{PartitionOracle, RollbackError, SlotId, request_rollback};
use crate::reset::{ResetClassifier, ResetReason};
use crate::store::{StateStore, StoreError, TestCounter, VALIDATED_RAW};
use crate::transfer::{ServiceError, ServiceIdentity, TransferErrorCode, TransferEvent, UpdateService};

/// Probation length used when the configuration does not set one.
pub const DEFAULT_PROBATION_BOOTS: u8 = 3;

/// Largest probation length accepted from configuration.
pub const MAX_PROBATION_BOOTS: u8 = 100;

/// Static settings injected at construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoordinatorSettings {
    /// Test boots granted to a freshly transferred image.
    pub probation_boots: u8,
    pub identity: ServiceIdentity,
}

/// Outcome of the boot decision procedure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDecision {
    /// Continue with normal startup.
    Normal { counter: TestCounter, reason: ResetReason },
    /// Probation ran out; the alternate slot is armed and the device must restart.
    Rollback { next: SlotId },
    /// A validated image crashed; serve updates only.
    SafeMode { reason: ResetReason },
}

/// Errors that leave the device unable to continue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FatalError {
    /// The boot decrement could not be persisted.
    CounterPersist(StoreError),
    /// Probation ran out and the rollback could not be armed.
    Rollback(RollbackError),
    /// Safe mode could not start the update service.
    SafeModeService(ServiceError),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::CounterPersist(err) => write!(f, "counter persist failed: {err}"),
            FatalError::Rollback(err) => write!(f, "rollback failed: {err}"),
            FatalError::SafeModeService(err) => {
                write!(f, "safe mode update service failed: {err}")
            }
        }
    }
}

/// Precondition that refused a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandRejection {
    /// A firmware transfer is in progress.
    TransferInProgress,
    /// The running image is not on probation.
    NotOnProbation,
    /// The boot decision has not run yet.
    NotBooted,
    /// Safe mode only serves firmware uploads.
    SafeMode,
}

impl fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandRejection::TransferInProgress => "transfer in progress",
            CommandRejection::NotOnProbation => "firmware is not on probation",
            CommandRejection::NotBooted => "boot decision pending",
            CommandRejection::SafeMode => "safe mode",
        };
        f.write_str(label)
    }
}

/// Error surfaced by coordinator commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    Rejected(CommandRejection),
    Store(StoreError),
    Rollback(RollbackError),
    Service(ServiceError),
}

impl From<CommandRejection> for CommandError {
    fn from(value: CommandRejection) -> Self {
        CommandError::Rejected(value)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Rejected(reason) => write!(f, "rejected: {reason}"),
            CommandError::Store(err) => write!(f, "persist failed: {err}"),
            CommandError::Rollback(err) => write!(f, "rollback failed: {err}"),
            CommandError::Service(err) => write!(f, "update service: {err}"),
        }
    }
}

/// What the platform must do after a transfer notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferOutcome {
    /// Transfer is under way.
    InProgress,
    /// New image committed on probation; restart into it.
    Restart,
    /// Image arrived but the probation counter could not be written.
    PersistFailed(StoreError),
    /// Transfer aborted; nothing persisted changed.
    Aborted(TransferErrorCode),
}

/// Outcome of starting the configured update service during normal startup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceStartup {
    Started,
    Disabled,
    Failed(ServiceError),
}

/// Probation state machine with injected platform collaborators.
pub struct RollbackCoordinator<S, P, R, U> {
    store: S,
    partitions: P,
    resets: R,
    service: U,
    settings: CoordinatorSettings,
    counter: Option<TestCounter>,
    corrupted_raw: Option<i8>,
    reset_reason: Option<ResetReason>,
    transfer_active: bool,
}

impl<S, P, R, U> RollbackCoordinator<S, P, R, U>
where
    S: StateStore,
    P: PartitionOracle,
    R: ResetClassifier,
    U: UpdateService,
{
    pub fn new(store: S, partitions: P, resets: R, service: U, settings: CoordinatorSettings) -> Self {
        Self {
            store,
            partitions,
            resets,
            service,
            settings,
            counter: None,
            corrupted_raw: None,
            reset_reason: None,
            transfer_active: false,
        }
    }

    /// Runs the boot decision procedure.
    ///
    /// Must be called exactly once, before any command or transfer event.
    pub fn boot(&mut self) -> Result<BootDecision, FatalError> {
        let raw = self.store.read_raw_counter();
        let mut sanitized = TestCounter::from_raw(raw, MAX_PROBATION_BOOTS);
        // The image that wrote the counter may have granted more test boots
        // than this one allows.
        if let TestCounter::Probation(remaining) = sanitized.counter {
            sanitized.counter = TestCounter::Probation(remaining.min(self.settings.probation_boots));
        }
        self.counter = Some(sanitized.counter);
        self.corrupted_raw = sanitized.corrupted;

        if let Some(next_raw) = sanitized.counter.decremented() {
            self.store
                .write_raw_counter(next_raw)
                .map_err(FatalError::CounterPersist)?;
        }

        if sanitized.counter == TestCounter::Probation(0) {
            let next = request_rollback(&mut self.partitions).map_err(FatalError::Rollback)?;
            return Ok(BootDecision::Rollback { next });
        }

        let reason = self.resets.last_reset_reason();
        self.reset_reason = Some(reason);

        if sanitized.counter == TestCounter::Validated && reason.is_critical() {
            return Ok(BootDecision::SafeMode { reason });
        }

        Ok(BootDecision::Normal {
            counter: sanitized.counter,
            reason,
        })
    }

    /// Starts the update service if the persisted flag asks for it.
    pub fn start_configured_service(&mut self) -> ServiceStartup {
        if !self.store.read_update_service() {
            return ServiceStartup::Disabled;
        }
        match self.ensure_service_running() {
            Ok(()) => ServiceStartup::Started,
            Err(err) => ServiceStartup::Failed(err),
        }
    }

    /// Starts the update service without touching the persisted flag.
    pub fn ensure_service_running(&mut self) -> Result<(), ServiceError> {
        if self.service.is_running() {
            return Ok(());
        }
        self.service.start(&self.settings.identity)
    }

    /// Accepts the running image as stable.
    pub fn validate(&mut self) -> Result<(), CommandError> {
        self.ensure_testing()?;
        self.store
            .write_raw_counter(VALIDATED_RAW)
            .map_err(CommandError::Store)?;
        self.counter = Some(TestCounter::Validated);
        Ok(())
    }

    /// Arms the alternate slot for the next boot. Does not restart.
    pub fn rollback(&mut self) -> Result<SlotId, CommandError> {
        self.ensure_testing()?;
        request_rollback(&mut self.partitions).map_err(CommandError::Rollback)
    }

    /// Starts the update service and persists the enabled flag.
    pub fn start_update_service(&mut self) -> Result<(), CommandError> {
        self.ensure_idle()?;
        self.ensure_service_running().map_err(CommandError::Service)?;
        self.store
            .write_update_service(true)
            .map_err(CommandError::Store)
    }

    /// Stops the update service and persists the disabled flag.
    pub fn stop_update_service(&mut self) -> Result<(), CommandError> {
        self.ensure_idle()?;
        if self.service.is_running() {
            self.service.stop();
        }
        self.store
            .write_update_service(false)
            .map_err(CommandError::Store)
    }

    /// Applies a transfer notification.
    pub fn on_transfer(&mut self, event: TransferEvent) -> TransferOutcome {
        match event {
            TransferEvent::Started => {
                self.transfer_active = true;
                TransferOutcome::InProgress
            }
            TransferEvent::Completed => {
                self.transfer_active = false;
                let raw = TestCounter::Probation(self.settings.probation_boots).to_raw();
                match self.store.write_raw_counter(raw) {
                    Ok(()) => TransferOutcome::Restart,
                    Err(err) => TransferOutcome::PersistFailed(err),
                }
            }
            TransferEvent::Failed(code) => {
                self.transfer_active = false;
                TransferOutcome::Aborted(code)
            }
        }
    }

    fn ensure_booted(&self) -> Result<TestCounter, CommandRejection> {
        self.counter.ok_or(CommandRejection::NotBooted)
    }

    fn ensure_idle(&self) -> Result<(), CommandRejection> {
        self.ensure_booted()?;
        if self.transfer_active {
            return Err(CommandRejection::TransferInProgress);
        }
        Ok(())
    }

    fn ensure_testing(&self) -> Result<(), CommandRejection> {
        self.ensure_idle()?;
        if !self.ensure_booted()?.is_testing() {
            return Err(CommandRejection::NotOnProbation);
        }
        Ok(())
    }

    /// Counter as interpreted at boot, updated by a successful validate.
    #[must_use]
    pub fn counter(&self) -> Option<TestCounter> {
        self.counter
    }

    /// Out-of-range raw counter replaced at boot, if any.
    #[must_use]
    pub fn corrupted_raw(&self) -> Option<i8> {
        self.corrupted_raw
    }

    #[must_use]
    pub fn reset_reason(&self) -> Option<ResetReason> {
        self.reset_reason
    }

    #[must_use]
    pub fn transfer_active(&self) -> bool {
        self.transfer_active
    }

    #[must_use]
    pub fn service_running(&self) -> bool {
        self.service.is_running()
    }

    #[must_use]
    pub fn service_enabled(&self) -> bool {
        self.store.read_update_service()
    }

    #[must_use]
    pub fn current_slot(&self) -> SlotId {
        self.partitions.current_slot()
    }

    #[must_use]
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn partitions(&self) -> &P {
        &self.partitions
    }

    pub fn partitions_mut(&mut self) -> &mut P {
        &mut self.partitions
    }

    pub fn service(&self) -> &U {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut U {
        &mut self.service
    }

    /// Releases the collaborators, e.g. to simulate a restart on the host.
    pub fn into_parts(self) -> (S, P, R, U) {
        (self.store, self.partitions, self.resets, self.service)
    }
}

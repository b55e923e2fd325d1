mod common;

use common::{
    MockInstant, MockLink, PROBATION_BOOTS, coordinator, power_cycle, supervisor,
};
use ota_core::command::RemoteCommand;
use ota_core::coordinator::{BootDecision, CommandError, CommandRejection, TransferOutcome};
use ota_core::events::{DeviceEvent, EventQueueProducer};
use ota_core::partition::SlotId;
use ota_core::reset::ResetReason;
use ota_core::store::{NvError, StateStore, StoreError, TestCounter};
use ota_core::supervisor::{DeviceAction, RunMode};
use ota_core::telemetry::{OtaEventKind, TelemetryPayload};
use ota_core::transfer::{TransferErrorCode, TransferEvent};

#[test]
fn validate_ends_probation_and_is_not_repeatable() {
    let mut coordinator = coordinator(3, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");
    assert_eq!(coordinator.store().read_raw_counter(), 2);

    coordinator.validate().expect("validate on probation");
    assert_eq!(coordinator.store().read_raw_counter(), -1);
    assert_eq!(coordinator.counter(), Some(TestCounter::Validated));

    assert_eq!(
        coordinator.validate(),
        Err(CommandError::Rejected(CommandRejection::NotOnProbation))
    );

    let mut rebooted = power_cycle(coordinator, ResetReason::PowerOn);
    assert_eq!(
        rebooted.boot().expect("boot succeeds"),
        BootDecision::Normal {
            counter: TestCounter::Validated,
            reason: ResetReason::PowerOn,
        }
    );
    assert_eq!(rebooted.partitions().activations(), 0);
}

#[test]
fn commands_before_boot_are_refused() {
    let mut coordinator = coordinator(2, ResetReason::PowerOn);

    assert_eq!(
        coordinator.validate(),
        Err(CommandError::Rejected(CommandRejection::NotBooted))
    );
    assert_eq!(coordinator.store().read_raw_counter(), 2);
}

#[test]
fn completed_transfer_starts_a_fresh_probation() {
    let mut coordinator = coordinator(-1, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");

    assert_eq!(
        coordinator.on_transfer(TransferEvent::Started),
        TransferOutcome::InProgress
    );
    assert!(coordinator.transfer_active());
    assert_eq!(
        coordinator.on_transfer(TransferEvent::Completed),
        TransferOutcome::Restart
    );
    let expected = i8::try_from(PROBATION_BOOTS).expect("fits");
    assert_eq!(coordinator.store().read_raw_counter(), expected);

    coordinator.partitions_mut().stage_update();
    let mut rebooted = power_cycle(coordinator, ResetReason::SoftwareReset);
    assert_eq!(rebooted.current_slot(), SlotId::B);

    assert_eq!(
        rebooted.boot().expect("boot succeeds"),
        BootDecision::Normal {
            counter: TestCounter::Probation(PROBATION_BOOTS),
            reason: ResetReason::SoftwareReset,
        }
    );
    assert_eq!(rebooted.store().read_raw_counter(), expected - 1);
}

#[test]
fn transfer_locks_out_rollback_and_service_changes() {
    let mut coordinator = coordinator(2, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");
    coordinator.start_configured_service();
    coordinator.on_transfer(TransferEvent::Started);

    let state_before = coordinator.store().state();
    let writes_before = coordinator.store().storage().write_count();

    for result in [
        coordinator.rollback().map(|_| ()),
        coordinator.start_update_service(),
        coordinator.stop_update_service(),
        coordinator.validate(),
    ] {
        assert_eq!(
            result,
            Err(CommandError::Rejected(CommandRejection::TransferInProgress))
        );
    }

    assert_eq!(coordinator.store().state(), state_before);
    assert_eq!(coordinator.store().storage().write_count(), writes_before);
    assert_eq!(coordinator.partitions().activations(), 0);
    assert!(coordinator.service_running());
    assert_eq!(coordinator.service().stops, 0);
}

#[test]
fn failed_transfer_releases_the_lock_without_persisting() {
    let mut coordinator = coordinator(-1, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");
    coordinator.on_transfer(TransferEvent::Started);

    assert_eq!(
        coordinator.on_transfer(TransferEvent::Failed(TransferErrorCode::Receive)),
        TransferOutcome::Aborted(TransferErrorCode::Receive)
    );
    assert!(!coordinator.transfer_active());
    assert_eq!(coordinator.store().read_raw_counter(), -1);

    coordinator
        .stop_update_service()
        .expect("stop allowed once idle");
}

#[test]
fn persist_failure_after_transfer_does_not_restart() {
    let mut coordinator = coordinator(-1, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");
    coordinator.on_transfer(TransferEvent::Started);
    coordinator.store_mut().storage_mut().fail_writes(true);

    assert_eq!(
        coordinator.on_transfer(TransferEvent::Completed),
        TransferOutcome::PersistFailed(StoreError::Storage(NvError::Program))
    );
    assert_eq!(coordinator.store().read_raw_counter(), -1);
}

#[test]
fn manual_rollback_arms_alternate_without_touching_counter() {
    let mut coordinator = coordinator(3, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");

    assert_eq!(coordinator.rollback(), Ok(SlotId::B));
    assert_eq!(coordinator.partitions().next_boot(), SlotId::B);
    assert_eq!(coordinator.store().read_raw_counter(), 2);

    let mut validated = common::coordinator(-1, ResetReason::PowerOn);
    validated.boot().expect("boot succeeds");
    assert_eq!(
        validated.rollback(),
        Err(CommandError::Rejected(CommandRejection::NotOnProbation))
    );
}

#[test]
fn service_toggles_are_idempotent_and_persisted() {
    let mut coordinator = coordinator(-1, ResetReason::PowerOn);
    coordinator.boot().expect("boot succeeds");

    coordinator.stop_update_service().expect("stop");
    coordinator.stop_update_service().expect("second stop is a no-op");
    assert!(!coordinator.service_running());
    assert!(!coordinator.service_enabled());

    let mut rebooted = power_cycle(coordinator, ResetReason::PowerOn);
    rebooted.boot().expect("boot succeeds");
    assert_eq!(
        rebooted.start_configured_service(),
        ota_core::coordinator::ServiceStartup::Disabled
    );

    rebooted.start_update_service().expect("start");
    rebooted.start_update_service().expect("second start is a no-op");
    assert_eq!(rebooted.service().starts, 1);
    assert!(rebooted.service_enabled());
}

#[test]
fn supervisor_drains_command_frames_in_order() {
    let mut supervisor = supervisor(coordinator(3, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");

    let queue = supervisor.queue_mut();
    queue
        .push_frame(&RemoteCommand::Validate.encode())
        .expect("enqueue validate");
    queue.push_frame(&[0x34, 0x12]).expect("enqueue unknown");
    queue
        .push_frame(&RemoteCommand::Validate.encode())
        .expect("enqueue second validate");

    assert_eq!(supervisor.tick(MockInstant::millis(20)), None);

    let telemetry = supervisor.telemetry();
    assert_eq!(
        telemetry.count(OtaEventKind::CommandAccepted(RemoteCommand::Validate)),
        1
    );
    let rejected = telemetry
        .oldest_first()
        .find(|record| record.event == OtaEventKind::CommandRejected(RemoteCommand::Validate))
        .copied()
        .expect("second validate rejected");
    assert_eq!(
        rejected.details,
        TelemetryPayload::Rejection(CommandRejection::NotOnProbation)
    );
    let unknown = telemetry
        .oldest_first()
        .find(|record| record.event == OtaEventKind::UnknownOpcode)
        .copied()
        .expect("unknown opcode recorded");
    assert_eq!(unknown.details, TelemetryPayload::Opcode(0x1234));
    assert_eq!(supervisor.coordinator().store().read_raw_counter(), -1);
}

#[test]
fn restart_command_stops_the_drain() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");

    let queue = supervisor.queue_mut();
    queue
        .try_enqueue(DeviceEvent::Transfer(TransferEvent::Started))
        .expect("enqueue transfer");
    queue
        .try_enqueue(RemoteCommand::Restart.into())
        .expect("enqueue restart");
    queue
        .try_enqueue(RemoteCommand::StopUpdateService.into())
        .expect("enqueue stop");

    assert_eq!(
        supervisor.tick(MockInstant::millis(20)),
        Some(DeviceAction::Restart)
    );
    assert_eq!(supervisor.mode(), RunMode::PendingRestart);
    assert!(
        supervisor.coordinator().service_running(),
        "stop after restart never ran"
    );
}

#[test]
fn service_commands_record_state_changes() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");
    assert_eq!(supervisor.telemetry().count(OtaEventKind::ServiceStarted), 1);

    for _ in 0..2 {
        supervisor
            .queue_mut()
            .try_enqueue(RemoteCommand::StopUpdateService.into())
            .expect("enqueue stop");
        supervisor.tick(MockInstant::millis(20));
    }
    let telemetry = supervisor.telemetry();
    assert_eq!(
        telemetry.count(OtaEventKind::CommandAccepted(RemoteCommand::StopUpdateService)),
        2
    );
    assert_eq!(telemetry.count(OtaEventKind::ServiceStopped), 1, "second stop was a no-op");

    supervisor
        .queue_mut()
        .try_enqueue(RemoteCommand::StartUpdateService.into())
        .expect("enqueue start");
    supervisor.tick(MockInstant::millis(40));
    assert_eq!(supervisor.telemetry().count(OtaEventKind::ServiceStarted), 2);

    // The service stops even when the disabled flag cannot be persisted.
    supervisor
        .coordinator_mut()
        .store_mut()
        .storage_mut()
        .fail_writes(true);
    supervisor
        .queue_mut()
        .try_enqueue(RemoteCommand::StopUpdateService.into())
        .expect("enqueue stop");
    supervisor.tick(MockInstant::millis(60));

    assert!(!supervisor.coordinator().service_running());
    let telemetry = supervisor.telemetry();
    assert_eq!(telemetry.count(OtaEventKind::ServiceStopped), 2);
    assert_eq!(
        telemetry.count(OtaEventKind::CommandRejected(RemoteCommand::StopUpdateService)),
        1
    );
}

#[test]
fn completed_transfer_requests_restart() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");

    let queue = supervisor.queue_mut();
    queue
        .try_enqueue(TransferEvent::Started.into())
        .expect("enqueue start");
    queue
        .try_enqueue(TransferEvent::Completed.into())
        .expect("enqueue completion");

    assert_eq!(
        supervisor.tick(MockInstant::millis(20)),
        Some(DeviceAction::Restart)
    );
    assert_eq!(
        supervisor.telemetry().count(OtaEventKind::TransferCompleted),
        1
    );
    assert_eq!(supervisor.coordinator().store().read_raw_counter(), 3);
}

#[test]
fn reset_log_command_clears_diagnostics() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");
    assert!(supervisor.telemetry().len() > 1);

    supervisor
        .queue_mut()
        .push_frame(&RemoteCommand::ResetDiagnosticLog.encode())
        .expect("enqueue");
    supervisor.tick(MockInstant::millis(20));

    assert_eq!(supervisor.telemetry().len(), 1);
    assert_eq!(
        supervisor.telemetry().latest().map(|record| record.event),
        Some(OtaEventKind::LogCleared)
    );
}

#[test]
fn heartbeat_pauses_during_transfer() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::PowerOn), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("boot succeeds");

    supervisor.tick(MockInstant::secs(5));
    assert_eq!(supervisor.telemetry().count(OtaEventKind::Heartbeat), 1);

    supervisor
        .queue_mut()
        .try_enqueue(TransferEvent::Started.into())
        .expect("enqueue");
    supervisor.tick(MockInstant::secs(11));
    assert_eq!(supervisor.telemetry().count(OtaEventKind::Heartbeat), 1);

    let record = supervisor
        .telemetry()
        .oldest_first()
        .find(|record| record.event == OtaEventKind::Heartbeat)
        .copied()
        .expect("heartbeat");
    assert_eq!(
        record.details,
        TelemetryPayload::Uptime(core::time::Duration::from_secs(5))
    );
}

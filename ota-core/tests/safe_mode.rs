mod common;

use common::{MockInstant, MockLink, coordinator, supervisor};
use ota_core::command::RemoteCommand;
use ota_core::coordinator::{BootDecision, CommandRejection, FatalError};
use ota_core::events::EventQueueProducer;
use ota_core::link::LinkStatus;
use ota_core::reset::ResetReason;
use ota_core::safe_mode::SafeModeState;
use ota_core::status::{ModeSummary, StatusFormatter};
use ota_core::store::StateStore;
use ota_core::supervisor::{ASSOCIATION_TIMEOUT, DeviceAction, RECONNECT_INTERVAL, RunMode};
use ota_core::telemetry::{OtaEventKind, TelemetryPayload};
use ota_core::transfer::{ServiceError, TransferEvent};

#[test]
fn crash_on_validated_image_serves_updates_only() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::Watchdog), MockLink::down());

    let report = supervisor.boot(MockInstant::secs(0)).expect("safe mode entered");
    assert_eq!(
        report.decision,
        BootDecision::SafeMode {
            reason: ResetReason::Watchdog
        }
    );
    assert_eq!(report.action(), None);
    assert!(
        supervisor.coordinator().service_running(),
        "safe mode always serves updates"
    );
    assert_eq!(
        supervisor.mode_summary(),
        ModeSummary::SafeMode(SafeModeState::AwaitingLink)
    );

    supervisor
        .queue_mut()
        .push_frame(&RemoteCommand::StopUpdateService.encode())
        .expect("enqueue");
    supervisor.tick(MockInstant::millis(20));

    let ignored = supervisor
        .telemetry()
        .oldest_first()
        .find(|record| record.event == OtaEventKind::CommandIgnored(RemoteCommand::StopUpdateService))
        .copied()
        .expect("command ignored");
    assert_eq!(
        ignored.details,
        TelemetryPayload::Rejection(CommandRejection::SafeMode)
    );
    assert!(supervisor.coordinator().service_running());
    assert_eq!(supervisor.coordinator().partitions().activations(), 0);
}

#[test]
fn safe_mode_follows_the_link() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::Panic), MockLink::down());
    supervisor.boot(MockInstant::secs(0)).expect("safe mode entered");

    supervisor.tick(MockInstant::millis(20));
    assert_eq!(supervisor.link().reconnects, 1);
    assert_eq!(supervisor.link().status, LinkStatus::Connecting);

    supervisor.link_mut().status = LinkStatus::Connected;
    supervisor.tick(MockInstant::millis(40));
    assert_eq!(
        supervisor.mode_summary(),
        ModeSummary::SafeMode(SafeModeState::ServingUpdates)
    );
    assert_eq!(
        supervisor
            .telemetry()
            .count(OtaEventKind::SafeModeState(SafeModeState::ServingUpdates)),
        1
    );

    supervisor.link_mut().status = LinkStatus::Disconnected;
    supervisor.tick(MockInstant::millis(60));
    assert_eq!(
        supervisor.mode_summary(),
        ModeSummary::SafeMode(SafeModeState::AwaitingLink)
    );
    assert_eq!(supervisor.link().reconnects, 2);
}

#[test]
fn association_retries_after_timeout() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::Brownout), MockLink::down());
    let start = MockInstant::secs(0);
    supervisor.boot(start).expect("safe mode entered");

    supervisor.tick(start);
    supervisor.tick(start + ASSOCIATION_TIMEOUT);
    assert_eq!(supervisor.telemetry().count(OtaEventKind::LinkTimeout), 1);
    assert_eq!(supervisor.link().reconnects, 1);

    supervisor.tick(start + ASSOCIATION_TIMEOUT + RECONNECT_INTERVAL);
    assert_eq!(supervisor.link().reconnects, 2);
    assert_eq!(supervisor.status().link_attempts, 2);
}

#[test]
fn upload_in_safe_mode_restarts_into_probation() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::Watchdog), MockLink::connected());
    supervisor.boot(MockInstant::secs(0)).expect("safe mode entered");
    supervisor.tick(MockInstant::millis(20));

    let queue = supervisor.queue_mut();
    queue
        .try_enqueue(TransferEvent::Started.into())
        .expect("enqueue start");
    queue
        .try_enqueue(TransferEvent::Completed.into())
        .expect("enqueue completion");

    assert_eq!(
        supervisor.tick(MockInstant::millis(40)),
        Some(DeviceAction::Restart)
    );
    assert_eq!(supervisor.mode(), RunMode::PendingRestart);
    assert_eq!(supervisor.coordinator().store().read_raw_counter(), 3);
}

#[test]
fn safe_mode_without_update_service_is_fatal() {
    let mut coordinator = coordinator(-1, ResetReason::Watchdog);
    coordinator.service_mut().fail_start = Some(ServiceError::Bind);
    let mut supervisor = supervisor(coordinator, MockLink::down());

    let err = supervisor
        .boot(MockInstant::secs(0))
        .expect_err("no way to receive a fix");

    assert_eq!(err, FatalError::SafeModeService(ServiceError::Bind));
    assert_eq!(
        supervisor.telemetry().latest().map(|record| record.event),
        Some(OtaEventKind::FatalHalt)
    );
}

#[test]
fn safe_mode_ignores_disabled_service_flag() {
    let mut coordinator = coordinator(-1, ResetReason::Watchdog);
    coordinator
        .store_mut()
        .write_update_service(false)
        .expect("disable service");
    let mut supervisor = supervisor(coordinator, MockLink::down());

    supervisor.boot(MockInstant::secs(0)).expect("safe mode entered");

    assert!(supervisor.coordinator().service_running());
    assert!(!supervisor.coordinator().service_enabled());
}

#[test]
fn status_report_describes_safe_mode() {
    let mut supervisor = supervisor(coordinator(-1, ResetReason::Watchdog), MockLink::down());
    supervisor.boot(MockInstant::secs(0)).expect("safe mode entered");
    supervisor.tick(MockInstant::millis(20));

    let snapshot = supervisor.status();
    let mut report = heapless::String::<256>::new();
    StatusFormatter::new(&snapshot)
        .write_all(&mut report, "\n")
        .expect("format");

    assert_eq!(
        report.as_str(),
        "This firmware is validated as stable.\n\
         boot slot=A reset=watchdog mode=safe-mode (awaiting-link)\n\
         service running=true enabled=true transfer=idle\n\
         link connecting attempts=1\n"
    );
}

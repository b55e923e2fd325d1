//! Simulated device: RAM flash, slot table, scripted link and a virtual clock.
//!
//! Storage and the slot table survive restarts; everything else is rebuilt
//! the way RAM is on a real reset.

use std::fmt::Write as _;
use std::io;
use std::mem;
use std::ops::Add;
use std::time::Duration;

use ota_core::config::DeviceConfig;
use ota_core::coordinator::{BootDecision, FatalError, RollbackCoordinator};
use ota_core::events::{EventQueueProducer, LocalEventQueue};
use ota_core::link::{LinkStatus, NetworkLink};
use ota_core::partition::{SlotId, SlotTable};
use ota_core::reset::{FixedReset, ResetReason};
use ota_core::status::{StatusFormatter, StatusSnapshot};
use ota_core::store::{JournalStore, RamStorage, StateStore};
use ota_core::supervisor::{BootReport, DeviceAction, SERVICE_POLL_INTERVAL, Supervisor};
use ota_core::telemetry::{EventId, TelemetryInstant, TelemetryPayload, TelemetryRecord};
use ota_core::transfer::{ServiceError, ServiceIdentity, TransferEvent, UpdateService};
use ota_core::upload::{RamImageSink, UploadHeader, UploadSession};

/// Bytes per simulated journal bank.
pub const SIM_BANK_SIZE: usize = 256;
/// Largest image the simulated slot accepts.
pub const SIM_IMAGE_CAPACITY: usize = 4096;
/// Size of the synthetic image pushed by `upload`.
const SIM_IMAGE_LEN: usize = 1536;
/// Bound on back-to-back restarts triggered by boot itself.
const MAX_CHAINED_BOOTS: usize = 4;
/// Upload packet size, matching the firmware's full-speed bulk endpoint.
const UPDATE_PACKET_LEN: usize = 64;

pub type SimStorage = RamStorage<SIM_BANK_SIZE>;
pub type SimStore = JournalStore<SimStorage>;
pub type SimQueue = LocalEventQueue<16>;
pub type SimCoordinator = RollbackCoordinator<SimStore, SlotTable, FixedReset, SimService>;
pub type SimSupervisor =
    Supervisor<SimStore, SlotTable, FixedReset, SimService, SimLink, SimQueue, SimInstant>;

/// Virtual time in microseconds since the session started.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct SimInstant(u64);

impl SimInstant {
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl TelemetryInstant for SimInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// Link whose availability is set from the REPL.
#[derive(Debug)]
pub struct SimLink {
    available: bool,
    status: LinkStatus,
}

impl SimLink {
    /// An available network associates as soon as the device comes up.
    #[must_use]
    pub const fn new(available: bool) -> Self {
        let status = if available {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        };
        Self { available, status }
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
        self.status = match (available, self.status) {
            (false, _) => LinkStatus::Disconnected,
            (true, LinkStatus::Connecting) => LinkStatus::Connected,
            (true, status) => status,
        };
    }
}

impl NetworkLink for SimLink {
    fn status(&self) -> LinkStatus {
        self.status
    }

    fn reconnect(&mut self) {
        self.status = if self.available {
            LinkStatus::Connected
        } else {
            LinkStatus::Connecting
        };
    }
}

/// Update service that only tracks whether it would accept uploads.
#[derive(Debug, Default)]
pub struct SimService {
    running: bool,
}

impl UpdateService for SimService {
    fn start(&mut self, identity: &ServiceIdentity) -> Result<(), ServiceError> {
        if identity.hostname.is_empty() {
            return Err(ServiceError::InvalidHostname);
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// How a scripted upload should go.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadScript {
    Valid,
    WrongPassword,
    Corrupted,
    Dropped,
}

impl UploadScript {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ok" => Some(Self::Valid),
            "bad-password" => Some(Self::WrongPassword),
            "corrupt" => Some(Self::Corrupted),
            "drop" => Some(Self::Dropped),
            _ => None,
        }
    }
}

/// Storage faults that can be armed before the next write or erase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageFault {
    /// Next write programs only this many bytes.
    Tear(usize),
    FailWrites,
    FailErases,
    Clear,
}

pub struct SimDevice {
    config: DeviceConfig,
    supervisor: SimSupervisor,
    clock: SimInstant,
    link_available: bool,
    halted: Option<FatalError>,
    boots: u32,
    next_record: EventId,
}

impl SimDevice {
    /// Builds a factory-fresh device and powers it on.
    pub fn power_on(config: DeviceConfig) -> io::Result<(Self, Vec<String>)> {
        let supervisor = build_supervisor(
            SimStorage::new(),
            SlotTable::new(SlotId::A),
            ResetReason::PowerOn,
            &config,
            true,
        )?;
        let mut device = Self {
            config,
            supervisor,
            clock: SimInstant::default(),
            link_available: true,
            halted: None,
            boots: 0,
            next_record: 0,
        };
        let mut lines = vec!["--- power on ---".to_string()];
        if device.boot(&mut lines) {
            lines.extend(device.restart(ResetReason::SoftwareReset)?);
        }
        Ok((device, lines))
    }

    #[must_use]
    pub const fn now(&self) -> SimInstant {
        self.clock
    }

    #[must_use]
    pub const fn halted(&self) -> Option<FatalError> {
        self.halted
    }

    #[must_use]
    pub fn supervisor(&self) -> &SimSupervisor {
        &self.supervisor
    }

    /// Resets the device with `reason` and boots until it settles.
    ///
    /// Storage and the slot table carry over; RAM state does not.
    pub fn restart(&mut self, reason: ResetReason) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut reason = reason;
        for _ in 0..MAX_CHAINED_BOOTS {
            self.reset_hardware(reason)?;
            lines.push(format!("--- reset ({reason}) ---"));
            if !self.boot(&mut lines) {
                return Ok(lines);
            }
            reason = ResetReason::SoftwareReset;
        }
        Err(io::Error::other("device is stuck in a restart loop"))
    }

    fn reset_hardware(&mut self, reason: ResetReason) -> io::Result<()> {
        let coordinator = self.supervisor.coordinator_mut();
        let storage = mem::take(coordinator.store_mut().storage_mut());
        let mut slots = mem::replace(coordinator.partitions_mut(), SlotTable::new(SlotId::A));
        slots.restart();

        self.supervisor =
            build_supervisor(storage, slots, reason, &self.config, self.link_available)?;
        self.halted = None;
        self.next_record = 0;
        Ok(())
    }

    /// Runs the boot procedure; returns `true` when it asks for a restart.
    fn boot(&mut self, lines: &mut Vec<String>) -> bool {
        self.boots += 1;
        let result = self.supervisor.boot(self.clock);
        self.drain_telemetry(lines);
        match result {
            Ok(report) => {
                lines.push(describe_report(&report));
                report.action() == Some(DeviceAction::Restart)
            }
            Err(err) => {
                self.halted = Some(err);
                lines.push(format!("HALT {err}"));
                false
            }
        }
    }

    /// Advances virtual time by `elapsed`, ticking at the service cadence.
    pub fn advance(&mut self, elapsed: Duration) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        let steps = (elapsed.as_micros() / SERVICE_POLL_INTERVAL.as_micros()).max(1);
        for _ in 0..steps {
            self.clock = self.clock + SERVICE_POLL_INTERVAL;
            if self.halted.is_some() {
                continue;
            }
            let action = self.supervisor.tick(self.clock);
            self.drain_telemetry(&mut lines);
            if action == Some(DeviceAction::Restart) {
                lines.extend(self.restart(ResetReason::SoftwareReset)?);
            }
        }
        Ok(lines)
    }

    /// Queues a raw command frame and runs one tick.
    pub fn send_frame(&mut self, frame: &[u8]) -> io::Result<Vec<String>> {
        if self.supervisor.queue_mut().push_frame(frame).is_err() {
            return Ok(vec!["ERR event queue full".to_string()]);
        }
        self.advance(SERVICE_POLL_INTERVAL)
    }

    /// Streams a synthetic image through the upload protocol.
    pub fn upload(&mut self, script: UploadScript) -> io::Result<Vec<String>> {
        if !self.supervisor.coordinator().service_running() {
            return Ok(vec!["ERR connection refused: update service stopped".to_string()]);
        }
        if self.supervisor.link().status() != LinkStatus::Connected {
            return Ok(vec!["ERR link down".to_string()]);
        }

        let image = synthetic_image(self.boots);
        let password = self.config.ota_password.as_deref();
        let secret = match script {
            UploadScript::WrongPassword => Some("not-the-password"),
            _ => password,
        };
        let header = UploadHeader::for_image(&image, secret)
            .map_err(|err| io::Error::other(format!("upload header: {err}")))?;

        let mut stream = header.encode().to_vec();
        stream.extend_from_slice(&image);
        match script {
            UploadScript::Corrupted => {
                if let Some(last) = stream.last_mut() {
                    *last ^= 0xFF;
                }
            }
            UploadScript::Dropped => stream.truncate(stream.len() / 2),
            UploadScript::Valid | UploadScript::WrongPassword => {}
        }

        let mut session = UploadSession::new(RamImageSink::<SIM_IMAGE_CAPACITY>::new());
        let mut events: Vec<TransferEvent> = stream
            .chunks(UPDATE_PACKET_LEN)
            .flat_map(|packet| session.feed(packet, password))
            .collect();
        if script == UploadScript::Dropped {
            events.extend(session.disconnect());
        }
        if session.sink().finished().is_some() {
            self.supervisor
                .coordinator_mut()
                .partitions_mut()
                .stage_update();
        }

        let mut lines = vec![format!(
            "OK sent {} bytes ({})",
            stream.len(),
            describe_events(&events)
        )];
        for event in events {
            if self.supervisor.queue_mut().try_enqueue(event.into()).is_err() {
                lines.push("ERR event queue full".to_string());
            }
        }
        lines.extend(self.advance(SERVICE_POLL_INTERVAL)?);
        Ok(lines)
    }

    pub fn set_link(&mut self, available: bool) {
        self.link_available = available;
        self.supervisor.link_mut().set_available(available);
    }

    pub fn inject_fault(&mut self, fault: StorageFault) {
        let storage = self.supervisor.coordinator_mut().store_mut().storage_mut();
        match fault {
            StorageFault::Tear(bytes) => storage.tear_next_write(bytes),
            StorageFault::FailWrites => storage.fail_writes(true),
            StorageFault::FailErases => storage.fail_erases(true),
            StorageFault::Clear => {
                storage.fail_writes(false);
                storage.fail_erases(false);
            }
        }
    }

    /// Status report lines plus simulator bookkeeping.
    #[must_use]
    pub fn status_lines(&self) -> Vec<String> {
        let snapshot: StatusSnapshot = self.supervisor.status();
        let mut report = String::new();
        let _ = StatusFormatter::new(&snapshot).write_all(&mut report, "\n");

        let mut lines: Vec<String> = report.lines().map(str::to_string).collect();
        let store = self.supervisor.coordinator().store();
        lines.push(format!(
            "store counter={} service-flag={} boots={}",
            store.read_raw_counter(),
            store.read_update_service(),
            self.boots
        ));
        if let Some(err) = self.halted {
            lines.push(format!("halted: {err}"));
        }
        lines
    }

    /// Every record still held in the telemetry ring.
    #[must_use]
    pub fn log_lines(&self) -> Vec<String> {
        self.supervisor
            .telemetry()
            .oldest_first()
            .map(describe_record)
            .collect()
    }

    fn drain_telemetry(&mut self, lines: &mut Vec<String>) {
        for record in self.supervisor.telemetry().oldest_first() {
            if record.id.wrapping_sub(self.next_record) > EventId::MAX / 2 {
                continue;
            }
            lines.push(describe_record(record));
            self.next_record = record.id.wrapping_add(1);
        }
    }
}

fn build_supervisor(
    storage: SimStorage,
    slots: SlotTable,
    reason: ResetReason,
    config: &DeviceConfig,
    link_available: bool,
) -> io::Result<SimSupervisor> {
    let store = JournalStore::mount(storage)
        .map_err(|err| io::Error::other(format!("store mount failed: {err}")))?;
    let coordinator: SimCoordinator = RollbackCoordinator::new(
        store,
        slots,
        FixedReset(reason),
        SimService::default(),
        config.coordinator_settings(),
    );
    Ok(Supervisor::new(
        coordinator,
        SimLink::new(link_available),
        SimQueue::new(),
    ))
}

fn synthetic_image(seed: u32) -> Vec<u8> {
    (0..SIM_IMAGE_LEN)
        .map(|index| {
            let mixed = u32::try_from(index).unwrap_or(0).wrapping_mul(31) ^ seed;
            mixed.to_le_bytes()[0]
        })
        .collect()
}

fn describe_report(report: &BootReport) -> String {
    let decision = match report.decision {
        BootDecision::Normal { counter, reason } => {
            format!("normal counter={counter} reset={reason}")
        }
        BootDecision::Rollback { next } => format!("rollback next={next}"),
        BootDecision::SafeMode { reason } => format!("safe-mode reset={reason}"),
    };
    let mut line = format!("BOOT slot={} {decision}", report.slot);
    if let Some(raw) = report.corrupted_raw {
        let _ = write!(line, " sanitized={raw}");
    }
    line
}

fn describe_events(events: &[TransferEvent]) -> String {
    if events.is_empty() {
        return "no transfer events".to_string();
    }
    events
        .iter()
        .map(|event| match event {
            TransferEvent::Started => "started".to_string(),
            TransferEvent::Completed => "completed".to_string(),
            TransferEvent::Failed(code) => format!("failed: {code}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_record(record: &TelemetryRecord<SimInstant>) -> String {
    let mut line = format!(
        "  telemetry #{} +{}ms {}",
        record.id,
        record.timestamp.as_millis(),
        record.event
    );
    if record.details != TelemetryPayload::None {
        let _ = write!(line, " {}", record.details);
    }
    line
}

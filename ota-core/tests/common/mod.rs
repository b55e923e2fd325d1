#![allow(dead_code)]

use core::ops::Add;
use core::time::Duration;

use heapless::String;
use ota_core::coordinator::{CoordinatorSettings, RollbackCoordinator};
use ota_core::events::LocalEventQueue;
use ota_core::link::{LinkStatus, NetworkLink};
use ota_core::partition::{SlotId, SlotTable};
use ota_core::reset::{FixedReset, ResetReason};
use ota_core::store::{JournalStore, RamStorage, StateStore};
use ota_core::supervisor::Supervisor;
use ota_core::telemetry::TelemetryInstant;
use ota_core::transfer::{ServiceError, ServiceIdentity, UpdateService};

pub const PROBATION_BOOTS: u8 = 3;

pub type Storage = RamStorage<64>;
pub type Store = JournalStore<Storage>;
pub type Coordinator = RollbackCoordinator<Store, SlotTable, FixedReset, MockService>;
pub type Queue = LocalEventQueue<8>;
pub type TestSupervisor = Supervisor<Store, SlotTable, FixedReset, MockService, MockLink, Queue, MockInstant>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(pub u64);

impl MockInstant {
    pub fn millis(value: u64) -> Self {
        Self(value * 1_000)
    }

    pub fn secs(value: u64) -> Self {
        Self(value * 1_000_000)
    }
}

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + u64::try_from(rhs.as_micros()).expect("duration fits"))
    }
}

impl TelemetryInstant for MockInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

#[derive(Debug, Default)]
pub struct MockService {
    pub running: bool,
    pub starts: u32,
    pub stops: u32,
    pub fail_start: Option<ServiceError>,
    pub last_port: Option<u16>,
}

impl UpdateService for MockService {
    fn start(&mut self, identity: &ServiceIdentity) -> Result<(), ServiceError> {
        if let Some(err) = self.fail_start {
            return Err(err);
        }
        self.running = true;
        self.starts += 1;
        self.last_port = Some(identity.port);
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.stops += 1;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

#[derive(Debug)]
pub struct MockLink {
    pub status: LinkStatus,
    pub reconnects: u32,
}

impl MockLink {
    pub fn connected() -> Self {
        Self {
            status: LinkStatus::Connected,
            reconnects: 0,
        }
    }

    pub fn down() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            reconnects: 0,
        }
    }
}

impl NetworkLink for MockLink {
    fn status(&self) -> LinkStatus {
        self.status
    }

    fn reconnect(&mut self) {
        self.reconnects += 1;
        self.status = LinkStatus::Connecting;
    }
}

pub fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        probation_boots: PROBATION_BOOTS,
        identity: ServiceIdentity {
            hostname: String::try_from("bench-node").expect("hostname fits"),
            password: None,
            port: 3232,
        },
    }
}

/// Store whose committed counter is `raw`.
pub fn store_with_counter(raw: i8) -> Store {
    let mut store = JournalStore::mount(Storage::new()).expect("mount blank storage");
    store.write_raw_counter(raw).expect("seed counter");
    store
}

pub fn coordinator(raw: i8, reason: ResetReason) -> Coordinator {
    coordinator_with(store_with_counter(raw), SlotTable::new(SlotId::A), reason)
}

pub fn coordinator_with(store: Store, slots: SlotTable, reason: ResetReason) -> Coordinator {
    RollbackCoordinator::new(
        store,
        slots,
        FixedReset(reason),
        MockService::default(),
        settings(),
    )
}

pub fn supervisor(coordinator: Coordinator, link: MockLink) -> TestSupervisor {
    Supervisor::new(coordinator, link, Queue::new())
}

/// Simulates a restart: the storage survives, RAM state and the running service do not.
pub fn power_cycle(coordinator: Coordinator, reason: ResetReason) -> Coordinator {
    let (store, mut slots, _, _) = coordinator.into_parts();
    slots.restart();
    let store = JournalStore::mount(store.into_inner()).expect("remount storage");
    coordinator_with(store, slots, reason)
}

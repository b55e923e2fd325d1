use core::cell::RefCell;

use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::flash::Flash;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::Channel;
use ota_core::coordinator::RollbackCoordinator;
use ota_core::store::JournalStore;
use ota_core::supervisor::Supervisor;
use static_cell::StaticCell;

use crate::config;
use crate::events::{EventChannel, EventConsumer};
use crate::platform::{self, flash};
use crate::platform::flash::{BankSwapOracle, FlashImageSink, FlashStorage, SharedFlash};
use crate::platform::reset::RccResetClassifier;
use crate::status::{UsbLink, UsbUpdateService};
use crate::usb;

mod supervisor_task;
mod update_task;
mod usb_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// One USB packet of upload bytes.
pub(super) type UploadChunk = heapless::Vec<u8, { usb::MAX_PACKET_SIZE as usize }>;

/// Traffic from the update CDC port to the upload task.
pub(super) enum UploadIngress {
    Data(UploadChunk),
    /// Host dropped DTR or the interface was disabled.
    Disconnected,
}

const UPLOAD_QUEUE_DEPTH: usize = 4;

pub(super) static EVENT_QUEUE: EventChannel = Channel::new();
pub(super) static UPLOAD_QUEUE: Channel<ThreadModeRawMutex, UploadIngress, UPLOAD_QUEUE_DEPTH> =
    Channel::new();
pub(super) static USB_STORAGE: StaticCell<usb::UsbDeviceStorage> = StaticCell::new();
static FLASH: StaticCell<SharedFlash> = StaticCell::new();

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let hal::Peripherals {
        FLASH: flash_peripheral,
        IWDG,
        USB,
        PA11,
        PA12,
        ..
    } = hal::init(hal::Config::default());

    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            defmt::error!("config: {}", defmt::Display2Format(&err));
            platform::halt()
        }
    };

    let layout = flash::current_layout();
    let flash = FLASH.init(Mutex::new(RefCell::new(Flash::new_blocking(flash_peripheral))));
    defmt::info!(
        "ota-guard {} running slot {}",
        config.firmware_version.as_deref().unwrap_or("unversioned"),
        defmt::Display2Format(&layout.running())
    );

    let store = match JournalStore::mount(FlashStorage::new(flash, layout)) {
        Ok(store) => store,
        Err(err) => {
            defmt::error!("store: mount failed: {}", defmt::Display2Format(&err));
            platform::halt()
        }
    };

    let coordinator = RollbackCoordinator::new(
        store,
        BankSwapOracle::new(flash, layout),
        RccResetClassifier::new(),
        UsbUpdateService::new(),
        config.coordinator_settings(),
    );
    let supervisor = Supervisor::new(
        coordinator,
        UsbLink::new(),
        EventConsumer::new(EVENT_QUEUE.receiver()),
    );

    spawner
        .spawn(usb_task::run(USB, PA12, PA11))
        .expect("failed to spawn USB task");
    spawner
        .spawn(update_task::run(
            FlashImageSink::new(flash, layout),
            config.ota_password.clone(),
        ))
        .expect("failed to spawn update task");
    spawner
        .spawn(supervisor_task::run(supervisor, IWDG))
        .expect("failed to spawn supervisor task");

    core::future::pending::<()>().await;
}

use embassy_stm32::Peri;
use embassy_stm32::peripherals::IWDG;
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_time::{Duration, Ticker, Timer};
use ota_core::store::JournalStore;
use ota_core::supervisor::{DeviceAction, SERVICE_POLL_INTERVAL, Supervisor};

use crate::events::EventConsumer;
use crate::platform::flash::{BankSwapOracle, FlashStorage};
use crate::platform::reset::RccResetClassifier;
use crate::platform::{self, FirmwareInstant, to_embassy};
use crate::status::{self, UsbLink, UsbUpdateService};
use crate::telemetry::TelemetryMirror;

pub type FirmwareSupervisor = Supervisor<
    JournalStore<FlashStorage>,
    BankSwapOracle,
    RccResetClassifier,
    UsbUpdateService,
    UsbLink,
    EventConsumer<'static>,
    FirmwareInstant,
>;

/// Covers the longest blocking flash erase an upload can trigger.
const WATCHDOG_TIMEOUT_US: u32 = 8_000_000;
/// Time for RTT to drain the last log lines before a reset.
const RESTART_GRACE: Duration = Duration::from_millis(100);

#[embassy_executor::task]
pub async fn run(mut supervisor: FirmwareSupervisor, iwdg: Peri<'static, IWDG>) -> ! {
    let mut mirror = TelemetryMirror::new();

    let booted = supervisor.boot(FirmwareInstant::now());
    mirror.flush(supervisor.telemetry());
    let report = match booted {
        Ok(report) => report,
        Err(err) => {
            defmt::error!("supervisor: halting: {}", defmt::Display2Format(&err));
            platform::halt()
        }
    };
    status::log_status(&supervisor.status());

    if report.action() == Some(DeviceAction::Restart) {
        restart().await;
    }

    // Armed only after a successful boot so a fatal halt stays halted.
    let mut watchdog = IndependentWatchdog::new(iwdg, WATCHDOG_TIMEOUT_US);
    watchdog.unleash();

    let mut ticker = Ticker::every(to_embassy(SERVICE_POLL_INTERVAL));
    loop {
        ticker.next().await;
        watchdog.pet();

        let action = supervisor.tick(FirmwareInstant::now());
        mirror.flush(supervisor.telemetry());
        if action == Some(DeviceAction::Restart) {
            restart().await;
        }
    }
}

async fn restart() -> ! {
    defmt::info!("supervisor: restarting");
    Timer::after(RESTART_GRACE).await;
    platform::restart()
}

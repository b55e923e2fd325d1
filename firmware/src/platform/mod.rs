//! STM32G0B1 platform bindings for the rollback coordinator.
//!
//! The two 256 KiB flash banks serve as boot slots, selected through the
//! `nSWAP_BANK` option bit. The persisted journal sits in the last two pages
//! of physical bank 1, which images never occupy.

use core::ops::Add;
use core::time::Duration;

use embassy_time::Instant;
use ota_core::telemetry::TelemetryInstant;

pub mod layout;
pub mod reset;

#[cfg(target_os = "none")]
pub mod flash;

/// Monotonic instant shared by the supervisor and telemetry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    #[cfg(target_os = "none")]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(Instant::from_micros(micros))
    }

    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.0.as_micros()
    }
}

impl Add<Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.checked_add(to_embassy(rhs)).unwrap_or(Instant::MAX))
    }
}

impl TelemetryInstant for FirmwareInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_duration_since(earlier.0).as_micros())
    }
}

/// Converts a core duration into the Embassy tick domain, saturating.
#[must_use]
pub fn to_embassy(duration: Duration) -> embassy_time::Duration {
    embassy_time::Duration::from_micros(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

/// Resets the MCU, reloading option bytes first when a slot change is armed.
#[cfg(target_os = "none")]
pub fn restart() -> ! {
    if flash::option_reload_pending() {
        flash::launch_option_reload();
    }
    cortex_m::peripheral::SCB::sys_reset()
}

/// Parks the core. The watchdog is not running yet when this is reached.
#[cfg(target_os = "none")]
pub fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_durations_saturates() {
        let start = FirmwareInstant::from_micros(1_000);
        let later = start + Duration::from_millis(20);
        assert_eq!(later.as_micros(), 21_000);
        assert_eq!(
            later.saturating_duration_since(start),
            Duration::from_millis(20)
        );
        assert_eq!(start.saturating_duration_since(later), Duration::ZERO);
        assert!(start + Duration::MAX > later);
    }
}

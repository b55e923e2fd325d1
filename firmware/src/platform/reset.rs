//! Reset cause decoding from `RCC_CSR`.

use ota_core::reset::ResetReason;

const LPWRRSTF: u32 = 1 << 31;
const WWDGRSTF: u32 = 1 << 30;
const IWDGRSTF: u32 = 1 << 29;
const SFTRSTF: u32 = 1 << 28;
const PWRRSTF: u32 = 1 << 27;
const PINRSTF: u32 = 1 << 26;
const OBLRSTF: u32 = 1 << 25;

/// Maps latched reset flags to a reason, most severe cause first.
///
/// The reset circuit drives NRST for every internal cause, so the pin flag
/// only counts when nothing else is latched. The brown-out reset shares
/// `PWRRSTF` with power-on and cannot be told apart from it. An option-byte
/// reload only happens through [`super::restart`].
#[must_use]
pub fn classify_reset_flags(csr: u32) -> ResetReason {
    if csr & (IWDGRSTF | WWDGRSTF) != 0 {
        ResetReason::Watchdog
    } else if csr & SFTRSTF != 0 || csr & OBLRSTF != 0 {
        ResetReason::SoftwareReset
    } else if csr & LPWRRSTF != 0 {
        ResetReason::Unknown(flag_byte(csr))
    } else if csr & PWRRSTF != 0 {
        ResetReason::PowerOn
    } else if csr & PINRSTF != 0 {
        ResetReason::ExternalReset
    } else {
        ResetReason::Unknown(0)
    }
}

fn flag_byte(csr: u32) -> u8 {
    u8::try_from(csr >> 25).unwrap_or(u8::MAX)
}

/// Reads and clears the RCC reset flags once per boot.
#[cfg(target_os = "none")]
pub struct RccResetClassifier {
    latched: Option<ResetReason>,
}

#[cfg(target_os = "none")]
impl RccResetClassifier {
    pub const fn new() -> Self {
        Self { latched: None }
    }
}

#[cfg(target_os = "none")]
impl ota_core::reset::ResetClassifier for RccResetClassifier {
    fn last_reset_reason(&mut self) -> ResetReason {
        *self.latched.get_or_insert_with(|| {
            use embassy_stm32::pac;

            let csr = pac::RCC.csr().read().0;
            pac::RCC.csr().modify(|w| w.set_rmvf(true));
            classify_reset_flags(csr)
        })
    }
}

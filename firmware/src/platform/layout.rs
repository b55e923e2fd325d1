//! Flash geometry and slot addressing.
//!
//! Offsets are relative to the start of flash as the CPU currently sees it.
//! With `nSWAP_BANK` cleared, physical bank 2 is mapped first, so every
//! mapping here depends on which slot is running.

use core::ops::RangeInclusive;

use ota_core::partition::SlotId;
use ota_core::store::Bank;

/// Size of one flash bank.
pub const BANK_LEN: u32 = 256 * 1024;
/// Erase granularity.
pub const PAGE_LEN: u32 = 2 * 1024;
/// Pages reserved for the journal at the end of physical bank 1.
pub const JOURNAL_PAGES: u32 = 2;
/// Bytes an image may occupy in its bank.
pub const IMAGE_AREA_LEN: u32 = BANK_LEN - JOURNAL_PAGES * PAGE_LEN;

/// `FLASH_OPTR` bit selecting physical bank 1 as the boot bank when set.
pub const N_SWAP_BANK: u32 = 1 << 20;

/// Initial stack pointers a real image can carry. SRAM is 144 KiB.
const STACK_TOP_RANGE: RangeInclusive<u32> = 0x2000_0000..=0x2002_4000;

/// Bank mapping for the running image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashLayout {
    running: SlotId,
}

impl FlashLayout {
    /// Slot A lives in physical bank 1, slot B in physical bank 2.
    #[must_use]
    pub const fn from_optr(optr: u32) -> Self {
        let running = if optr & N_SWAP_BANK != 0 {
            SlotId::A
        } else {
            SlotId::B
        };
        Self { running }
    }

    #[must_use]
    pub const fn running(self) -> SlotId {
        self.running
    }

    /// Offset of the first byte of `slot`'s image.
    #[must_use]
    pub fn image_offset(self, slot: SlotId) -> u32 {
        if slot == self.running { 0 } else { BANK_LEN }
    }

    /// Offset of a journal page. The pages always live in physical bank 1.
    #[must_use]
    pub fn journal_offset(self, bank: Bank) -> u32 {
        let page = match bank {
            Bank::First => 0,
            Bank::Second => 1,
        };
        self.image_offset(SlotId::A) + IMAGE_AREA_LEN + page * PAGE_LEN
    }
}

/// Returns `optr` updated so the next option load boots `slot`.
#[must_use]
pub const fn optr_selecting(optr: u32, slot: SlotId) -> u32 {
    match slot {
        SlotId::A => optr | N_SWAP_BANK,
        SlotId::B => optr & !N_SWAP_BANK,
    }
}

/// Checks the first vector-table word of an image.
#[must_use]
pub fn is_bootable_stack_pointer(initial_sp: u32) -> bool {
    initial_sp % 4 == 0 && STACK_TOP_RANGE.contains(&initial_sp)
}

//! Flash-backed implementations of the storage, partition, and image seams.
//!
//! The Embassy flash driver sits behind a blocking mutex so the supervisor
//! (journal writes, rollback) and the upload task (image writes) never
//! interleave programming sequences. Option-byte programming takes the same
//! lock and touches the registers directly.

use core::cell::RefCell;

use embassy_stm32::flash::{Blocking, Flash};
use embassy_stm32::pac;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use ota_core::partition::{ActivationError, PartitionOracle, SlotId};
use ota_core::store::{Bank, NvError, NvStorage};
use ota_core::upload::{ImageSink, SinkError};
use portable_atomic::{AtomicBool, Ordering};

use super::layout::{
    FlashLayout, IMAGE_AREA_LEN, PAGE_LEN, is_bootable_stack_pointer, optr_selecting,
};

pub type SharedFlash = Mutex<ThreadModeRawMutex, RefCell<Flash<'static, Blocking>>>;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;
const OPTKEY1: u32 = 0x0819_2A3B;
const OPTKEY2: u32 = 0x4C5D_6E7F;

const SR_BSY1: u32 = 1 << 16;
/// OPERR, PROGERR..FASTERR, RDERR, OPTVERR.
const SR_ERRORS: u32 = 0x0000_C3FA;
const CR_OPTSTRT: u32 = 1 << 17;
const CR_OBL_LAUNCH: u32 = 1 << 27;
const CR_OPTLOCK: u32 = 1 << 30;
const CR_LOCK: u32 = 1 << 31;

/// Set once new option bytes are programmed but not yet loaded.
static OPTION_RELOAD_PENDING: AtomicBool = AtomicBool::new(false);

pub fn option_reload_pending() -> bool {
    OPTION_RELOAD_PENDING.load(Ordering::Acquire)
}

/// Loads the programmed option bytes, which resets the MCU.
///
/// Returns only if the option registers refuse to unlock.
pub fn launch_option_reload() {
    if unlock_options().is_err() {
        defmt::error!("flash: option bytes locked, slot change lost");
        return;
    }
    pac::FLASH.cr().modify(|w| w.0 |= CR_OBL_LAUNCH);
    loop {
        cortex_m::asm::nop();
    }
}

/// Reads the bank mapping the device booted with.
pub fn current_layout() -> FlashLayout {
    FlashLayout::from_optr(pac::FLASH.optr().read().0)
}

fn with_flash<R>(flash: &SharedFlash, f: impl FnOnce(&mut Flash<'static, Blocking>) -> R) -> R {
    flash.lock(|cell| f(&mut cell.borrow_mut()))
}

fn wait_idle() {
    while pac::FLASH.sr().read().0 & SR_BSY1 != 0 {}
}

fn unlock_options() -> Result<(), ActivationError> {
    let regs = pac::FLASH;
    wait_idle();
    if regs.cr().read().0 & CR_LOCK != 0 {
        regs.keyr().write_value(KEY1);
        regs.keyr().write_value(KEY2);
    }
    if regs.cr().read().0 & CR_OPTLOCK != 0 {
        regs.optkeyr().write_value(OPTKEY1);
        regs.optkeyr().write_value(OPTKEY2);
    }
    if regs.cr().read().0 & (CR_LOCK | CR_OPTLOCK) != 0 {
        return Err(ActivationError::Locked);
    }
    Ok(())
}

/// Programs `nSWAP_BANK` so the next option load boots `slot`.
fn select_boot_slot(flash: &SharedFlash, slot: SlotId) -> Result<(), ActivationError> {
    // Holding the driver lock keeps page programming out of the sequence.
    flash.lock(|_| {
        let regs = pac::FLASH;
        let optr = regs.optr().read().0;
        let wanted = optr_selecting(optr, slot);
        if wanted == optr {
            return Ok(());
        }

        unlock_options()?;
        regs.sr().write(|w| w.0 = SR_ERRORS);
        regs.optr().write(|w| w.0 = wanted);
        regs.cr().modify(|w| w.0 |= CR_OPTSTRT);
        wait_idle();

        let errors = regs.sr().read().0 & SR_ERRORS;
        regs.cr().modify(|w| w.0 |= CR_LOCK);
        if errors != 0 {
            defmt::warn!("flash: option programming failed sr={:#x}", errors);
            return Err(ActivationError::Program);
        }
        Ok(())
    })?;

    OPTION_RELOAD_PENDING.store(slot != current_layout().running(), Ordering::Release);
    Ok(())
}

/// Journal pages at the end of physical bank 1.
pub struct FlashStorage {
    flash: &'static SharedFlash,
    layout: FlashLayout,
}

impl FlashStorage {
    pub fn new(flash: &'static SharedFlash, layout: FlashLayout) -> Self {
        Self { flash, layout }
    }

    fn address(&self, bank: Bank, offset: usize, len: usize) -> Result<u32, NvError> {
        let end = offset.checked_add(len).ok_or(NvError::OutOfBounds)?;
        if end > self.bank_size() {
            return Err(NvError::OutOfBounds);
        }
        let offset = u32::try_from(offset).map_err(|_| NvError::OutOfBounds)?;
        Ok(self.layout.journal_offset(bank) + offset)
    }
}

impl NvStorage for FlashStorage {
    fn bank_size(&self) -> usize {
        PAGE_LEN as usize
    }

    fn read(&mut self, bank: Bank, offset: usize, buf: &mut [u8]) -> Result<(), NvError> {
        let address = self.address(bank, offset, buf.len())?;
        with_flash(self.flash, |flash| flash.blocking_read(address, buf)).map_err(|_| NvError::Read)
    }

    fn write(&mut self, bank: Bank, offset: usize, data: &[u8]) -> Result<(), NvError> {
        let address = self.address(bank, offset, data.len())?;
        with_flash(self.flash, |flash| flash.blocking_write(address, data))
            .map_err(|_| NvError::Program)
    }

    fn erase(&mut self, bank: Bank) -> Result<(), NvError> {
        let start = self.layout.journal_offset(bank);
        with_flash(self.flash, |flash| flash.blocking_erase(start, start + PAGE_LEN))
            .map_err(|_| NvError::Erase)
    }
}

/// Boot slot selection through the bank-swap option bit.
pub struct BankSwapOracle {
    flash: &'static SharedFlash,
    layout: FlashLayout,
}

impl BankSwapOracle {
    pub fn new(flash: &'static SharedFlash, layout: FlashLayout) -> Self {
        Self { flash, layout }
    }

    fn initial_stack_pointer(&self, slot: SlotId) -> Option<u32> {
        let mut word = [0u8; 4];
        let address = self.layout.image_offset(slot);
        with_flash(self.flash, |flash| flash.blocking_read(address, &mut word)).ok()?;
        Some(u32::from_le_bytes(word))
    }
}

impl PartitionOracle for BankSwapOracle {
    fn current_slot(&self) -> SlotId {
        self.layout.running()
    }

    fn alternate_of(&self, slot: SlotId) -> Option<SlotId> {
        let other = slot.other();
        self.initial_stack_pointer(other)
            .filter(|sp| is_bootable_stack_pointer(*sp))
            .map(|_| other)
    }

    fn set_next_boot(&mut self, slot: SlotId) -> Result<(), ActivationError> {
        if slot != self.layout.running() && self.alternate_of(self.layout.running()).is_none() {
            return Err(ActivationError::InvalidImage);
        }
        select_boot_slot(self.flash, slot)
    }
}

/// Writes uploads into the bank that is not running.
pub struct FlashImageSink {
    flash: &'static SharedFlash,
    layout: FlashLayout,
}

impl FlashImageSink {
    pub fn new(flash: &'static SharedFlash, layout: FlashLayout) -> Self {
        Self { flash, layout }
    }

    fn base(&self) -> u32 {
        self.layout.image_offset(self.layout.running().other())
    }
}

impl ImageSink for FlashImageSink {
    fn begin(&mut self, image_len: u32) -> Result<(), SinkError> {
        if image_len > IMAGE_AREA_LEN {
            return Err(SinkError::TooLarge);
        }
        let start = self.base();
        let end = start + image_len.div_ceil(PAGE_LEN) * PAGE_LEN;
        with_flash(self.flash, |flash| flash.blocking_erase(start, end))
            .map_err(|_| SinkError::Erase)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError> {
        let len = u32::try_from(data.len()).map_err(|_| SinkError::TooLarge)?;
        if offset.saturating_add(len) > IMAGE_AREA_LEN {
            return Err(SinkError::TooLarge);
        }
        let address = self.base() + offset;
        with_flash(self.flash, |flash| flash.blocking_write(address, data))
            .map_err(|_| SinkError::Program)
    }

    fn finish(&mut self, _image_len: u32) -> Result<(), SinkError> {
        select_boot_slot(self.flash, self.layout.running().other())
            .map_err(|_| SinkError::Activate)
    }

    fn abort(&mut self) {
        // Erasing the vector table keeps a partial image from looking bootable.
        let start = self.base();
        if with_flash(self.flash, |flash| flash.blocking_erase(start, start + PAGE_LEN)).is_err() {
            defmt::warn!("flash: could not scrub partial image");
        }
    }
}

use super::{Bank, NvError, NvStorage};

/// RAM-backed [`NvStorage`] with NOR flash semantics and fault injection.
///
/// Programming can only clear bits, so rewriting a slot without an erase
/// corrupts it the same way real flash would. Host tooling and tests use the
/// fault hooks to simulate power loss part way through a write.
#[derive(Clone, Debug)]
pub struct RamStorage<const BANK_SIZE: usize> {
    banks: [[u8; BANK_SIZE]; 2],
    tear_after: Option<usize>,
    fail_writes: bool,
    fail_erases: bool,
    writes: usize,
    erases: usize,
}

impl<const BANK_SIZE: usize> RamStorage<BANK_SIZE> {
    /// Creates fully erased storage.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            banks: [[0xFF; BANK_SIZE]; 2],
            tear_after: None,
            fail_writes: false,
            fail_erases: false,
            writes: 0,
            erases: 0,
        }
    }

    /// Makes the next write program only its first `programmed` bytes and then
    /// report [`NvError::Interrupted`].
    pub fn tear_next_write(&mut self, programmed: usize) {
        self.tear_after = Some(programmed);
    }

    /// Makes every write fail without touching the array.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Makes every erase fail without touching the array.
    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erases = fail;
    }

    /// Number of successful program operations.
    #[must_use]
    pub const fn write_count(&self) -> usize {
        self.writes
    }

    /// Number of successful erase operations.
    #[must_use]
    pub const fn erase_count(&self) -> usize {
        self.erases
    }

    /// Raw contents of a bank.
    #[must_use]
    pub fn bank(&self, bank: Bank) -> &[u8] {
        &self.banks[bank.index()]
    }

    fn span(offset: usize, len: usize) -> Result<core::ops::Range<usize>, NvError> {
        let end = offset.checked_add(len).ok_or(NvError::OutOfBounds)?;
        if end > BANK_SIZE {
            return Err(NvError::OutOfBounds);
        }
        Ok(offset..end)
    }
}

impl<const BANK_SIZE: usize> Default for RamStorage<BANK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BANK_SIZE: usize> NvStorage for RamStorage<BANK_SIZE> {
    fn bank_size(&self) -> usize {
        BANK_SIZE
    }

    fn read(&mut self, bank: Bank, offset: usize, buf: &mut [u8]) -> Result<(), NvError> {
        let span = Self::span(offset, buf.len())?;
        buf.copy_from_slice(&self.banks[bank.index()][span]);
        Ok(())
    }

    fn write(&mut self, bank: Bank, offset: usize, data: &[u8]) -> Result<(), NvError> {
        let span = Self::span(offset, data.len())?;
        if self.fail_writes {
            return Err(NvError::Program);
        }

        let target = &mut self.banks[bank.index()][span];
        if let Some(programmed) = self.tear_after.take() {
            let count = programmed.min(data.len());
            for (cell, byte) in target.iter_mut().zip(&data[..count]) {
                *cell &= *byte;
            }
            return Err(NvError::Interrupted);
        }

        for (cell, byte) in target.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self, bank: Bank) -> Result<(), NvError> {
        if self.fail_erases {
            return Err(NvError::Erase);
        }
        self.banks[bank.index()] = [0xFF; BANK_SIZE];
        self.erases += 1;
        Ok(())
    }
}

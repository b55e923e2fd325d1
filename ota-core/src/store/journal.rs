use crc::{CRC_32_ISO_HDLC, Crc};

use super::{Bank, NvStorage, PersistedState, StateStore, StoreError};

/// Size of one journal record in bytes.
pub const RECORD_LEN: usize = 16;

const RECORD_MAGIC: u16 = 0x4F54;
const FLAG_UPDATE_SERVICE: u8 = 0b0000_0001;
const CHECKED_LEN: usize = 8;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Record {
    sequence: u32,
    state: PersistedState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Slot {
    Blank,
    Damaged,
    Valid(Record),
}

impl Record {
    fn encode(self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[0..2].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        bytes[2..6].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[6] = self.state.raw_counter.to_le_bytes()[0];
        bytes[7] = if self.state.update_service {
            FLAG_UPDATE_SERVICE
        } else {
            0
        };
        let checksum = CRC32.checksum(&bytes[..CHECKED_LEN]);
        bytes[8..12].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; RECORD_LEN]) -> Slot {
        if bytes.iter().all(|byte| *byte == 0xFF) {
            return Slot::Blank;
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let flags = bytes[7];
        if magic != RECORD_MAGIC
            || stored != CRC32.checksum(&bytes[..CHECKED_LEN])
            || flags & !FLAG_UPDATE_SERVICE != 0
        {
            return Slot::Damaged;
        }

        Slot::Valid(Record {
            sequence: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            state: PersistedState {
                raw_counter: i8::from_le_bytes([bytes[6]]),
                update_service: flags & FLAG_UPDATE_SERVICE != 0,
            },
        })
    }
}

/// Log-structured [`StateStore`] spread over two erase banks.
///
/// Every write appends a full snapshot with a higher sequence number. When the
/// active bank is full the other bank is erased and receives the next record,
/// so the newest committed record always survives an interrupted write or
/// erase. Slots that fail their checksum are skipped and never reused until
/// their bank is erased.
pub struct JournalStore<F> {
    storage: F,
    slots_per_bank: usize,
    active: Bank,
    next_slot: usize,
    sequence: u32,
    state: PersistedState,
    /// Set after a failed program attempt: flash may already hold a newer
    /// snapshot than `state`, so the next write is never skipped.
    uncertain: bool,
}

impl<F> JournalStore<F>
where
    F: NvStorage,
{
    /// Scans both banks and loads the newest committed snapshot.
    pub fn mount(mut storage: F) -> Result<Self, StoreError> {
        let slots_per_bank = storage.bank_size() / RECORD_LEN;
        if slots_per_bank == 0 {
            return Err(StoreError::Geometry);
        }

        let mut latest: Option<(Bank, Record)> = None;
        let mut ends = [0usize; 2];

        for bank in [Bank::First, Bank::Second] {
            for slot in 0..slots_per_bank {
                let mut bytes = [0u8; RECORD_LEN];
                storage.read(bank, slot * RECORD_LEN, &mut bytes)?;
                match Record::decode(&bytes) {
                    Slot::Blank => {}
                    Slot::Damaged => ends[bank.index()] = slot + 1,
                    Slot::Valid(record) => {
                        ends[bank.index()] = slot + 1;
                        if latest.is_none_or(|(_, best)| record.sequence > best.sequence) {
                            latest = Some((bank, record));
                        }
                    }
                }
            }
        }

        let active = latest.map_or(Bank::First, |(bank, _)| bank);
        Ok(Self {
            storage,
            slots_per_bank,
            active,
            next_slot: ends[active.index()],
            sequence: latest.map_or(0, |(_, record)| record.sequence),
            state: latest.map_or(PersistedState::DEFAULT, |(_, record)| record.state),
            uncertain: false,
        })
    }

    /// Returns the committed snapshot.
    #[must_use]
    pub fn state(&self) -> PersistedState {
        self.state
    }

    /// Returns the backend.
    pub fn storage(&self) -> &F {
        &self.storage
    }

    /// Returns the backend mutably, e.g. to inject faults in tests.
    pub fn storage_mut(&mut self) -> &mut F {
        &mut self.storage
    }

    /// Releases the backend.
    pub fn into_inner(self) -> F {
        self.storage
    }

    fn commit(&mut self, state: PersistedState) -> Result<(), StoreError> {
        if state == self.state && !self.uncertain {
            return Ok(());
        }

        let (bank, slot) = if self.next_slot < self.slots_per_bank {
            (self.active, self.next_slot)
        } else {
            let target = self.active.other();
            self.storage.erase(target)?;
            self.active = target;
            (target, 0)
        };

        // Sequence numbers stay unique even when a program attempt fails.
        self.sequence = self.sequence.wrapping_add(1);
        self.next_slot = slot + 1;

        let record = Record {
            sequence: self.sequence,
            state,
        };
        self.uncertain = true;
        self.storage
            .write(bank, slot * RECORD_LEN, &record.encode())?;

        self.state = state;
        self.uncertain = false;
        Ok(())
    }
}

impl<F> StateStore for JournalStore<F>
where
    F: NvStorage,
{
    fn read_raw_counter(&self) -> i8 {
        self.state.raw_counter
    }

    fn write_raw_counter(&mut self, raw: i8) -> Result<(), StoreError> {
        self.commit(PersistedState {
            raw_counter: raw,
            ..self.state
        })
    }

    fn read_update_service(&self) -> bool {
        self.state.update_service
    }

    fn write_update_service(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.commit(PersistedState {
            update_service: enabled,
            ..self.state
        })
    }
}

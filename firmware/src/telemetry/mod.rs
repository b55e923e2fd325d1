//! Logging hooks for the supervisor's telemetry ring.
//!
//! The ring in `ota-core` is the source of truth. [`TelemetryMirror`] tails
//! it after every supervisor step and forwards new records to defmt on the
//! target or stdout on the host.

use core::fmt;

use ota_core::telemetry::{EventId, TelemetryRecord, TelemetryRecorder};

use crate::platform::FirmwareInstant;

/// Tracks which telemetry records have already been logged.
#[derive(Debug, Default)]
pub struct TelemetryMirror {
    next_id: EventId,
}

impl TelemetryMirror {
    pub const fn new() -> Self {
        Self { next_id: 0 }
    }

    /// Logs records newer than the previous flush and returns how many.
    ///
    /// Records overwritten in the ring between flushes are skipped.
    pub fn flush<const CAPACITY: usize>(
        &mut self,
        recorder: &TelemetryRecorder<FirmwareInstant, CAPACITY>,
    ) -> usize {
        let mut emitted = 0;
        for record in recorder.oldest_first() {
            if record.id.wrapping_sub(self.next_id) > EventId::MAX / 2 {
                continue;
            }
            emit_record(record);
            self.next_id = record.id.wrapping_add(1);
            emitted += 1;
        }
        emitted
    }
}

/// Renders a record the way it is logged.
pub struct RecordLine<'a>(pub &'a TelemetryRecord<FirmwareInstant>);

impl fmt::Display for RecordLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.0;
        write!(
            f,
            "#{} t={}us {}",
            record.id,
            record.timestamp.as_micros(),
            record.event
        )?;
        match record.details {
            ota_core::telemetry::TelemetryPayload::None => Ok(()),
            details => write!(f, " {details}"),
        }
    }
}

fn emit_record(record: &TelemetryRecord<FirmwareInstant>) {
    emit_log(&RecordLine(record));
}

#[cfg(target_os = "none")]
fn emit_log(line: &RecordLine<'_>) {
    defmt::info!("telemetry:ota {}", defmt::Display2Format(line));
}

#[cfg(not(target_os = "none"))]
fn emit_log(line: &RecordLine<'_>) {
    println!("telemetry:ota {line}");
}

/// Logs one line of free-form text under `scope`.
#[cfg(target_os = "none")]
pub fn emit_text(scope: &str, line: &str) {
    defmt::info!("{}: {}", scope, line);
}

#[cfg(not(target_os = "none"))]
pub fn emit_text(scope: &str, line: &str) {
    println!("{scope}: {line}");
}

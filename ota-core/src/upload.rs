//! Byte-stream firmware upload that raises [`TransferEvent`]s.
//!
//! A stream starts with a header followed by the raw image:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | magic `OTAU`                           |
//! | 4      | 4    | image length, little endian            |
//! | 8      | 4    | CRC-32 (ISO-HDLC) of the image, LE     |
//! | 12     | 1    | secret length `n` (at most 64)         |
//! | 13     | n    | secret bytes                           |
//!
//! [`UploadSession`] buffers the image into [`BLOCK_LEN`] blocks for an
//! [`ImageSink`], checks the digest and the configured secret, and reports
//! `Started`, `Completed` or `Failed` the same way regardless of transport.

use core::fmt;

use crc::{CRC_32_ISO_HDLC, Crc, Digest};
use heapless::Vec;
use winnow::binary::{le_u32, length_take, u8 as byte};
use winnow::error::{ContextError, ModalResult};
use winnow::prelude::*;
use winnow::token::literal;

use crate::transfer::{MAX_SECRET_LEN, TransferErrorCode, TransferEvent};

/// Stream prefix.
pub const UPLOAD_MAGIC: [u8; 4] = *b"OTAU";
/// Header length without the secret.
pub const HEADER_FIXED_LEN: usize = 13;
/// Longest possible header.
pub const HEADER_CAPACITY: usize = HEADER_FIXED_LEN + MAX_SECRET_LEN;
/// Size of the blocks handed to the sink. The final block is padded with
/// `0xFF` up to [`WRITE_ALIGN`].
pub const BLOCK_LEN: usize = 64;
/// Program granularity every sink must accept.
pub const WRITE_ALIGN: usize = 8;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the digest carried in the upload header.
#[must_use]
pub fn image_crc(image: &[u8]) -> u32 {
    CRC32.checksum(image)
}

/// Header validation failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderError {
    BadMagic,
    SecretTooLong,
    /// Input ended before the header did.
    Incomplete,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::BadMagic => f.write_str("bad upload magic"),
            HeaderError::SecretTooLong => f.write_str("upload secret too long"),
            HeaderError::Incomplete => f.write_str("incomplete upload header"),
        }
    }
}

/// Parsed upload header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadHeader {
    pub image_len: u32,
    pub crc32: u32,
    pub secret: Vec<u8, MAX_SECRET_LEN>,
}

impl UploadHeader {
    /// Builds the header for `image`.
    pub fn for_image(image: &[u8], secret: Option<&str>) -> Result<Self, HeaderError> {
        let image_len = u32::try_from(image.len()).map_err(|_| HeaderError::Incomplete)?;
        let secret = Vec::from_slice(secret.unwrap_or_default().as_bytes())
            .map_err(|_| HeaderError::SecretTooLong)?;
        Ok(Self {
            image_len,
            crc32: image_crc(image),
            secret,
        })
    }

    /// Parses a complete header.
    pub fn parse(input: &[u8]) -> Result<Self, HeaderError> {
        if input.len() < HEADER_FIXED_LEN {
            return Err(HeaderError::Incomplete);
        }
        if input[..UPLOAD_MAGIC.len()] != UPLOAD_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        if usize::from(input[HEADER_FIXED_LEN - 1]) > MAX_SECRET_LEN {
            return Err(HeaderError::SecretTooLong);
        }

        let mut stream = input;
        let (image_len, crc32, secret) =
            header_fields(&mut stream).map_err(|_| HeaderError::Incomplete)?;
        Ok(Self {
            image_len,
            crc32,
            secret: Vec::from_slice(secret).map_err(|_| HeaderError::SecretTooLong)?,
        })
    }

    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8, HEADER_CAPACITY> {
        let mut out = Vec::new();
        // Capacity covers the fixed part plus the longest secret.
        let _ = out.extend_from_slice(&UPLOAD_MAGIC);
        let _ = out.extend_from_slice(&self.image_len.to_le_bytes());
        let _ = out.extend_from_slice(&self.crc32.to_le_bytes());
        let _ = out.push(u8::try_from(self.secret.len()).unwrap_or(u8::MAX));
        let _ = out.extend_from_slice(&self.secret);
        out
    }

    fn authorizes(&self, password: Option<&str>) -> bool {
        password.is_none_or(|expected| expected.as_bytes() == self.secret.as_slice())
    }
}

fn header_fields<'a>(input: &mut &'a [u8]) -> ModalResult<(u32, u32, &'a [u8]), ContextError> {
    literal(&UPLOAD_MAGIC[..]).parse_next(input)?;
    let image_len = le_u32.parse_next(input)?;
    let crc32 = le_u32.parse_next(input)?;
    let secret = length_take(byte).parse_next(input)?;
    Ok((image_len, crc32, secret))
}

/// Failure reported by an [`ImageSink`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SinkError {
    /// Image does not fit the inactive slot.
    TooLarge,
    Erase,
    Program,
    /// The written image could not be selected for the next boot.
    Activate,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SinkError::TooLarge => "image too large",
            SinkError::Erase => "slot erase failed",
            SinkError::Program => "slot program failed",
            SinkError::Activate => "slot activation failed",
        };
        f.write_str(label)
    }
}

/// Destination for an uploaded image, normally the inactive slot.
pub trait ImageSink {
    /// Prepares the destination for `image_len` bytes.
    fn begin(&mut self, image_len: u32) -> Result<(), SinkError>;

    /// Programs `data` at `offset`. Both are multiples of [`WRITE_ALIGN`].
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError>;

    /// Marks the written image as the next boot target.
    fn finish(&mut self, image_len: u32) -> Result<(), SinkError>;

    /// Abandons a partially written image.
    fn abort(&mut self);
}

/// Events raised by one [`UploadSession::feed`] call.
pub type UploadEvents = Vec<TransferEvent, 2>;

enum Phase {
    Idle,
    /// A terminal event was raised; input is dropped until the host disconnects.
    Discarding,
    Receiving {
        image_len: u32,
        expected_crc: u32,
        received: u32,
        written: u32,
        digest: Digest<'static, u32>,
    },
}

/// Upload state machine over an [`ImageSink`].
pub struct UploadSession<S> {
    sink: S,
    phase: Phase,
    header: Vec<u8, HEADER_CAPACITY>,
    block: Vec<u8, BLOCK_LEN>,
}

impl<S> UploadSession<S>
where
    S: ImageSink,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            phase: Phase::Idle,
            header: Vec::new(),
            block: Vec::new(),
        }
    }

    /// Returns `true` between `Started` and the terminal event.
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        matches!(self.phase, Phase::Receiving { .. })
    }

    /// Bytes of the current image received so far.
    #[must_use]
    pub fn received(&self) -> u32 {
        match self.phase {
            Phase::Idle | Phase::Discarding => 0,
            Phase::Receiving { received, .. } => received,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consumes stream bytes. `password` is the configured secret, if any.
    ///
    /// One image per connection: after any terminal event the rest of the
    /// stream is discarded until [`Self::disconnect`].
    pub fn feed(&mut self, mut input: &[u8], password: Option<&str>) -> UploadEvents {
        let mut events = UploadEvents::new();
        while !input.is_empty() {
            match core::mem::replace(&mut self.phase, Phase::Discarding) {
                Phase::Discarding => return events,
                Phase::Idle => {
                    self.phase = Phase::Idle;
                    let take = self.header_needed().min(input.len());
                    let _ = self.header.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.header_needed() > 0 {
                        continue;
                    }
                    match self.accept_header(password) {
                        Ok(phase) => {
                            self.phase = phase;
                            let _ = events.push(TransferEvent::Started);
                        }
                        Err(code) => {
                            self.phase = Phase::Discarding;
                            let _ = events.push(TransferEvent::Failed(code));
                            return events;
                        }
                    }
                }
                Phase::Receiving {
                    image_len,
                    expected_crc,
                    mut received,
                    mut written,
                    mut digest,
                } => {
                    let remaining = usize::try_from(image_len - received).unwrap_or(usize::MAX);
                    let take = remaining.min(input.len());
                    let (chunk, rest) = input.split_at(take);
                    input = rest;
                    digest.update(chunk);
                    received += u32::try_from(take).unwrap_or(u32::MAX);

                    if let Err(code) = self.buffer(chunk, &mut written) {
                        self.sink.abort();
                        let _ = events.push(TransferEvent::Failed(code));
                        return events;
                    }

                    if received < image_len {
                        self.phase = Phase::Receiving {
                            image_len,
                            expected_crc,
                            received,
                            written,
                            digest,
                        };
                        continue;
                    }

                    let outcome = self.complete(image_len, expected_crc, written, digest);
                    let _ = events.push(outcome);
                    return events;
                }
            }
        }
        events
    }

    /// Reports a dropped connection. Fails an image in flight.
    pub fn disconnect(&mut self) -> Option<TransferEvent> {
        self.header.clear();
        self.block.clear();
        match core::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle | Phase::Discarding => None,
            Phase::Receiving { .. } => {
                self.sink.abort();
                Some(TransferEvent::Failed(TransferErrorCode::Connect))
            }
        }
    }

    fn header_needed(&self) -> usize {
        if self.header.len() < HEADER_FIXED_LEN {
            return HEADER_FIXED_LEN - self.header.len();
        }
        let secret_len = usize::from(self.header[HEADER_FIXED_LEN - 1]).min(MAX_SECRET_LEN);
        (HEADER_FIXED_LEN + secret_len).saturating_sub(self.header.len())
    }

    fn accept_header(&mut self, password: Option<&str>) -> Result<Phase, TransferErrorCode> {
        let parsed = UploadHeader::parse(&self.header);
        self.header.clear();
        self.block.clear();

        let header = match parsed {
            Ok(header) => header,
            Err(HeaderError::SecretTooLong) => return Err(TransferErrorCode::Auth),
            Err(_) => return Err(TransferErrorCode::Begin),
        };
        if !header.authorizes(password) {
            return Err(TransferErrorCode::Auth);
        }
        if header.image_len == 0 {
            return Err(TransferErrorCode::Begin);
        }
        self.sink
            .begin(header.image_len)
            .map_err(|_| TransferErrorCode::Begin)?;

        Ok(Phase::Receiving {
            image_len: header.image_len,
            expected_crc: header.crc32,
            received: 0,
            written: 0,
            digest: CRC32.digest(),
        })
    }

    fn buffer(&mut self, mut chunk: &[u8], written: &mut u32) -> Result<(), TransferErrorCode> {
        while !chunk.is_empty() {
            let take = (BLOCK_LEN - self.block.len()).min(chunk.len());
            let _ = self.block.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.block.is_full() {
                self.flush(written)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, written: &mut u32) -> Result<(), TransferErrorCode> {
        if self.block.is_empty() {
            return Ok(());
        }
        while self.block.len() % WRITE_ALIGN != 0 {
            let _ = self.block.push(0xFF);
        }
        self.sink
            .write(*written, &self.block)
            .map_err(|_| TransferErrorCode::Receive)?;
        *written += u32::try_from(self.block.len()).unwrap_or(u32::MAX);
        self.block.clear();
        Ok(())
    }

    fn complete(
        &mut self,
        image_len: u32,
        expected_crc: u32,
        mut written: u32,
        digest: Digest<'static, u32>,
    ) -> TransferEvent {
        if let Err(code) = self.flush(&mut written) {
            self.sink.abort();
            return TransferEvent::Failed(code);
        }
        if digest.finalize() != expected_crc {
            self.sink.abort();
            return TransferEvent::Failed(TransferErrorCode::End);
        }
        match self.sink.finish(image_len) {
            Ok(()) => TransferEvent::Completed,
            Err(_) => {
                self.sink.abort();
                TransferEvent::Failed(TransferErrorCode::End)
            }
        }
    }
}

/// RAM-backed [`ImageSink`] for host tooling and tests.
#[derive(Clone, Debug, Default)]
pub struct RamImageSink<const N: usize> {
    image: Vec<u8, N>,
    finished: Option<u32>,
    aborts: u32,
    fail_writes: bool,
}

impl<const N: usize> RamImageSink<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            image: Vec::new(),
            finished: None,
            aborts: 0,
            fail_writes: false,
        }
    }

    /// Written bytes, including block padding.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Length of the last image that was finished.
    #[must_use]
    pub const fn finished(&self) -> Option<u32> {
        self.finished
    }

    #[must_use]
    pub const fn aborts(&self) -> u32 {
        self.aborts
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl<const N: usize> ImageSink for RamImageSink<N> {
    fn begin(&mut self, image_len: u32) -> Result<(), SinkError> {
        if usize::try_from(image_len).ok().is_none_or(|len| len > N) {
            return Err(SinkError::TooLarge);
        }
        self.image.clear();
        self.finished = None;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError> {
        if self.fail_writes || usize::try_from(offset).ok() != Some(self.image.len()) {
            return Err(SinkError::Program);
        }
        self.image
            .extend_from_slice(data)
            .map_err(|_| SinkError::Program)
    }

    fn finish(&mut self, image_len: u32) -> Result<(), SinkError> {
        self.finished = Some(image_len);
        Ok(())
    }

    fn abort(&mut self) {
        self.image.clear();
        self.aborts += 1;
    }
}

//! Frame-based cameras: Merlin streams and numpy dumps.
//!
//! These cameras deliver whole detector frames, one per probe position.
//! The reader consumes the per-frame headers and packs only pixel payloads
//! into the ring; the decoder unpacks each frame to pixel values, undoes
//! the raw-format scrambling, and emits every nonzero pixel as a weighted
//! event, so the same aggregation kernels serve both camera families.
//!
//! The last frame of every scan row falls into the flyback and is skipped.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::kernel::KernelSet;
use crate::meta::ScanGeometry;
use crate::progress::Progress;
use crate::transport::ByteSource;

use super::{ChunkReader, Decoder};

/// Frames per ring slot.
pub const BUFFER_SIZE: usize = 128;

/// Ring slots.
pub const N_BUFFER: usize = 32;

/// Per-frame header bytes for the two Merlin detector sizes.
pub const HEAD_SIZE_512: usize = 768;
pub const HEAD_SIZE_256: usize = 384;


/// How pixel values are packed in the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {

    /// One byte per pixel.
    U8,

    /// Two little-endian bytes per pixel.
    U16,

    /// Raw 64-bit-block format: the pixel sequence is flipped within
    /// blocks, and at counter depth 1 the pixels are packed as bits.
    R64 { counter_depth: u8 },
}

impl PixelFormat {

    /// Payload bytes of one frame.
    pub fn frame_bytes(self, detector: usize) -> usize {
        let pixels = detector * detector;

        match self {
            PixelFormat::U8 => pixels,
            PixelFormat::U16 => pixels * 2,
            PixelFormat::R64 { counter_depth: 1 } => pixels / 8,
            PixelFormat::R64 { counter_depth: 6 } => pixels,
            PixelFormat::R64 { .. } => pixels * 2,
        }
    }

    /// Columns per flipped block of the raw format.
    fn columns_per_flip(self) -> Option<usize> {
        match self {
            PixelFormat::R64 { counter_depth: 1 } => Some(64),
            PixelFormat::R64 { counter_depth: 6 } => Some(8),
            PixelFormat::R64 { .. } => Some(4),
            _ => None,
        }
    }
}

/// Parse a Merlin per-frame header: comma-separated fields, the frame
/// dimensions at positions four and five and the pixel type at six.
pub fn parse_frame_header(header: &[u8], counter_depth: u8) -> Result<(usize, PixelFormat)> {
    let text = String::from_utf8_lossy(header);
    let fields: Vec<&str> = text.split(',').collect();

    if fields.len() < 7 {
        return Err(Error::invalid("frame header has too few fields"));
    }

    let width: usize = fields[4].trim().parse()
        .map_err(|_| Error::invalid("frame header width is not a number"))?;
    let height: usize = fields[5].trim().parse()
        .map_err(|_| Error::invalid("frame header height is not a number"))?;

    let format = match fields[6].trim() {
        "U08" => PixelFormat::U8,
        "U16" => PixelFormat::U16,

        "R64" => match counter_depth {
            1 | 6 | 12 => PixelFormat::R64 { counter_depth },
            _ => return Err(Error::invalid("raw counter depth must be 1, 6 or 12")),
        },

        _ => return Err(Error::unsupported("frame pixel type must be U08, U16 or R64")),
    };

    Ok((width * height, format))
}


/// Packs whole frame payloads into ring slots, consuming the per-frame
/// headers. The header of the very first frame was already consumed while
/// probing the stream format.
#[derive(Debug)]
pub struct FrameReader {
    head_bytes: usize,
    frame_bytes: usize,
    first_frame: bool,
    drained: bool,
}

impl FrameReader {

    pub fn new(head_bytes: usize, frame_bytes: usize, first_header_consumed: bool) -> Self {
        Self {
            head_bytes,
            frame_bytes,
            first_frame: first_header_consumed,
            drained: false,
        }
    }
}

impl ChunkReader for FrameReader {
    fn read_chunk(&mut self, source: &mut dyn ByteSource, slot: &mut [u8]) -> Result<usize> {
        if self.drained { return Ok(0) }

        let mut filled = 0;
        let mut header = vec![0_u8; self.head_bytes];

        while filled + self.frame_bytes <= slot.len() {
            if self.first_frame {
                self.first_frame = false;
            }
            else if !header.is_empty() {
                let read = source.read_to_fill(&mut header)?;
                if read < header.len() {
                    self.drained = true;
                    return Ok(filled);
                }
            }

            let frame = &mut slot[filled..filled + self.frame_bytes];
            let read = source.read_to_fill(frame)?;

            if read < frame.len() {
                self.drained = true;
                return Ok(filled);
            }

            filled += self.frame_bytes;
        }

        Ok(filled)
    }
}


/// Decodes frame payloads and feeds every nonzero pixel to the kernels.
#[derive(Debug)]
pub struct FrameDecoder {
    detector: usize,
    nx: u64,
    nxy: u64,
    total_frames: u64,
    format: PixelFormat,

    /// Raw-format column permutation, identity when absent.
    descramble: Option<Vec<usize>>,

    /// Decoded pixel values of the current frame.
    scratch: Vec<u32>,

    frames_processed: u64,
    events: u64,
}

impl FrameDecoder {

    pub fn new(geometry: ScanGeometry, format: PixelFormat) -> Self {
        let descramble = format.columns_per_flip()
            .map(|flip| descramble_table(geometry.detector, flip.min(geometry.detector)));

        Self {
            detector: geometry.detector,
            nx: geometry.nx as u64,
            nxy: geometry.nxy() as u64,
            total_frames: geometry.total_frames() as u64,
            format,
            descramble,
            scratch: vec![0; geometry.detector * geometry.detector],
            frames_processed: 0,
            events: 0,
        }
    }

    pub fn frames_processed(&self) -> u64 { self.frames_processed }

    /// Unpack one frame payload into the scratch pixel plane.
    fn unpack(&mut self, payload: &[u8]) {
        match self.format {
            PixelFormat::U8 | PixelFormat::R64 { counter_depth: 6 } => {
                for (cell, &byte) in self.scratch.iter_mut().zip(payload) {
                    *cell = byte as u32;
                }
            },

            PixelFormat::U16 | PixelFormat::R64 { counter_depth: 12 } => {
                for (cell, pair) in self.scratch.iter_mut().zip(payload.chunks_exact(2)) {
                    *cell = u16::from_le_bytes([pair[0], pair[1]]) as u32;
                }
            },

            PixelFormat::R64 { .. } => {
                for (byte_index, &byte) in payload.iter().enumerate() {
                    for bit in 0..8 {
                        self.scratch[byte_index * 8 + bit] = ((byte >> bit) & 1) as u32;
                    }
                }
            },
        }

        if let Some(descramble) = &self.descramble {
            for row in self.scratch.chunks_exact_mut(self.detector) {
                let scrambled: Vec<u32> = row.to_vec();
                for (column, value) in row.iter_mut().enumerate() {
                    *value = scrambled[descramble[column]];
                }
            }
        }
    }

    fn process_frame(&mut self, payload: &[u8], kernels: &mut KernelSet) {
        let frame_index = self.frames_processed;

        // the last frame of each row retraces the beam
        let is_flyback = frame_index % self.nx == self.nx - 1;

        if !is_flyback && frame_index < self.total_frames {
            self.unpack(payload);

            let probe_position = frame_index % self.nxy;
            let image_index = (frame_index / self.nxy) as u16;
            let detector = self.detector;

            for (cell, &value) in self.scratch.iter().enumerate() {
                if value == 0 { continue }

                kernels.process(&Event {
                    probe_position,
                    kx: (cell / detector) as u16,
                    ky: (cell % detector) as u16,
                    image_index,
                    toa: 0,
                    tot: 0,
                    weight: value,
                });

                self.events += 1;
            }
        }

        self.frames_processed += 1;
    }
}

impl Decoder for FrameDecoder {

    fn chunk_bytes(&self) -> usize {
        BUFFER_SIZE * self.format.frame_bytes(self.detector)
    }

    fn ring_capacity(&self) -> usize { N_BUFFER }

    fn decode_chunk(&mut self, chunk: &[u8], kernels: &mut KernelSet, progress: &Progress) {
        let frame_bytes = self.format.frame_bytes(self.detector);

        for payload in chunk.chunks_exact(frame_bytes) {
            self.process_frame(payload, kernels);

            // a row only counts as visible once the row after it has begun
            progress.publish_preprocessor_line(self.frames_processed as i64 / self.nx as i64 - 1);
        }

        kernels.finish_chunk();

        if self.frames_processed >= self.total_frames {
            progress.publish_preprocessor_line((self.total_frames / self.nx) as i64);
        }
    }

    fn drain(&mut self, kernels: &mut KernelSet, progress: &Progress) {
        kernels.finish_chunk();
        progress.publish_preprocessor_line((self.total_frames / self.nx) as i64);
    }

    fn events_processed(&self) -> u64 { self.events }
}


/// The raw-format permutation: within every block of `columns_per_flip`
/// columns the pixel order is reversed. Maps scrambled column to true column.
fn descramble_table(detector: usize, columns_per_flip: usize) -> Vec<usize> {
    let mut table = Vec::with_capacity(detector);

    for block in 0..detector / columns_per_flip {
        for column in (block * columns_per_flip .. (block + 1) * columns_per_flip).rev() {
            table.push(column);
        }
    }

    table
}

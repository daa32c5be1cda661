//! Cheetah with per-pixel triggers: instead of deriving the probe column
//! from arrival times, every falling TDC edge advances a probe counter,
//! and a precomputed pattern table maps that counter to a scan position.
//! No dwell time is involved, so the first line is not sacrificed.

use std::path::Path;
use std::sync::Arc;

use bit_field::BitField;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::kernel::KernelSet;
use crate::meta::ScanGeometry;
use crate::progress::Progress;

use super::cheetah::OverflowCorrection;
use super::Decoder;

/// Packets per ring slot, shared with the clock-driven Cheetah.
pub const BUFFER_SIZE: usize = super::cheetah::BUFFER_SIZE;
pub const N_BUFFER: usize = super::cheetah::N_BUFFER;

const PACKET_BYTES: usize = 8;
const TPX3_MAGIC: u32 = u32::from_le_bytes(*b"TPX3");

const ADDRESS_MULTIPLIER: [i32; 4] = [1, -1, -1, 1];
const ADDRESS_BIAS_X: [i32; 4] = [256, 511, 255, 0];
const ADDRESS_BIAS_Y: [i32; 4] = [0, 511, 511, 0];


/// Load a scan pattern: whitespace-separated decimal probe positions.
pub fn load_pattern(path: &Path) -> Result<Arc<Vec<u64>>> {
    let text = std::fs::read_to_string(path)?;

    let pattern = text.split_whitespace()
        .map(|token| {
            // acquisition tools write the indices as floats
            token.parse::<f64>()
                .map(|value| value as u64)
                .map_err(|_| Error::invalid("pattern file holds a non-numeric entry"))
        })
        .collect::<Result<Vec<u64>>>()?;

    if pattern.is_empty() {
        return Err(Error::invalid("pattern file is empty"));
    }

    log::info!("pattern file read, {} positions", pattern.len());
    Ok(Arc::new(pattern))
}


/// The pattern-indexed decode state machine.
#[derive(Debug)]
pub struct PatternDecoder {
    nx: i64,
    ny: i64,
    nxy: i64,
    rep: i64,

    pattern: Arc<Vec<u64>>,

    chip: usize,
    rise_phase: [bool; 4],
    probe_count: [i64; 4],
    most_advanced_count: i64,
    current_line: i64,

    prev_tdc: u64,
    tdc_offset: u64,
    last_tdc_bump_line: i64,
    overflow: Arc<OverflowCorrection>,

    image_index: u16,
    reached_repetitions: bool,

    events: u64,
    corrupt_packets: u64,
}

impl PatternDecoder {

    pub fn new(geometry: ScanGeometry, pattern: Arc<Vec<u64>>) -> Self {
        Self {
            nx: geometry.nx as i64,
            ny: geometry.ny as i64,
            nxy: geometry.nxy() as i64,
            rep: geometry.rep as i64,
            pattern,
            chip: 0,
            rise_phase: [false; 4],
            probe_count: [0; 4],
            most_advanced_count: 0,
            current_line: 0,
            prev_tdc: 0,
            tdc_offset: 0,
            last_tdc_bump_line: 0,
            overflow: OverflowCorrection::new(),
            image_index: 0,
            reached_repetitions: false,
            events: 0,
            corrupt_packets: 0,
        }
    }

    pub fn current_line(&self) -> i64 { self.current_line }

    #[inline]
    fn decode_word(&mut self, word: u64, kernels: &mut KernelSet) {
        if word as u32 == TPX3_MAGIC {
            self.chip = (word.get_bits(32..40) as usize) % 4;
            return;
        }

        match word.get_bits(60..64) {
            0x6 => self.process_tdc(word),

            0xb => {
                if self.rise_phase[self.chip] && !self.reached_repetitions {
                    self.process_event(word, kernels);
                }
            },

            0x4 => log::debug!("global time packet"),

            _ => {
                self.corrupt_packets += 1;
                if self.corrupt_packets == 1 {
                    log::warn!("dropping packets of unknown type");
                }
            },
        }
    }

    #[inline]
    fn process_event(&mut self, word: u64, kernels: &mut KernelSet) {
        let toa = ((((word & 0xFFFF) << 14) + ((word >> 30) & 0x3FFF)) << 4)
            + self.overflow.offset();
        self.overflow.record_toa(toa);

        let index = (self.probe_count[self.chip].rem_euclid(self.nxy)) as usize;
        if index + 1 >= self.pattern.len() { return }

        let probe_position = self.pattern[index];

        let address = word >> 44;
        let raw_x = (((address & 0x0FE00) >> 8) + ((address & 0x00007) >> 2)) as i32;
        let raw_y = (((address & 0x001F8) >> 1) + (address & 0x00003)) as i32;

        let kx = (ADDRESS_MULTIPLIER[self.chip] * raw_x + ADDRESS_BIAS_X[self.chip]) as u16;
        let ky = (ADDRESS_MULTIPLIER[self.chip] * raw_y + ADDRESS_BIAS_Y[self.chip]) as u16;

        kernels.process(&Event {
            probe_position,
            kx, ky,
            image_index: self.image_index,
            toa,
            tot: 0,
            weight: 1,
        });

        self.events += 1;
    }

    fn process_tdc(&mut self, word: u64) {
        let kind = word.get_bits(56..60);
        let time = word.get_bits(9..44);

        match kind {
            15 => {
                self.rise_phase[self.chip] = true;
                self.prev_tdc = self.corrected_tdc(time);
            },

            // every falling edge is one probe position
            10 => {
                self.rise_phase[self.chip] = false;
                self.prev_tdc = self.corrected_tdc(time);
                self.advance_probe();
            },

            _ => {},
        }

        if self.current_line >= self.ny * self.rep {
            self.reached_repetitions = true;
        }
    }

    fn corrected_tdc(&mut self, raw: u64) -> u64 {
        const TDC_OVERFLOW_DROP: u64 = 1 << 34;
        const TDC_OVERFLOW_STEP: u64 = 1 << 35;

        let mut time = raw + self.tdc_offset;

        let wrapped = self.prev_tdc > time + TDC_OVERFLOW_DROP
            && self.current_line > 1
            && self.last_tdc_bump_line != self.current_line;

        if wrapped {
            self.tdc_offset += TDC_OVERFLOW_STEP;
            time += TDC_OVERFLOW_STEP;
            self.last_tdc_bump_line = self.current_line;
            log::warn!("tdc overflow at line {}", self.current_line);
        }

        time
    }

    fn advance_probe(&mut self) {
        self.probe_count[self.chip] += 1;
        let count = self.probe_count[self.chip];

        if self.probe_count.iter().all(|&other| count <= other) {
            self.current_line = count / self.nx;
            self.overflow.set_line(self.current_line);
        }
        else if count >= self.most_advanced_count {
            self.most_advanced_count = count;

            if count % self.nxy == 0 {
                self.image_index = ((count / self.nx) / self.ny) as u16;
            }
        }
    }
}

impl Decoder for PatternDecoder {

    fn chunk_bytes(&self) -> usize { BUFFER_SIZE * PACKET_BYTES }

    fn ring_capacity(&self) -> usize { N_BUFFER }

    fn decode_chunk(&mut self, chunk: &[u8], kernels: &mut KernelSet, progress: &Progress) {
        let mut published = self.current_line;

        for packet in chunk.chunks_exact(PACKET_BYTES) {
            let word = u64::from_le_bytes([
                packet[0], packet[1], packet[2], packet[3],
                packet[4], packet[5], packet[6], packet[7],
            ]);

            self.decode_word(word, kernels);

            if self.current_line > published {
                published = self.current_line;
                progress.publish_preprocessor_line(published);
            }
        }

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
        self.overflow.check();
    }

    fn drain(&mut self, kernels: &mut KernelSet, progress: &Progress) {
        self.reached_repetitions = true;
        self.current_line = self.ny * self.rep;

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
    }

    fn events_processed(&self) -> u64 { self.events }

    fn overflow_correction(&self) -> Option<Arc<OverflowCorrection>> {
        Some(Arc::clone(&self.overflow))
    }
}

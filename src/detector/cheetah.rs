//! Quad-chip Cheetah Timepix3 decoder.
//!
//! The stream is a sequence of 64-bit words of four kinds: a chip header
//! selecting which quadrant the following words belong to, TDC rise and
//! fall pulses marking scan line boundaries, electron events, and global
//! time words. Events are only valid while their chip is inside an active
//! line (between rise and fall); the probe column follows from the time of
//! arrival relative to the line's rise, the probe row from the per-chip
//! line counter.
//!
//! Both the 34-bit event clock and the 35-bit TDC clock wrap within long
//! acquisitions. Wraps are detected as large backwards jumps and corrected
//! by bumping a monotonic offset, at most once per scan line.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bit_field::BitField;

use crate::event::Event;
use crate::kernel::KernelSet;
use crate::meta::ScanGeometry;
use crate::progress::Progress;

use super::Decoder;

/// Packets per ring slot.
pub const BUFFER_SIZE: usize = 4096;

/// Ring slots.
pub const N_BUFFER: usize = 2048;

const PACKET_BYTES: usize = 8;

/// Low 32 bits of a chip header word.
const TPX3_MAGIC: u32 = u32::from_le_bytes(*b"TPX3");

/// Per-chip transform from address bits to detector coordinates:
/// each quadrant is mirrored and shifted into its place.
const ADDRESS_MULTIPLIER: [i32; 4] = [1, -1, -1, 1];
const ADDRESS_BIAS_X: [i32; 4] = [256, 511, 255, 0];
const ADDRESS_BIAS_Y: [i32; 4] = [0, 511, 511, 0];

/// A drop of more than half the 33-bit tick range means the event clock
/// wrapped; each wrap is worth a step of the full range.
const TOA_OVERFLOW_DROP: u64 = 1 << 32;
const TOA_OVERFLOW_STEP: u64 = 1 << 34;

const TDC_OVERFLOW_DROP: u64 = 1 << 34;
const TDC_OVERFLOW_STEP: u64 = 1 << 35;


/// Shared state of the event clock overflow correction. The decoder
/// records every decoded time of arrival; the watcher thread and the
/// per-chunk check compare consecutive arrivals and bump the offset when
/// the clock wrapped. Racing checks at worst duplicate a comparison,
/// never corrupt the offset.
#[derive(Debug, Default)]
pub struct OverflowCorrection {
    last_toa: AtomicU64,
    prev_toa: AtomicU64,
    offset: AtomicU64,
    current_line: AtomicI64,
    last_bumped_line: AtomicI64,
}

impl OverflowCorrection {

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn record_toa(&self, toa: u64) {
        self.last_toa.store(toa, Ordering::Relaxed);
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_line(&self, line: i64) {
        self.current_line.store(line, Ordering::Relaxed);
    }

    /// Compare the most recent arrival with the previous one and bump the
    /// offset on a wrap. Bumps at most once per scan line, and never
    /// within the first line, where arrivals are still settling.
    pub fn check(&self) {
        let toa = self.last_toa.load(Ordering::Relaxed);
        let prev = self.prev_toa.load(Ordering::Relaxed);
        let line = self.current_line.load(Ordering::Relaxed);

        let wrapped = prev > toa.saturating_add(TOA_OVERFLOW_DROP)
            && line > 1
            && self.last_bumped_line.load(Ordering::Relaxed) != line;

        if wrapped {
            self.offset.fetch_add(TOA_OVERFLOW_STEP, Ordering::Relaxed);
            self.last_bumped_line.store(line, Ordering::Relaxed);
            log::warn!("toa overflow at line {}", line);
        }

        self.prev_toa.store(toa, Ordering::Relaxed);
    }
}


/// The decode state machine for one acquisition.
#[derive(Debug)]
pub struct CheetahDecoder {
    nx: u64,
    ny: i64,
    rep: i64,

    /// Probe dwell in 1.5625 ns ticks, refreshed from every line interval.
    dwell_ticks: u64,

    /// Extract the time-over-threshold field and thread it into events.
    with_tot: bool,

    chip: usize,
    rise_time: [u64; 4],
    fall_time: [u64; 4],
    rise_phase: [bool; 4],
    line_count: [i64; 4],
    most_advanced_line: i64,
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

impl CheetahDecoder {

    pub fn new(geometry: ScanGeometry, with_tot: bool) -> Self {
        // event ticks are 25/16 ns each
        let dwell_ticks = geometry.dwell_ns * 16 / 25;

        if dwell_ticks == 0 {
            log::warn!("dwell time not provided, sacrificing the first line");
        }

        Self {
            nx: geometry.nx as u64,
            ny: geometry.ny as i64,
            rep: geometry.rep as i64,
            dwell_ticks,
            with_tot,
            chip: 0,
            rise_time: [0; 4],
            fall_time: [0; 4],
            rise_phase: [false; 4],
            line_count: [0; 4],
            most_advanced_line: 0,
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

    pub fn line_counts(&self) -> [i64; 4] { self.line_count }

    pub fn reached_repetitions(&self) -> bool { self.reached_repetitions }

    /// Run the overflow comparison inline, as the per-chunk check does.
    pub fn check_toa_overflow(&self) {
        self.overflow.check();
    }

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
        let mut toa = (((word & 0xFFFF) << 14) + ((word >> 30) & 0x3FFF)) << 4;

        let mut tot = 0_u16;
        if self.with_tot {
            // the fine timestamp counts backwards from the coarse one
            toa = toa.wrapping_sub((word >> 16) & 0xF);
            tot = ((word >> 20) & 0x3FF) as u16;
        }

        toa = toa.wrapping_add(self.overflow.offset());
        self.overflow.record_toa(toa);

        // no dwell known yet: drop the event, the first line pays for it
        if self.dwell_ticks == 0 { return }

        let column = toa.wrapping_sub(self.rise_time[self.chip] * 2) / self.dwell_ticks;
        if column >= self.nx { return } // flyback gap

        let row = self.line_count[self.chip].rem_euclid(self.ny) as u64;
        let probe_position = row * self.nx + column;

        let address = word >> 44;
        let raw_x = (((address & 0x0FE00) >> 8) + ((address & 0x00007) >> 2)) as i32;
        let raw_y = (((address & 0x001F8) >> 1) + (address & 0x00003)) as i32;

        let kx = (ADDRESS_MULTIPLIER[self.chip] * raw_x + ADDRESS_BIAS_X[self.chip]) as u16;
        let ky = (ADDRESS_MULTIPLIER[self.chip] * raw_y + ADDRESS_BIAS_Y[self.chip]) as u16;

        // the decluster stage compares arrivals in nanoseconds when the
        // time over threshold path is active
        let event_toa = if self.with_tot { toa * 25 / 16 } else { toa };

        kernels.process(&Event {
            probe_position,
            kx, ky,
            image_index: self.image_index,
            toa: event_toa,
            tot,
            weight: 1,
        });

        self.events += 1;
    }

    fn process_tdc(&mut self, word: u64) {
        let kind = word.get_bits(56..60);
        let time = word.get_bits(9..44);

        match kind {
            // rise: the chip enters its active line
            15 => {
                self.rise_phase[self.chip] = true;
                self.rise_time[self.chip] = self.corrected_tdc(time);
                self.prev_tdc = self.rise_time[self.chip];
            },

            // fall: the line is over, advance the per-chip counter
            10 => {
                self.rise_phase[self.chip] = false;
                self.fall_time[self.chip] = self.corrected_tdc(time);
                self.prev_tdc = self.fall_time[self.chip];

                self.advance_line();

                let line_interval =
                    self.fall_time[self.chip].saturating_sub(self.rise_time[self.chip]) * 2;

                if line_interval > 0 {
                    self.dwell_ticks = line_interval / self.nx;
                }
            },

            _ => {},
        }

        if self.current_line >= self.ny * self.rep {
            self.reached_repetitions = true;
        }
    }

    /// Apply the TDC overflow offset, bumping it when this timestamp
    /// dropped by more than half the clock range.
    fn corrected_tdc(&mut self, raw: u64) -> u64 {
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

    /// The current line is the slowest chip's count; the fastest chip
    /// crossing an image boundary selects the next image.
    fn advance_line(&mut self) {
        self.line_count[self.chip] += 1;
        let count = self.line_count[self.chip];

        if self.line_count.iter().all(|&other| count <= other) {
            self.current_line = count;
            self.overflow.set_line(count);
        }
        else if count >= self.most_advanced_line {
            self.most_advanced_line = count;

            if count % self.ny == 0 {
                self.image_index = (count / self.ny) as u16;
            }
        }
    }
}

impl Decoder for CheetahDecoder {

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

            // make finished lines visible as soon as the slowest chip
            // confirms them, not just at chunk boundaries
            if self.current_line > published {
                published = self.current_line;
                progress.publish_preprocessor_line(published);
            }
        }

        if self.reached_repetitions {
            self.image_index = self.rep as u16;
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

        if self.corrupt_packets > 1 {
            log::warn!("dropped {} packets of unknown type", self.corrupt_packets);
        }
    }

    fn events_processed(&self) -> u64 { self.events }

    fn overflow_correction(&self) -> Option<Arc<OverflowCorrection>> {
        Some(Arc::clone(&self.overflow))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::image::SharedImage;
    use crate::kernel::{EventKernel, KernelSet, Pacbed};

    pub fn header_word(chip: usize) -> u64 {
        TPX3_MAGIC as u64 | ((chip as u64) << 32)
    }

    pub fn tdc_word(rise: bool, time_ticks: u64) -> u64 {
        let kind: u64 = if rise { 15 } else { 10 };
        (0x6 << 60) | (kind << 56) | ((time_ticks & 0x7FFFFFFFF) << 9)
    }

    /// Build an event word for chip 3, where the address transform is the
    /// identity. The time of arrival must be a multiple of 16 ticks.
    pub fn event_word(toa_ticks: u64, kx: u16, ky: u16) -> u64 {
        assert_eq!(toa_ticks % 16, 0);
        let value = toa_ticks >> 4;

        let coarse = (value >> 14) & 0xFFFF;
        let fine = value & 0x3FFF;

        let address = (((kx as u64) >> 1) << 9)
            | (((kx as u64) & 1) << 2)
            | (((ky as u64) >> 2) << 3)
            | ((ky as u64) & 3);

        (0xb << 60) | (address << 44) | (fine << 30) | coarse
    }

    fn geometry() -> crate::meta::ScanGeometry {
        crate::meta::ScanGeometry { nx: 16, ny: 16, rep: 1, dwell_ns: 1000, detector: 512 }
    }

    fn pacbed_kernels() -> (KernelSet, SharedImage) {
        let kernel = Pacbed::new(geometry());
        let pattern = kernel.pattern.clone();
        (KernelSet::single(EventKernel::Pacbed(kernel)), pattern)
    }

    fn chunk_of(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    #[test]
    fn event_word_roundtrips_address(){
        // decode the address bits the way the event path does
        let word = event_word(160, 300, 41);
        let address = word >> 44;

        let raw_x = ((address & 0x0FE00) >> 8) + ((address & 0x00007) >> 2);
        let raw_y = ((address & 0x001F8) >> 1) + (address & 0x00003);

        assert_eq!(raw_x, 300);
        assert_eq!(raw_y, 41);
    }

    #[test]
    fn events_require_an_active_line(){
        let (mut kernels, pattern) = pacbed_kernels();
        let mut decoder = CheetahDecoder::new(geometry(), false);
        let progress = Progress::new();

        // dwell 1000 ns = 640 ticks; an event before any rise is dropped
        let words = [
            header_word(3),
            event_word(320, 10, 10),
            tdc_word(true, 0),
            event_word(320, 10, 10),
            tdc_word(false, 16 * 640 / 2),
            event_word(320, 10, 10), // after the fall, dropped again
        ];

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(pattern.sum(), 1);
        assert_eq!(decoder.events_processed(), 1);
    }

    #[test]
    fn flyback_columns_never_land(){
        let (mut kernels, pattern) = pacbed_kernels();
        let mut decoder = CheetahDecoder::new(geometry(), false);
        let progress = Progress::new();

        // column = toa / 640; nx = 16, so toa of 16 * 640 is out of range
        let words = [
            header_word(3),
            tdc_word(true, 0),
            event_word(16 * 640, 10, 10),
            event_word(15 * 640, 10, 10),
        ];

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(pattern.sum(), 1);
    }

    #[test]
    fn line_advances_with_the_slowest_chip(){
        let (mut kernels, _) = pacbed_kernels();
        let mut decoder = CheetahDecoder::new(geometry(), false);
        let progress = Progress::new();

        let mut words = Vec::new();
        for chip in 0..3 {
            words.push(header_word(chip));
            words.push(tdc_word(true, 100));
            words.push(tdc_word(false, 5220));
        }

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);

        // three chips finished a line, the fourth has not
        assert_eq!(decoder.current_line(), 0);
        assert_eq!(progress.preprocessor_line(), 0);

        let words = [header_word(3), tdc_word(true, 100), tdc_word(false, 5220)];
        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);

        assert_eq!(decoder.current_line(), 1);
        assert_eq!(decoder.line_counts(), [1, 1, 1, 1]);
        assert_eq!(progress.preprocessor_line(), 1);
    }

    #[test]
    fn zero_dwell_sacrifices_the_first_line(){
        let (mut kernels, pattern) = pacbed_kernels();
        let mut geometry = geometry();
        geometry.dwell_ns = 0;

        let mut decoder = CheetahDecoder::new(geometry, false);
        let progress = Progress::new();

        // nx = 16 columns at 640 ticks each: fall - rise = 16 * 640 / 2
        let words = [
            header_word(3),
            tdc_word(true, 0),
            event_word(320, 10, 10), // dropped, dwell still unknown
            tdc_word(false, 16 * 640 / 2),
            tdc_word(true, 20_000),
            event_word(2 * 20_000 + 320, 10, 10), // second line, dwell known
        ];

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(pattern.sum(), 1);
    }

    #[test]
    fn quadrants_map_into_their_corner(){
        let (mut kernels, pattern) = pacbed_kernels();
        let mut decoder = CheetahDecoder::new(geometry(), false);
        let progress = Progress::new();

        // chip 0 transforms raw (0, 0) to (256, 0)
        let words = [
            header_word(0),
            tdc_word(true, 0),
            event_word(320, 0, 0),
        ];

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(pattern.get(256 * 512), 1);
    }

    #[test]
    fn toa_overflow_is_an_affine_fixup(){
        let correction = OverflowCorrection::new();
        correction.set_line(5);

        // ground truth arrivals increase past the 34-bit range
        let truth: Vec<u64> = (0..6).map(|i| (1 << 33) + i * (1 << 32)).collect();
        let mut reconstructed = Vec::new();

        for &toa in &truth {
            let wrapped = toa % (1 << 34);
            let corrected = wrapped + correction.offset();
            correction.record_toa(corrected);
            correction.check();
            reconstructed.push(corrected);
        }

        // every arrival is reconstructed exactly, except the single event
        // that triggered the wrap detection
        for (index, (&truth_toa, &reconstructed_toa)) in truth.iter().zip(&reconstructed).enumerate() {
            if index != 2 {
                assert_eq!(reconstructed_toa, truth_toa, "arrival {}", index);
            }
        }

        assert_eq!(correction.offset(), TOA_OVERFLOW_STEP);
    }

    #[test]
    fn unknown_packets_are_dropped(){
        let (mut kernels, pattern) = pacbed_kernels();
        let mut decoder = CheetahDecoder::new(geometry(), false);
        let progress = Progress::new();

        let words = [0_u64, 0x1 << 60, 0x4 << 60];
        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(pattern.sum(), 0);
    }

    #[test]
    fn tot_field_is_extracted(){
        let geometry = geometry();
        let window = crate::meta::RoiWindow::full(geometry);
        let roi = crate::kernel::Roi::new(window, geometry, true);
        let diffraction = roi.diffraction.clone();
        let mut kernels = KernelSet::single(EventKernel::Roi(roi));

        let mut decoder = CheetahDecoder::new(geometry, true);
        let progress = Progress::new();

        let tot: u64 = 77;
        let words = [
            header_word(3),
            tdc_word(true, 0),
            event_word(320, 10, 10) | (tot << 20),
        ];

        decoder.decode_chunk(&chunk_of(&words), &mut kernels, &progress);
        assert_eq!(diffraction.get(10 * 512 + 10), 77);
    }
}

//! AdvaPix Timepix3 decoder: packed 24-byte records with a pre-assembled
//! 64-bit arrival time, so no overflow correction is needed. The probe
//! position is derived purely from time and dwell.

use crate::event::Event;
use crate::kernel::KernelSet;
use crate::meta::ScanGeometry;
use crate::progress::Progress;

use super::Decoder;

/// Packets per ring slot.
pub const BUFFER_SIZE: usize = 14400;

/// Ring slots.
pub const N_BUFFER: usize = 1024;

/// `{ index: u32, toa: u64, overflow: u8, ftoa: u8, tot: u16 }`, packed.
pub const PACKET_BYTES: usize = 16;

/// Dwell fallback when the host provides none.
const DEFAULT_DWELL_NS: u64 = 1000;


/// One parsed record.
#[derive(Debug, Clone, Copy)]
struct Record {
    index: u32,
    toa: u64,
    tot: u16,
}

impl Record {

    #[inline]
    fn parse(bytes: &[u8]) -> Self {
        Self {
            index: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            toa: u64::from_le_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7],
                bytes[8], bytes[9], bytes[10], bytes[11],
            ]),
            // overflow and fine time of arrival at 12 and 13 are unused
            tot: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }
}


/// The time-derived decode state.
#[derive(Debug)]
pub struct AdvapixDecoder {
    nx: u64,
    nxy: u64,
    rep: u64,
    detector: u32,
    dwell_ns: u64,

    current_line: i64,
    reached_repetitions: bool,
    events: u64,
}

impl AdvapixDecoder {

    pub fn new(geometry: ScanGeometry) -> Self {
        let mut dwell_ns = geometry.dwell_ns;
        if dwell_ns == 0 {
            log::warn!("dwell time not provided, assuming {} ns", DEFAULT_DWELL_NS);
            dwell_ns = DEFAULT_DWELL_NS;
        }

        Self {
            nx: geometry.nx as u64,
            nxy: geometry.nxy() as u64,
            rep: geometry.rep as u64,
            detector: geometry.detector as u32,
            dwell_ns,
            current_line: 0,
            reached_repetitions: false,
            events: 0,
        }
    }

    pub fn current_line(&self) -> i64 { self.current_line }

    #[inline]
    fn process_record(&mut self, record: Record, kernels: &mut KernelSet, progress: &Progress) {
        // arrival ticks are 25 ns each
        let probe_position_total = record.toa * 25 / self.dwell_ns;

        if probe_position_total >= self.nxy * self.rep {
            self.reached_repetitions = true;
            return;
        }

        // arrivals are time ordered, so earlier rows are complete once
        // this row is reached; publish before the kernel call so kernels
        // with write-side backpressure can wait for the reducer
        let line = (probe_position_total / self.nx) as i64;
        if line > self.current_line {
            self.current_line = line;
            progress.publish_preprocessor_line(line);
        }

        kernels.process(&Event {
            probe_position: probe_position_total % self.nxy,
            kx: (record.index % self.detector) as u16,
            ky: (record.index / self.detector) as u16,
            image_index: (probe_position_total / self.nxy) as u16,
            toa: record.toa * 25,
            tot: record.tot,
            weight: 1,
        });

        self.events += 1;
    }
}

impl Decoder for AdvapixDecoder {

    fn chunk_bytes(&self) -> usize { BUFFER_SIZE * PACKET_BYTES }

    fn ring_capacity(&self) -> usize { N_BUFFER }

    fn decode_chunk(&mut self, chunk: &[u8], kernels: &mut KernelSet, progress: &Progress) {
        for packet in chunk.chunks_exact(PACKET_BYTES) {
            if self.reached_repetitions { break }
            self.process_record(Record::parse(packet), kernels, progress);
        }

        if self.reached_repetitions {
            self.current_line = (self.nxy * self.rep / self.nx) as i64;
        }

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
    }

    fn drain(&mut self, kernels: &mut KernelSet, progress: &Progress) {
        self.reached_repetitions = true;
        self.current_line = (self.nxy * self.rep / self.nx) as i64;

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
    }

    fn events_processed(&self) -> u64 { self.events }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::{CenterOfMass, EventKernel, KernelSet};

    fn geometry() -> ScanGeometry {
        ScanGeometry { nx: 8, ny: 8, rep: 2, dwell_ns: 1000, detector: 256 }
    }

    pub fn record_bytes(index: u32, toa: u64, tot: u16) -> [u8; PACKET_BYTES] {
        let mut bytes = [0_u8; PACKET_BYTES];
        bytes[0..4].copy_from_slice(&index.to_le_bytes());
        bytes[4..12].copy_from_slice(&toa.to_le_bytes());
        bytes[14..16].copy_from_slice(&tot.to_le_bytes());
        bytes
    }

    #[test]
    fn positions_follow_the_clock(){
        let mut decoder = AdvapixDecoder::new(geometry());
        let progress = Progress::new();

        let kernel = CenterOfMass::new(geometry());
        let dose = kernel.dose.clone();
        let mut kernels = KernelSet::single(EventKernel::CenterOfMass(kernel));

        // dwell 1000 ns = 40 ticks per probe position
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&record_bytes(3 + 5 * 256, 0, 0));
        chunk.extend_from_slice(&record_bytes(0, 40, 0));
        chunk.extend_from_slice(&record_bytes(0, 41, 0));
        chunk.extend_from_slice(&record_bytes(0, 63 * 40, 0));

        decoder.decode_chunk(&chunk, &mut kernels, &progress);

        assert_eq!(dose.slot(0).get(0), 1);
        assert_eq!(dose.slot(0).get(1), 2);
        assert_eq!(dose.slot(0).get(63), 1);
        assert_eq!(decoder.current_line(), 7);
        assert_eq!(progress.preprocessor_line(), 7);
    }

    #[test]
    fn detector_coordinates_unpack_from_the_index(){
        let mut decoder = AdvapixDecoder::new(geometry());
        let progress = Progress::new();

        let kernel = crate::kernel::Pacbed::new(geometry());
        let pattern = kernel.pattern.clone();
        let mut kernels = KernelSet::single(EventKernel::Pacbed(kernel));

        let chunk = record_bytes(7 + 9 * 256, 0, 0);
        decoder.decode_chunk(&chunk, &mut kernels, &progress);

        // index = ky * 256 + kx, the pacbed plane is kx major
        assert_eq!(pattern.get(7 * 256 + 9), 1);
    }

    #[test]
    fn repetition_gate_stops_the_stream(){
        let geometry = geometry();
        let mut decoder = AdvapixDecoder::new(geometry);
        let progress = Progress::new();

        let kernel = CenterOfMass::new(geometry);
        let dose = kernel.dose.clone();
        let mut kernels = KernelSet::single(EventKernel::CenterOfMass(kernel));

        // two images of 64 probes; a record at probe 128 is one too far
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&record_bytes(0, 127 * 40, 0));
        chunk.extend_from_slice(&record_bytes(0, 128 * 40, 0));
        chunk.extend_from_slice(&record_bytes(0, 10 * 40, 0));

        decoder.decode_chunk(&chunk, &mut kernels, &progress);

        assert_eq!(dose.slot(1).get(63), 1);
        assert_eq!(dose.slot(0).get(10), 0); // nothing after the gate
        assert_eq!(progress.preprocessor_line(), 16);
    }
}

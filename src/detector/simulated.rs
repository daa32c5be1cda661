//! Replay of a simulated electron stream: the 10-byte records carry their
//! scan position explicitly, so decoding is pure unpacking.

use crate::event::{ElectronRecord, Event};
use crate::kernel::KernelSet;
use crate::meta::ScanGeometry;
use crate::progress::Progress;

use super::Decoder;

/// Records per ring slot; slots this large keep the replay rate close to
/// the memory bandwidth.
pub const BUFFER_SIZE: usize = 115_200;

/// Ring slots.
pub const N_BUFFER: usize = 8;

const PACKET_BYTES: usize = ElectronRecord::BYTE_SIZE;


#[derive(Debug)]
pub struct SimulatedDecoder {
    nx: u64,
    ny: u64,
    rep: u16,

    current_line: i64,
    reached_repetitions: bool,
    events: u64,
}

impl SimulatedDecoder {

    pub fn new(geometry: ScanGeometry) -> Self {
        Self {
            nx: geometry.nx as u64,
            ny: geometry.ny as u64,
            rep: geometry.rep as u16,
            current_line: 0,
            reached_repetitions: false,
            events: 0,
        }
    }

    pub fn current_line(&self) -> i64 { self.current_line }

    #[inline]
    fn process_record(&mut self, record: ElectronRecord, kernels: &mut KernelSet, progress: &Progress) {
        // the stream terminator and anything beyond the configured
        // repetitions ends the replay
        if record.image_index >= self.rep {
            self.reached_repetitions = true;
            return;
        }

        // records arrive in scan order, so reaching this row means every
        // earlier row is complete; publishing before the kernel call lets
        // kernels with write-side backpressure wait for the reducer
        let line = (record.ry as u64 + self.ny * record.image_index as u64) as i64;
        if line > self.current_line {
            self.current_line = line;
            progress.publish_preprocessor_line(line);
        }

        kernels.process(&Event {
            probe_position: record.ry as u64 * self.nx + record.rx as u64,
            kx: record.kx,
            ky: record.ky,
            image_index: record.image_index,
            toa: 0,
            tot: 0,
            weight: 1,
        });

        self.events += 1;
    }
}

impl Decoder for SimulatedDecoder {

    fn chunk_bytes(&self) -> usize { BUFFER_SIZE * PACKET_BYTES }

    fn ring_capacity(&self) -> usize { N_BUFFER }

    fn decode_chunk(&mut self, chunk: &[u8], kernels: &mut KernelSet, progress: &Progress) {
        for packet in chunk.chunks_exact(PACKET_BYTES) {
            if self.reached_repetitions { break }

            let mut bytes = [0_u8; PACKET_BYTES];
            bytes.copy_from_slice(packet);
            self.process_record(ElectronRecord::from_bytes(&bytes), kernels, progress);
        }

        if self.reached_repetitions {
            self.current_line = (self.ny * self.rep as u64) as i64;
        }

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
    }

    fn drain(&mut self, kernels: &mut KernelSet, progress: &Progress) {
        self.reached_repetitions = true;
        self.current_line = (self.ny * self.rep as u64) as i64;

        kernels.finish_chunk();
        progress.publish_preprocessor_line(self.current_line);
    }

    fn events_processed(&self) -> u64 { self.events }
}

//! Detector families and the worker pipeline they share.
//!
//! A family contributes two small objects: a `ChunkReader` that knows how
//! to fill one ring slot from the byte source (frame cameras skip per-frame
//! headers here), and a `Decoder` that turns a filled slot into events and
//! drives the aggregation kernels. The pipeline below owns the threads:
//!
//! ```text
//! read worker:    source -> ring
//! process worker: ring -> decoder -> kernels, publishes preprocessor line
//! watch worker:   timepix counter overflow surveillance (optional)
//! calling thread: the reducer driver
//! ```

pub mod cheetah;
pub mod pattern;
pub mod advapix;
pub mod simulated;
pub mod frame;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result, UnitResult};
use crate::kernel::KernelSet;
use crate::progress::Progress;
use crate::ring::PacketRing;
use crate::transport::ByteSource;

pub use cheetah::{CheetahDecoder, OverflowCorrection};
pub use advapix::AdvapixDecoder;
pub use pattern::PatternDecoder;
pub use simulated::SimulatedDecoder;
pub use frame::{FrameDecoder, FrameReader, PixelFormat};


/// Fills one ring slot from the byte source.
pub trait ChunkReader: Send {

    /// Read up to `slot.len()` payload bytes. Returns how many bytes were
    /// written; zero signals that the source is drained. Implementations
    /// must only return whole packets or frames.
    fn read_chunk(&mut self, source: &mut dyn ByteSource, slot: &mut [u8]) -> Result<usize>;
}

/// Reads raw fixed-size packets with no framing, truncating the trailing
/// partial packet of a finished stream.
#[derive(Debug)]
pub struct RawChunkReader {
    packet_bytes: usize,
    drained: bool,
}

impl RawChunkReader {
    pub fn new(packet_bytes: usize) -> Self {
        Self { packet_bytes, drained: false }
    }
}

impl ChunkReader for RawChunkReader {
    fn read_chunk(&mut self, source: &mut dyn ByteSource, slot: &mut [u8]) -> Result<usize> {
        if self.drained { return Ok(0) }

        let read = source.read_to_fill(slot)?;
        if read < slot.len() { self.drained = true }

        Ok(read - read % self.packet_bytes)
    }
}


/// Decodes filled ring slots into kernel calls.
/// Capability set per family: decode one chunk, drain at end of stream,
/// report the event count.
pub trait Decoder: Send {

    /// Bytes per ring slot.
    fn chunk_bytes(&self) -> usize;

    /// Number of ring slots.
    fn ring_capacity(&self) -> usize;

    /// Decode one chunk, call the kernels once per event, and publish the
    /// preprocessor line. Corrupt packets are dropped, never fatal.
    fn decode_chunk(&mut self, chunk: &[u8], kernels: &mut KernelSet, progress: &Progress);

    /// The stream has ended; publish the final line so the reducer can
    /// finish the remaining rows.
    fn drain(&mut self, kernels: &mut KernelSet, progress: &Progress);

    /// Decoded events so far.
    fn events_processed(&self) -> u64;

    /// State for the overflow watcher thread, on families that need one.
    fn overflow_correction(&self) -> Option<Arc<OverflowCorrection>> { None }
}


/// What the pipeline hands back after every worker has joined.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub kernels: KernelSet,
    pub events_processed: u64,

    /// Events per second over the lifetime of the pipeline.
    pub processing_rate: f32,
}

/// Run the full worker pipeline. The reducer closure runs on the calling
/// thread and normally ends the run by setting the processor line to the
/// end sentinel; the workers observe that and join. A transport failure
/// aborts the run and surfaces here.
pub fn run_pipeline<D: Decoder>(
    mut decoder: D,
    mut reader: Box<dyn ChunkReader>,
    mut source: Box<dyn ByteSource>,
    mut kernels: KernelSet,
    progress: &Arc<Progress>,
    reducer: impl FnOnce() -> UnitResult,
) -> Result<PipelineOutcome> {
    let ring = PacketRing::new(decoder.ring_capacity(), decoder.chunk_bytes());
    let source_drained = AtomicBool::new(false);
    let transport_error = Mutex::new(None);
    let overflow = decoder.overflow_correction();
    let started = Instant::now();

    let outcome = std::thread::scope(|scope| -> Result<PipelineOutcome> {
        let ring = &ring;
        let source_drained = &source_drained;
        let transport_error = &transport_error;
        let progress = &**progress;

        scope.spawn(move || {
            loop {
                if progress.is_cancelled() { break }

                let mut failure = None;
                let published = ring.produce(progress, |slot| {
                    match reader.read_chunk(&mut *source, slot) {
                        Ok(payload) => payload,
                        Err(error) => {
                            failure = Some(error);
                            0
                        },
                    }
                });

                if let Some(error) = failure {
                    log::error!("transport failed: {}", error);
                    *transport_error.lock().expect("transport error poisoned") = Some(error);
                    progress.request_quit();
                    break;
                }

                if !published { break }
            }

            source_drained.store(true, Ordering::Release);
        });

        let process_worker = scope.spawn(move || {
            loop {
                let decoder = &mut decoder;
                let kernels_here = &mut kernels;

                let consumed = ring.consume(
                    progress,
                    || source_drained.load(Ordering::Acquire),
                    |chunk| decoder.decode_chunk(chunk, kernels_here, progress),
                );

                if !consumed { break }
            }

            if !progress.quit_requested() {
                decoder.drain(&mut kernels, progress);
            }

            (decoder, kernels)
        });

        if let Some(correction) = overflow {
            scope.spawn(move || {
                while !progress.is_cancelled() {
                    correction.check();
                    std::thread::sleep(Duration::from_micros(10));
                }
            });
        }

        let reducer_result = reducer();

        // whatever the reducer decided, end the run so every worker exits
        progress.complete();

        let (decoder, kernels) = process_worker.join()
            .map_err(|_| Error::invalid("process worker panicked"))?;

        reducer_result?;

        if let Some(error) = transport_error.lock().expect("transport error poisoned").take() {
            return Err(error);
        }

        let elapsed = started.elapsed().as_secs_f32().max(f32::EPSILON);
        let events_processed = decoder.events_processed();

        Ok(PipelineOutcome {
            kernels,
            events_processed,
            processing_rate: events_processed as f32 / elapsed,
        })
    })?;

    log::info!(
        "{} events processed at {:.2} M events/s",
        outcome.events_processed, outcome.processing_rate / 1e6,
    );

    Ok(outcome)
}

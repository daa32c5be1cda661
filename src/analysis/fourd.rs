//! Compressed 4D capture: accumulate binned diffraction patterns into two
//! alternating chunk buffers and flush each full chunk into the container
//! as the reducer crosses its boundary.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result, UnitResult};
use crate::fourd::{ChunkPair, ContainerLayout, ContainerWriter, CountSample};
use crate::image::SharedImage;
use crate::kernel::{ChunkedFourD, EventKernel, IntoChunkStore, KernelSet};
use crate::meta::{validate_fourd_output, CameraSetup, RunOptions};
use crate::progress::Progress;

use super::{run_camera, LineDriver, LineHandler, RunDiagnostics};


/// Output encoding of the 4D capture.
#[derive(Debug, Clone)]
pub struct FourDOutput {
    pub path: PathBuf,
    pub scan_bin: usize,
    pub det_bin: usize,

    /// Scan rows per chunk, before binning.
    pub chunksize: usize,

    pub deflate_level: u8,
}

#[derive(Debug)]
pub struct FourDResults {

    /// Scan-binned dose map.
    pub dose: SharedImage,

    pub diagnostics: RunDiagnostics,
}

/// The 4D capture at a given bit depth; use the `u8`/`u16`/`u32`
/// instantiations as the bit depth option selects.
#[derive(Debug)]
pub struct FourDRun<T> {
    pub setup: CameraSetup,
    pub options: RunOptions,
    pub output: FourDOutput,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,

    sample: std::marker::PhantomData<T>,
}

impl<T: IntoChunkStore> FourDRun<T> {

    pub fn new(setup: CameraSetup, options: RunOptions, output: FourDOutput) -> Self {
        Self { setup, options, output, progress: Arc::new(Progress::new()), sample: std::marker::PhantomData }
    }

    pub fn run(&mut self) -> Result<FourDResults> {
        let geometry = self.setup.geometry;

        validate_fourd_output(
            geometry, self.output.scan_bin, self.output.det_bin,
            self.output.chunksize, T::BIT_DEPTH as usize, self.output.deflate_level,
        )?;

        if geometry.rep != 1 {
            return Err(Error::unsupported("4D capture records a single repetition"));
        }

        let layout = ContainerLayout {
            shape: [
                geometry.ny / self.output.scan_bin,
                geometry.nx / self.output.scan_bin,
                geometry.detector / self.output.det_bin,
                geometry.detector / self.output.det_bin,
            ],
            chunk_rows: self.output.chunksize / self.output.scan_bin,
            bit_depth: T::BIT_DEPTH,
            deflate_level: self.output.deflate_level,
        };

        // opening the container is fatal before any processing
        let file = BufWriter::new(File::create(&self.output.path)?);
        let writer = ContainerWriter::new(file, layout)?;

        let pair = ChunkPair::<T>::zeroed(layout.samples_per_chunk());
        let progress = Arc::clone(&self.progress);
        progress.reset();

        let kernel = ChunkedFourD::new(
            T::into_store(pair.clone()), geometry,
            self.output.scan_bin, self.output.det_bin, self.output.chunksize,
            Arc::clone(&progress),
        );

        let dose = kernel.dose.clone();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());

        let mut handler = ChunkFlush {
            pair,
            writer: Some(writer),
            chunksize: self.output.chunksize,
            chunk_count: layout.chunk_count(),
            next_chunk: 0,
        };

        let outcome = run_camera(
            &self.setup,
            KernelSet::single(EventKernel::ChunkedFourD(kernel)),
            &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(FourDResults { dose, diagnostics })
    }
}


/// Flushes chunk buffers into the container at chunk boundaries.
#[derive(Debug)]
struct ChunkFlush<T: CountSample> {
    pair: ChunkPair<T>,
    writer: Option<ContainerWriter<BufWriter<File>>>,
    chunksize: usize,
    chunk_count: usize,
    next_chunk: usize,
}

impl<T: CountSample> ChunkFlush<T> {

    /// Take the chunk's mutex, write the buffer, and zero it for reuse.
    fn flush_chunk(&mut self, chunk_index: usize) -> UnitResult {
        if chunk_index >= self.chunk_count || chunk_index != self.next_chunk {
            return Ok(())
        }

        if let Some(writer) = &mut self.writer {
            let mut samples = self.pair.lock(chunk_index);
            writer.write_chunk(chunk_index, &samples)?;

            for sample in samples.iter_mut() {
                *sample = T::default();
            }
        }

        self.pair.mark_flushed();
        self.next_chunk += 1;
        Ok(())
    }
}

impl<T: CountSample> LineHandler for ChunkFlush<T> {

    fn on_line(&mut self, _line_start: usize, line: i64) -> UnitResult {
        // crossing into a new chunk window means the previous one is full
        if line > 0 && line as usize % self.chunksize == 0 {
            self.flush_chunk(line as usize / self.chunksize - 1)?;
        }

        Ok(())
    }

    fn on_run_end(&mut self) -> UnitResult {
        // the final chunk has no crossing after it
        if self.next_chunk == self.chunk_count - 1 {
            self.flush_chunk(self.chunk_count - 1)?;
        }

        if let Some(writer) = self.writer.take() {
            if self.next_chunk == self.chunk_count {
                writer.finish()?;
            }
            else {
                log::warn!("run ended early, leaving a partial 4D container");
            }
        }

        Ok(())
    }
}

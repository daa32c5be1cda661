//! The reducer drivers: one per analysis, all sharing the same
//! line-granular loop.
//!
//! The driver runs on the calling thread. It polls the preprocessor line
//! the decoder publishes, consumes newly visible scan lines one at a time,
//! and hands them to the analysis through the `LineHandler` hooks. It also
//! owns the end-of-image transitions (extending totals in continuous mode)
//! and the end-of-run handshake that terminates every worker.

pub mod vstem;
pub mod ricom;
pub mod pacbed;
pub mod variance;
pub mod roi;
pub mod electron;
pub mod fourd;
pub mod information;

use std::sync::Arc;
use std::time::Duration;

use crate::detector::{
    self, AdvapixDecoder, CheetahDecoder, FrameDecoder, FrameReader,
    PatternDecoder, PipelineOutcome, RawChunkReader, SimulatedDecoder,
};
use crate::error::{Error, Result, UnitResult};
use crate::kernel::KernelSet;
use crate::meta::{CameraKind, CameraSetup, DataSource, RunOptions};
use crate::progress::{Progress, ProgressMonitor, RUN_COMPLETE};
use crate::ring::POLL_SLEEP;
use crate::transport::{ByteSource, FileSource, SocketSource};


/// Per-analysis hooks called by the shared driver loop.
pub trait LineHandler {

    /// A newly visible scan line. `line_start` is the first probe position
    /// of the line within its image; `line` counts lines over the whole run.
    fn on_line(&mut self, line_start: usize, line: i64) -> UnitResult;

    /// A report interval elapsed; rates in the monitor are fresh.
    fn on_report(&mut self, _monitor: &ProgressMonitor) {}

    /// Every frame of the given image has been reduced.
    fn on_image_end(&mut self, _finished_image: usize) -> UnitResult { Ok(()) }

    /// The run is about to end; drain any pending work.
    fn on_run_end(&mut self) -> UnitResult { Ok(()) }
}


/// Everything the host observes about a finished run.
#[derive(Debug, Default, Clone)]
pub struct RunDiagnostics {

    /// Wall clock at each progress report.
    pub elapsed_seconds: Vec<f32>,

    /// Probe position the reducer had reached at each report.
    pub reached_probe_positions: Vec<u64>,

    /// Frames per second at the last report.
    pub frame_rate: f32,

    pub progress_percent: f64,

    /// Decoded events per second over the run.
    pub processing_rate: f32,

    pub events_processed: u64,
}


/// The shared reducer loop.
#[derive(Debug)]
pub struct LineDriver {
    nx: u64,
    nxy: u64,
    frames_total: u64,
    options: RunOptions,

    pub diagnostics: RunDiagnostics,
}

impl LineDriver {

    pub fn new(setup: &CameraSetup, options: RunOptions) -> Self {
        Self {
            nx: setup.geometry.nx as u64,
            nxy: setup.geometry.nxy() as u64,
            frames_total: setup.geometry.total_frames() as u64,
            options,
            diagnostics: RunDiagnostics::default(),
        }
    }

    /// Poll until the run completes, consuming lines as they appear.
    pub fn process_data(
        &mut self, progress: &Progress,
        handler: &mut dyn LineHandler,
    ) -> UnitResult {
        let mut monitor = ProgressMonitor::new(
            self.frames_total,
            Duration::from_millis(self.options.report_interval_ms),
        );

        let mut frames_total = self.frames_total;
        let mut image_number = 0_usize;
        let mut end_frame = self.nxy;
        let mut stalled_polls = 0_u64;

        progress.set_processor_line(0);

        while progress.processor_line() != RUN_COMPLETE {
            let mut advanced = false;

            // a new line is visible once the preprocessor has moved past it
            if ((monitor.frames_counted / self.nx) as i64) < progress.preprocessor_line() {
                let line = (monitor.frames_counted / self.nx) as i64;
                progress.set_processor_line(line);

                let line_start = (monitor.frames_counted % self.nxy) as usize;
                monitor.advance(self.nx);

                handler.on_line(line_start, line)?;

                if monitor.report_set && line_start as u64 / self.nx > 0 {
                    self.diagnostics.elapsed_seconds.push(monitor.elapsed_seconds());
                    self.diagnostics.reached_probe_positions.push(line_start as u64);
                    self.diagnostics.frame_rate = monitor.frame_rate;
                    self.diagnostics.progress_percent = monitor.percent();

                    handler.on_report(&monitor);
                    monitor.reset_report();
                }

                advanced = true;
            }

            if monitor.frames_counted >= end_frame {
                handler.on_image_end(image_number)?;

                if self.options.continuous {
                    monitor.frames_total += self.nxy;
                    frames_total += self.nxy;
                }

                if monitor.frames_counted != frames_total {
                    image_number += 1;
                    end_frame = (image_number as u64 + 1) * self.nxy;
                }
            }

            let finished = monitor.frames_counted >= frames_total && !self.options.continuous;
            if finished || progress.quit_requested() {
                handler.on_run_end()?;
                self.diagnostics.progress_percent = monitor.percent();
                progress.complete();
                break;
            }

            if let Some(maximum) = self.options.max_stall_count {
                if advanced { stalled_polls = 0 }
                else {
                    stalled_polls += 1;

                    if stalled_polls > maximum {
                        log::error!(
                            "the reducer stalled; the stream may not reach \
                             the expected number of probe positions"
                        );
                        progress.request_quit();
                    }
                }
            }

            if !advanced {
                std::thread::sleep(POLL_SLEEP);
            }
        }

        Ok(())
    }
}


/// Open the configured byte source. Connect failures abort the run here,
/// before any worker starts.
pub(crate) fn open_source(setup: &CameraSetup) -> Result<Box<dyn ByteSource>> {
    match &setup.source {
        DataSource::File(path) => Ok(Box::new(FileSource::open(path)?)),

        DataSource::Socket { address, role } => {
            Ok(Box::new(SocketSource::connect(address, *role)?))
        },
    }
}

/// Build the detector pipeline for the configured camera family and drive
/// it with the given reducer. `with_tot` selects the time-over-threshold
/// decode path on cameras that have one.
pub(crate) fn run_camera(
    setup: &CameraSetup,
    kernels: KernelSet,
    progress: &Arc<Progress>,
    with_tot: bool,
    reducer: impl FnOnce() -> UnitResult,
) -> Result<PipelineOutcome> {
    setup.validate()?;
    let geometry = setup.geometry;

    match setup.kind {
        CameraKind::Advapix => {
            let reader = RawChunkReader::new(detector::advapix::PACKET_BYTES);

            detector::run_pipeline(
                AdvapixDecoder::new(geometry),
                Box::new(reader), open_source(setup)?,
                kernels, progress, reducer,
            )
        },

        CameraKind::Cheetah => {
            let reader = RawChunkReader::new(8);

            detector::run_pipeline(
                CheetahDecoder::new(geometry, with_tot),
                Box::new(reader), open_source(setup)?,
                kernels, progress, reducer,
            )
        },

        CameraKind::CheetahPattern => {
            let path = setup.pattern_file.as_deref()
                .ok_or_else(|| Error::invalid("pattern camera without a pattern file"))?;

            let pattern = detector::pattern::load_pattern(path)?;
            let reader = RawChunkReader::new(8);

            detector::run_pipeline(
                PatternDecoder::new(geometry, pattern),
                Box::new(reader), open_source(setup)?,
                kernels, progress, reducer,
            )
        },

        CameraKind::Simulated => {
            let reader = RawChunkReader::new(crate::event::ElectronRecord::BYTE_SIZE);

            detector::run_pipeline(
                SimulatedDecoder::new(geometry),
                Box::new(reader), open_source(setup)?,
                kernels, progress, reducer,
            )
        },

        CameraKind::Merlin => {
            let mut source = open_source(setup)?;

            if let DataSource::Socket { .. } = setup.source {
                let header = read_socket_acquisition_header(&mut *source)?;
                log::info!("acquisition header:\n{}", header);
            }

            let head_bytes = match geometry.detector {
                512 => detector::frame::HEAD_SIZE_512,
                _ => detector::frame::HEAD_SIZE_256,
            };

            let mut header = vec![0_u8; head_bytes];
            source.read_exact_bytes(&mut header)?;

            let (pixels, format) =
                detector::frame::parse_frame_header(&header, setup.raw_counter_depth)?;

            if pixels != geometry.detector * geometry.detector {
                return Err(Error::invalid("frame header contradicts the detector size"));
            }

            let reader = FrameReader::new(
                head_bytes, format.frame_bytes(geometry.detector), true,
            );

            detector::run_pipeline(
                FrameDecoder::new(geometry, format),
                Box::new(reader), source,
                kernels, progress, reducer,
            )
        },

        CameraKind::Numpy => {
            let path = match &setup.source {
                DataSource::File(path) => path.clone(),
                _ => return Err(Error::invalid("numpy sources are files")),
            };

            let mut file = std::fs::File::open(&path)?;
            let layout = crate::transport::parse_npy_header(&mut file)?;
            drop(file);

            let expected = [geometry.detector, geometry.detector];
            if layout.shape.len() != 3 || layout.shape[1..] != expected {
                return Err(Error::invalid("numpy shape does not match the detector"));
            }

            let format = match layout.bytes_per_sample {
                1 => detector::frame::PixelFormat::U8,
                _ => detector::frame::PixelFormat::U16,
            };

            let mut source = FileSource::open(&path)?;
            source.seek_to(layout.data_offset)?;

            let reader = FrameReader::new(0, format.frame_bytes(geometry.detector), false);

            detector::run_pipeline(
                FrameDecoder::new(geometry, format),
                Box::new(reader), Box::new(source),
                kernels, progress, reducer,
            )
        },
    }
}

/// The Merlin acquisition handshake, over whatever source is configured.
fn read_socket_acquisition_header(source: &mut dyn ByteSource) -> Result<String> {
    struct SourceReader<'s>(&'s mut dyn ByteSource);

    impl std::io::Read for SourceReader<'_> {
        fn read(&mut self, dest: &mut [u8]) -> std::io::Result<usize> {
            match self.0.read_to_fill(dest) {
                Ok(count) => Ok(count),
                Err(Error::Io(error)) => Err(error),
                Err(other) => Err(std::io::Error::new(
                    std::io::ErrorKind::Other, other.to_string(),
                )),
            }
        }
    }

    crate::transport::read_acquisition_header(&mut SourceReader(source))
}

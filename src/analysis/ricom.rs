//! Reconstruction by integration of the center of mass.
//!
//! The event kernel accumulates dose and first moments per probe position.
//! As each scan line becomes visible, this reducer turns the sums into
//! center-of-mass fields and convolves a `2k+1` row window with the
//! precomputed ricom kernel, producing one integrated-gradient output line.
//! Lines are independent, so the convolution runs either inline or as jobs
//! on a bounded thread pool, with finished lines returned over a channel
//! and folded in by the driver.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use crate::error::{Result, UnitResult};
use crate::image::{ImagePair, SharedImage};
use crate::kernel::{AnnularRing, CenterOfMass, EventKernel, KernelSet, VirtualStem};
use crate::math::Vec2;
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::{Progress, ProgressMonitor};
use crate::ricom::{convolve_line, LineWindow, RicomKernel};

use super::{run_camera, LineDriver, LineHandler, RunDiagnostics};


/// A finished ricom run.
#[derive(Debug)]
pub struct RicomResults {

    /// The latest integrated-gradient image.
    pub image: Vec<f32>,

    /// One integrated-gradient image per repetition.
    pub image_stack: Vec<Vec<f32>>,

    /// The center-of-mass fields of the most recent rows.
    pub com_x: Vec<f32>,
    pub com_y: Vec<f32>,

    /// The double-buffered raw accumulators, for hosts that reduce further.
    pub dose: ImagePair,
    pub sum_x: ImagePair,
    pub sum_y: ImagePair,

    /// Count planes of any attached virtual detectors.
    pub children: Vec<Vec<SharedImage>>,

    pub diagnostics: RunDiagnostics,
}

/// The ricom analysis: kernel settings, beam center handling,
/// and optional downstream virtual detectors.
#[derive(Debug)]
pub struct RicomRun {
    pub setup: CameraSetup,
    pub options: RunOptions,

    pub kernel_size: usize,
    pub rotation_degrees: f32,

    /// Low- and high-pass bounds, recorded with the kernel.
    pub filter: Option<(f32, f32)>,

    /// Fixed beam center; `None` centers on the camera.
    pub offset: Option<Vec2<f32>>,

    /// Rebase the beam center to the measured average at each image end.
    pub update_offset: bool,

    /// Count only masked detector cells in the first moments.
    pub com_mask: Option<Arc<Vec<u64>>>,

    /// Downstream virtual detectors fed from the same decoded stream.
    pub children: Vec<AnnularRing>,

    /// Live run state: the host may poll the lines and raise the quit
    /// bit from another thread while `run` is blocking.
    pub progress: Arc<Progress>,
}

impl RicomRun {

    pub fn new(setup: CameraSetup, options: RunOptions, kernel_size: usize) -> Self {
        Self {
            setup, options,
            kernel_size,
            rotation_degrees: 0.0,
            filter: None,
            offset: None,
            update_offset: false,
            com_mask: None,
            children: Vec::new(),
            progress: Arc::new(Progress::new()),
        }
    }

    pub fn run(&mut self) -> Result<RicomResults> {
        let geometry = self.setup.geometry;
        let center = Vec2(geometry.detector as f32 / 2.0, geometry.detector as f32 / 2.0);

        let mut kernel = RicomKernel::compute(self.kernel_size, self.rotation_degrees);
        if let Some((low, high)) = self.filter {
            kernel = kernel.with_filter(low, high);
        }

        let moments = match &self.com_mask {
            Some(mask) => CenterOfMass::masked(geometry, Arc::clone(mask)),
            None => CenterOfMass::new(geometry),
        };

        let dose = moments.dose.clone();
        let sum_x = moments.sum_x.clone();
        let sum_y = moments.sum_y.clone();

        let mut kernels = KernelSet::single(EventKernel::CenterOfMass(moments));
        let mut child_stacks = Vec::new();

        for &ring in &self.children {
            let child = VirtualStem::new(ring, geometry);
            child_stacks.push(child.stack.clone());
            kernels.attach(EventKernel::VirtualStem(child));
        }

        let pool = build_pool(self.options.n_threads);
        let (sender, receiver) = channel();

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());

        let nxy = geometry.nxy();
        let mut handler = RicomReducer {
            kernel: Arc::new(kernel),
            dose: dose.clone(),
            sum_x: sum_x.clone(),
            sum_y: sum_y.clone(),

            com_x: vec![0.0; nxy],
            com_y: vec![0.0; nxy],
            image: vec![0.0; nxy],
            image_stack: vec![vec![0.0; nxy]; geometry.rep + 1],

            nx: geometry.nx,
            ny: geometry.ny,
            rep: geometry.rep,
            offset: self.offset.unwrap_or(center),
            update_offset: self.update_offset,
            continuous: self.options.continuous,

            com_line_sum: [0.0; 2],
            com_public: [center.x(), center.y()],
            lines_since_report: 0,

            pool,
            max_in_flight: self.options.n_threads.max(1) + 2,
            in_flight: 0,
            sender,
            receiver,
        };

        let outcome = run_camera(
            &self.setup, kernels, &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(RicomResults {
            image: handler.image,
            image_stack: handler.image_stack,
            com_x: handler.com_x,
            com_y: handler.com_y,
            dose, sum_x, sum_y,
            children: child_stacks,
            diagnostics,
        })
    }
}

fn build_pool(n_threads: usize) -> Option<rayon_core::ThreadPool> {
    if n_threads <= 1 { return None }

    match rayon_core::ThreadPoolBuilder::new().num_threads(n_threads).build() {
        Ok(pool) => Some(pool),

        Err(error) => {
            log::warn!("thread pool unavailable, reducing inline: {}", error);
            None
        },
    }
}


/// One finished convolution job: which image, where the output line
/// starts within it, and the line values.
type FinishedLine = (usize, usize, Vec<f32>);

struct RicomReducer {
    kernel: Arc<RicomKernel>,
    dose: ImagePair,
    sum_x: ImagePair,
    sum_y: ImagePair,

    com_x: Vec<f32>,
    com_y: Vec<f32>,
    image: Vec<f32>,
    image_stack: Vec<Vec<f32>>,

    nx: usize,
    ny: usize,
    rep: usize,
    offset: Vec2<f32>,
    update_offset: bool,
    continuous: bool,

    com_line_sum: [f32; 2],
    com_public: [f32; 2],
    lines_since_report: usize,

    pool: Option<rayon_core::ThreadPool>,
    max_in_flight: usize,
    in_flight: usize,
    sender: Sender<FinishedLine>,
    receiver: Receiver<FinishedLine>,
}

impl std::fmt::Debug for RicomReducer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("RicomReducer")
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl RicomReducer {

    /// Fill the center-of-mass fields for one line from the moment sums.
    /// Positions without dose take the current beam center, so they add
    /// nothing to the integrated gradient.
    fn compute_com_line(&mut self, line_start: usize, image_index: u16) {
        let dose = self.dose.slot(image_index);
        let sum_x = self.sum_x.slot(image_index);
        let sum_y = self.sum_y.slot(image_index);

        let mut line_sum = [0.0_f32; 2];

        for cell in line_start .. line_start + self.nx {
            let counts = dose.get(cell);

            if counts == 0 {
                self.com_x[cell] = self.offset.x();
                self.com_y[cell] = self.offset.y();
            }
            else {
                self.com_x[cell] = sum_x.get(cell) as f32 / counts as f32;
                self.com_y[cell] = sum_y.get(cell) as f32 / counts as f32;
            }

            line_sum[0] += self.com_x[cell];
            line_sum[1] += self.com_y[cell];
        }

        self.com_line_sum[0] += line_sum[0] / self.nx as f32;
        self.com_line_sum[1] += line_sum[1] / self.nx as f32;
        self.lines_since_report += 1;
    }

    /// Convolve the window ending at the just-finished line, inline or
    /// on the pool. The output line sits `k` rows back.
    fn dispatch_convolution(&mut self, line_start: usize, image_index: usize) {
        let k = self.kernel.size;
        let line_in_image = line_start / self.nx;

        // wait until a full window of rows is complete; the mirroring
        // skip applies at the lower image boundary
        if line_in_image < 2 * k { return }

        let window_start = line_start - 2 * k * self.nx;
        let window_len = self.kernel.width * self.nx;
        let output_start = line_start - k * self.nx;

        let window = LineWindow {
            com_x: self.com_x[window_start .. window_start + window_len].to_vec(),
            com_y: self.com_y[window_start .. window_start + window_len].to_vec(),
            nx: self.nx,
            offset: self.offset,
        };

        if self.pool.is_some() && self.in_flight >= self.max_in_flight {
            self.receive_one();
        }

        match &self.pool {
            None => {
                let values = convolve_line(&self.kernel, &window);
                self.fold_line(image_index, output_start, &values);
            },

            Some(pool) => {
                let kernel = Arc::clone(&self.kernel);
                let sender = self.sender.clone();

                pool.spawn(move || {
                    let values = convolve_line(&kernel, &window);
                    let _ = sender.send((image_index, output_start, values));
                });

                self.in_flight += 1;
                self.drain_ready();
            },
        }
    }

    fn fold_line(&mut self, image_index: usize, output_start: usize, values: &[f32]) {
        for (offset, &value) in values.iter().enumerate() {
            self.image[output_start + offset] += value;
        }

        if let Some(stack_image) = self.image_stack.get_mut(image_index) {
            for (offset, &value) in values.iter().enumerate() {
                stack_image[output_start + offset] += value;
            }
        }
    }

    fn receive_one(&mut self) {
        if let Ok((image_index, output_start, values)) = self.receiver.recv() {
            self.in_flight -= 1;
            self.fold_line(image_index, output_start, &values);
        }
    }

    fn drain_ready(&mut self) {
        while let Ok((image_index, output_start, values)) = self.receiver.try_recv() {
            self.in_flight -= 1;
            self.fold_line(image_index, output_start, &values);
        }
    }
}

impl LineHandler for RicomReducer {

    fn on_line(&mut self, line_start: usize, line: i64) -> UnitResult {
        let image_index = line as usize / self.ny;

        self.compute_com_line(line_start, image_index as u16);
        self.dispatch_convolution(line_start, image_index);
        Ok(())
    }

    fn on_report(&mut self, _monitor: &ProgressMonitor) {
        // publish the measured beam center, averaged since the last report
        if self.lines_since_report > 0 {
            let lines = self.lines_since_report as f32;
            self.com_public = [
                self.com_line_sum[0] / lines,
                self.com_line_sum[1] / lines,
            ];
        }

        self.com_line_sum = [0.0; 2];
        self.lines_since_report = 0;
    }

    fn on_image_end(&mut self, finished_image: usize) -> UnitResult {
        if self.update_offset {
            self.offset = Vec2(self.com_public[0], self.com_public[1]);
        }

        if self.continuous {
            for value in &mut self.image { *value = 0.0 }
        }

        // the finished image's accumulator slot holds the image after
        // next; zero it before the detector gets there, unless no later
        // image will ever use it
        if self.continuous || finished_image + 2 < self.rep {
            self.dose.slot(finished_image as u16).clear();
            self.sum_x.slot(finished_image as u16).clear();
            self.sum_y.slot(finished_image as u16).clear();
        }

        Ok(())
    }

    fn on_run_end(&mut self) -> UnitResult {
        while self.in_flight > 0 {
            self.receive_one();
        }

        Ok(())
    }
}

//! Virtual detector imaging: count events inside one or more annular
//! detectors, or inside an arbitrary detector mask.

use std::sync::Arc;

use crate::error::Result;
use crate::image::SharedImage;
use crate::kernel::{
    AnnularRing, EventKernel, KernelSet, MaskedVirtualStem,
    MultiVirtualStem, VirtualStem,
};
use crate::math::Vec2;
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::Progress;

use super::{run_camera, LineDriver, LineHandler, RunDiagnostics};


/// How the virtual detector is described.
#[derive(Debug, Clone)]
pub enum DetectorShape {

    /// One or more annular rings. Offsets of `None` center on the camera.
    Rings(Vec<(f32, f32, Option<Vec2<f32>>)>),

    /// A detector-sized mask of cell weights.
    Mask(Arc<Vec<u64>>),
}

/// A finished virtual STEM run.
#[derive(Debug)]
pub struct VirtualStemResults {

    /// One count plane per image.
    pub stack: Vec<SharedImage>,

    /// The folded live image: cumulative sum or latest image,
    /// depending on the run options.
    pub image: Vec<u64>,

    pub diagnostics: RunDiagnostics,
}

/// The virtual STEM analysis.
#[derive(Debug)]
pub struct VirtualStemRun {
    pub setup: CameraSetup,
    pub options: RunOptions,
    pub shape: DetectorShape,

    /// Live run state: the host may poll the lines and raise the quit
    /// bit from another thread while `run` is blocking.
    pub progress: Arc<Progress>,
}

impl VirtualStemRun {

    pub fn new(setup: CameraSetup, options: RunOptions, shape: DetectorShape) -> Self {
        Self { setup, options, shape, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<VirtualStemResults> {
        let geometry = self.setup.geometry;
        let center = Vec2(geometry.detector as f32 / 2.0, geometry.detector as f32 / 2.0);

        let (kernel, stack) = match &self.shape {
            DetectorShape::Rings(rings) if rings.len() == 1 => {
                let (inner, outer, offset) = rings[0];
                let ring = AnnularRing::new(inner, outer, offset.unwrap_or(center));

                let kernel = VirtualStem::new(ring, geometry);
                let stack = kernel.stack.clone();
                (EventKernel::VirtualStem(kernel), stack)
            },

            DetectorShape::Rings(rings) => {
                let rings = rings.iter().map(|&(inner, outer, offset)|
                    AnnularRing::new(inner, outer, offset.unwrap_or(center)));

                let kernel = MultiVirtualStem::new(rings, geometry);
                let stack = kernel.stack.clone();
                (EventKernel::MultiVirtualStem(kernel), stack)
            },

            DetectorShape::Mask(mask) => {
                let kernel = MaskedVirtualStem::new(Arc::clone(mask), geometry);
                let stack = kernel.stack.clone();
                (EventKernel::MaskedVirtualStem(kernel), stack)
            },
        };

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());

        let mut handler = StackFold {
            stack: stack.clone(),
            image: vec![0; geometry.nxy()],
            nx: geometry.nx,
            ny: geometry.ny,
            cumulative: self.options.cumulative,
            continuous: self.options.continuous,
        };

        let outcome = run_camera(
            &self.setup, KernelSet::single(kernel), &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(VirtualStemResults { stack, image: handler.image, diagnostics })
    }
}


/// Folds freshly completed stack lines into the live image.
#[derive(Debug)]
pub(crate) struct StackFold {
    pub stack: Vec<SharedImage>,
    pub image: Vec<u64>,
    pub nx: usize,
    pub ny: usize,
    pub cumulative: bool,
    pub continuous: bool,
}

impl LineHandler for StackFold {

    fn on_line(&mut self, line_start: usize, line: i64) -> crate::error::UnitResult {
        let image_index = (line as usize / self.ny).min(self.stack.len() - 1);
        let plane = &self.stack[image_index];

        for cell in line_start .. line_start + self.nx {
            if self.cumulative {
                self.image[cell] += plane.get(cell);
            }
            else if self.continuous {
                self.image[cell] = plane.get(cell);
            }
        }

        Ok(())
    }
}

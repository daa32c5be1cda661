//! Variance imaging: accumulate the squared detector distance from a
//! common center per probe position.

use std::sync::Arc;

use crate::error::{Result, UnitResult};
use crate::image::ImagePair;
use crate::kernel::{EventKernel, KernelSet, Variance};
use crate::math::Vec2;
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::Progress;

use super::{run_camera, LineDriver, LineHandler, RunDiagnostics};


#[derive(Debug)]
pub struct VarianceResults {

    /// The folded live image over all reduced lines.
    pub image: Vec<u64>,

    pub diagnostics: RunDiagnostics,
}

#[derive(Debug)]
pub struct VarianceRun {
    pub setup: CameraSetup,
    pub options: RunOptions,

    /// Distance center; `None` uses the camera center.
    pub offset: Option<Vec2<f32>>,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,
}

impl VarianceRun {

    pub fn new(setup: CameraSetup, options: RunOptions) -> Self {
        Self { setup, options, offset: None, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<VarianceResults> {
        let geometry = self.setup.geometry;
        let center = Vec2(geometry.detector as f32 / 2.0, geometry.detector as f32 / 2.0);

        let kernel = Variance::new(geometry, self.offset.unwrap_or(center));
        let planes = kernel.planes.clone();

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());

        let mut handler = VarianceFold {
            planes,
            image: vec![0; geometry.nxy()],
            nx: geometry.nx,
            ny: geometry.ny,
            rep: geometry.rep,
            continuous: self.options.continuous,
        };

        let outcome = run_camera(
            &self.setup,
            KernelSet::single(EventKernel::Variance(kernel)),
            &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(VarianceResults { image: handler.image, diagnostics })
    }
}


/// Folds each completed line out of the double-buffered planes, and zeroes
/// a plane once its image is fully reduced so the slot can take the image
/// after next.
#[derive(Debug)]
struct VarianceFold {
    planes: ImagePair,
    image: Vec<u64>,
    nx: usize,
    ny: usize,
    rep: usize,
    continuous: bool,
}

impl LineHandler for VarianceFold {

    fn on_line(&mut self, line_start: usize, line: i64) -> UnitResult {
        let image_index = (line as usize / self.ny) as u16;
        let plane = self.planes.slot(image_index);

        for cell in line_start .. line_start + self.nx {
            self.image[cell] += plane.get(cell);
        }

        Ok(())
    }

    fn on_image_end(&mut self, finished_image: usize) -> UnitResult {
        if self.continuous || finished_image + 2 < self.rep {
            self.planes.slot(finished_image as u16).clear();
        }

        Ok(())
    }
}

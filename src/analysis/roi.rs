//! Region-of-interest extraction: diffraction histograms and scan maps of
//! a scan-space box or mask, optionally with a binned rank-4 tensor.

use std::sync::Arc;

use crate::error::Result;
use crate::image::SharedImage;
use crate::kernel::{EventKernel, KernelSet, Roi, Roi4dTensor, RoiFourD, RoiMask};
use crate::meta::{CameraSetup, RoiWindow, RunOptions};
use crate::progress::Progress;

use super::pacbed::PassiveLines;
use super::{run_camera, LineDriver, RunDiagnostics};


/// Which events the region selects and what it accumulates.
#[derive(Debug, Clone)]
pub enum RoiSelection {

    /// A scan-space box; diffraction cells count events.
    Window(RoiWindow),

    /// A scan-space box; diffraction cells accumulate time over threshold.
    WindowOverThreshold(RoiWindow),

    /// One scan mask per image.
    Masks(Vec<Arc<Vec<u8>>>),

    /// A scan-space box plus a detector-binned rank-4 tensor.
    FourD { window: RoiWindow, det_bin: usize },
}

#[derive(Debug)]
pub struct RoiResults {
    pub diffraction: SharedImage,
    pub scan: SharedImage,

    /// Per-image planes; empty for the 4D variant.
    pub diffraction_stack: Vec<SharedImage>,
    pub scan_stack: Vec<SharedImage>,

    /// Only present for the 4D variant.
    pub tensor: Option<Arc<Roi4dTensor>>,

    pub diagnostics: RunDiagnostics,
}

#[derive(Debug)]
pub struct RoiRun {
    pub setup: CameraSetup,
    pub options: RunOptions,
    pub selection: RoiSelection,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,
}

impl RoiRun {

    pub fn new(setup: CameraSetup, options: RunOptions, selection: RoiSelection) -> Self {
        Self { setup, options, selection, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<RoiResults> {
        let geometry = self.setup.geometry;
        let mut with_tot = false;

        let kernel = match &self.selection {
            RoiSelection::Window(window) => {
                window.validate(geometry)?;
                EventKernel::Roi(Roi::new(*window, geometry, false))
            },

            RoiSelection::WindowOverThreshold(window) => {
                window.validate(geometry)?;
                with_tot = true;
                EventKernel::Roi(Roi::new(*window, geometry, true))
            },

            RoiSelection::Masks(masks) => {
                EventKernel::RoiMask(RoiMask::new(masks.clone(), geometry))
            },

            RoiSelection::FourD { window, det_bin } => {
                window.validate(geometry)?;
                crate::meta::validate_binning(geometry, 1, *det_bin)?;
                EventKernel::RoiFourD(RoiFourD::new(*window, geometry, *det_bin))
            },
        };

        let (diffraction, scan, diffraction_stack, scan_stack, tensor) = match &kernel {
            EventKernel::Roi(roi) => (
                roi.diffraction.clone(), roi.scan.clone(),
                roi.diffraction_stack.clone(), roi.scan_stack.clone(), None,
            ),

            EventKernel::RoiMask(roi) => (
                roi.diffraction.clone(), roi.scan.clone(),
                roi.diffraction_stack.clone(), roi.scan_stack.clone(), None,
            ),

            EventKernel::RoiFourD(roi) => (
                roi.diffraction.clone(), roi.scan.clone(),
                Vec::new(), Vec::new(), Some(Arc::clone(&roi.tensor)),
            ),

            _ => unreachable!(),
        };

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());
        let mut handler = PassiveLines;

        let outcome = run_camera(
            &self.setup, KernelSet::single(kernel), &progress, with_tot,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(RoiResults {
            diffraction, scan,
            diffraction_stack, scan_stack,
            tensor,
            diagnostics,
        })
    }
}

//! Position-averaged diffraction: integrate every event over all probe
//! positions into one detector-sized pattern.

use std::sync::Arc;

use crate::error::Result;
use crate::image::SharedImage;
use crate::kernel::{EventKernel, KernelSet, Pacbed};
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::Progress;

use super::{run_camera, LineDriver, LineHandler, RunDiagnostics};


#[derive(Debug)]
pub struct PacbedResults {
    pub pattern: SharedImage,
    pub diagnostics: RunDiagnostics,
}

#[derive(Debug)]
pub struct PacbedRun {
    pub setup: CameraSetup,
    pub options: RunOptions,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,
}

impl PacbedRun {

    pub fn new(setup: CameraSetup, options: RunOptions) -> Self {
        Self { setup, options, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<PacbedResults> {
        let kernel = Pacbed::new(self.setup.geometry);
        let pattern = kernel.pattern.clone();

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());
        let mut handler = PassiveLines;

        let outcome = run_camera(
            &self.setup,
            KernelSet::single(EventKernel::Pacbed(kernel)),
            &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(PacbedResults { pattern, diagnostics })
    }
}


/// An analysis without per-line work: the driver only tracks progress.
#[derive(Debug)]
pub(crate) struct PassiveLines;

impl LineHandler for PassiveLines {
    fn on_line(&mut self, _line_start: usize, _line: i64) -> crate::error::UnitResult {
        Ok(())
    }
}

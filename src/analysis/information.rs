//! Shannon surprise imaging: each event contributes the negative log
//! probability of its detector cell under a reference distribution,
//! highlighting probe positions with unusual scattering.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::image::SharedImage;
use crate::kernel::{EventKernel, Information, KernelSet};
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::Progress;

use super::pacbed::PassiveLines;
use super::{run_camera, LineDriver, RunDiagnostics};


#[derive(Debug)]
pub struct InformationResults {

    /// Accumulated surprise in bits per probe position.
    pub information: Vec<f64>,

    /// Plain event counts per probe position.
    pub counts: SharedImage,

    pub diagnostics: RunDiagnostics,
}

#[derive(Debug)]
pub struct InformationRun {
    pub setup: CameraSetup,
    pub options: RunOptions,

    /// Reference probability of each detector cell, flattened kx-major.
    pub probability: Arc<Vec<f32>>,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,
}

impl InformationRun {

    pub fn new(setup: CameraSetup, options: RunOptions, probability: Arc<Vec<f32>>) -> Self {
        Self { setup, options, probability, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<InformationResults> {
        let geometry = self.setup.geometry;

        if self.probability.len() != geometry.detector * geometry.detector {
            return Err(Error::invalid("probability map does not match the detector"));
        }

        let kernel = Information::new(Arc::clone(&self.probability), geometry);
        let counts = kernel.counts.clone();

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());
        let mut handler = PassiveLines;

        let outcome = run_camera(
            &self.setup,
            KernelSet::single(EventKernel::Information(kernel)),
            &progress, false,
            || driver.process_data(&progress, &mut handler),
        )?;

        let information = match outcome.kernels.primary {
            EventKernel::Information(kernel) => kernel.information,
            _ => return Err(Error::invalid("pipeline returned a foreign kernel")),
        };

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = outcome.events_processed;
        diagnostics.processing_rate = outcome.processing_rate;

        Ok(InformationResults { information, counts, diagnostics })
    }
}

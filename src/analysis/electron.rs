//! Electron list output: stream every event to a packed record file,
//! either directly or through the decluster pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use crate::decluster::{DeclusterOutcome, DeclusterParams, Declusterer, ElectronReduction};
use crate::error::{Error, Result};
use crate::event::ElectronFile;
use crate::kernel::{DeclusterFeed, ElectronWriter, EventKernel, KernelSet};
use crate::meta::{CameraSetup, RunOptions};
use crate::progress::Progress;

use super::pacbed::PassiveLines;
use super::{run_camera, LineDriver, RunDiagnostics};

/// Cluster sizes tracked by the histogram; larger clusters are not counted.
const HISTOGRAM_LEN: usize = 1024;


#[derive(Debug)]
pub struct ElectronResults {

    /// Present when declustering was enabled.
    pub decluster: Option<DeclusterOutcome>,

    pub diagnostics: RunDiagnostics,
}

#[derive(Debug)]
pub struct ElectronRun {
    pub setup: CameraSetup,
    pub options: RunOptions,

    /// Where the electron records go. The file is created before any
    /// worker starts; failure to open aborts the run.
    pub output: PathBuf,

    pub reduction: ElectronReduction,

    /// Enable the decluster pipeline with these tolerances.
    pub decluster: Option<DeclusterParams>,

    /// Live run state, shared with the host for polling and cancelling.
    pub progress: Arc<Progress>,
}

impl ElectronRun {

    pub fn new(
        setup: CameraSetup, options: RunOptions,
        output: PathBuf, reduction: ElectronReduction,
    ) -> Self {
        Self { setup, options, output, reduction, decluster: None, progress: Arc::new(Progress::new()) }
    }

    pub fn run(&mut self) -> Result<ElectronResults> {
        let geometry = self.setup.geometry;
        let file = ElectronFile::create(&self.output, geometry.rep)?;

        let progress = Arc::clone(&self.progress);
        progress.reset();
        let mut driver = LineDriver::new(&self.setup, self.options.clone());
        let mut handler = PassiveLines;

        let (kernel, declusterer) = match self.decluster {
            None => {
                let writer = ElectronWriter::new(
                    file, self.reduction, geometry, Arc::clone(&progress),
                );

                (EventKernel::WriteElectron(writer), None)
            },

            Some(params) => {
                let declusterer = Declusterer::spawn(
                    params, self.reduction, file, HISTOGRAM_LEN,
                );

                let feed = DeclusterFeed::new(declusterer.input(), geometry);
                (EventKernel::DeclusterFeed(feed), Some(declusterer))
            },
        };

        // events carry arrival times on these cameras, which the
        // decluster distance needs
        let with_tot = self.decluster.is_some();

        let outcome = run_camera(
            &self.setup, KernelSet::single(kernel), &progress, with_tot,
            || driver.process_data(&progress, &mut handler),
        );

        let crate::detector::PipelineOutcome { kernels, events_processed, processing_rate } = outcome?;

        let decluster_outcome = match declusterer {
            Some(declusterer) => {
                // dropping the kernels hangs up the feed sender, which
                // lets both decluster stages drain and join
                drop(kernels);
                Some(declusterer.finish()?)
            },

            None => {
                let mut kernels = kernels;

                match &mut kernels.primary {
                    EventKernel::WriteElectron(writer) => writer.finish()?,
                    _ => return Err(Error::invalid("pipeline returned a foreign kernel")),
                }

                None
            },
        };

        let mut diagnostics = driver.diagnostics.clone();
        diagnostics.events_processed = events_processed;
        diagnostics.processing_rate = processing_rate;

        Ok(ElectronResults { decluster: decluster_outcome, diagnostics })
    }
}

//! Describe a run before it starts: scan geometry, camera family,
//! byte source, and the options every analysis honours.
//! Validation happens here, before any worker thread is spawned.

use std::path::{Path, PathBuf};

use crate::error::{Error, UnitResult};
use crate::math::{is_power_of_two, Vec2};


/// The camera families this crate can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraKind {

    /// AdvaPix Timepix3, 256x256, packed 24-byte event records.
    Advapix,

    /// Quad-chip Cheetah Timepix3, 512x512, 64-bit packet words,
    /// scan position derived from TDC line triggers.
    Cheetah,

    /// Cheetah with per-pixel triggers and a precomputed scan pattern.
    CheetahPattern,

    /// Simulated electron stream, 10-byte records.
    Simulated,

    /// Frame-based Merlin camera, 256x256 or 512x512.
    Merlin,

    /// Frame-based numpy array file.
    Numpy,
}

impl CameraKind {

    /// The native detector width of this camera family,
    /// or `None` if the file or configuration decides.
    pub fn fixed_detector_size(self) -> Option<usize> {
        match self {
            CameraKind::Advapix => Some(256),
            CameraKind::Cheetah | CameraKind::CheetahPattern => Some(512),
            _ => None,
        }
    }

    /// Guess the camera family from a file extension,
    /// as acquisition software names its dumps.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "t3p" => Some(CameraKind::Advapix),
            "tpx3" => Some(CameraKind::Cheetah),
            "electron" => Some(CameraKind::Simulated),
            "mib" => Some(CameraKind::Merlin),
            "npy" => Some(CameraKind::Numpy),
            _ => None,
        }
    }

    /// True if this family decodes single electron events rather than frames.
    pub fn is_event_based(self) -> bool {
        !matches!(self, CameraKind::Merlin | CameraKind::Numpy)
    }
}


/// Whether the socket end of the pipeline dials out or waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {

    /// Connect to the camera server (Merlin).
    Client,

    /// Listen and accept exactly one camera connection (Cheetah).
    Server,
}

/// Where the raw bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {

    /// A file, possibly still being written by the acquisition software.
    File(PathBuf),

    /// A TCP stream, `address:port`.
    Socket { address: String, role: SocketRole },
}


/// The scan raster an acquisition walks through.
/// Probe positions increment first along x, then along y;
/// `rep` repeated images make up one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanGeometry {

    /// Number of probe positions per scan line.
    pub nx: usize,

    /// Number of scan lines per image.
    pub ny: usize,

    /// Number of images in the run.
    pub rep: usize,

    /// Probe dwell time in nanoseconds. May be zero for cameras
    /// that infer it from line triggers.
    pub dwell_ns: u64,

    /// Detector width and height in pixels.
    pub detector: usize,
}

impl ScanGeometry {

    /// Probe positions per image.
    pub fn nxy(self) -> usize { self.nx * self.ny }

    /// Total frames over the whole run.
    pub fn total_frames(self) -> usize { self.nxy() * self.rep }

    pub(crate) fn validate(&self, camera: CameraKind) -> UnitResult {
        if self.nx == 0 || self.ny == 0 || self.rep == 0 {
            return Err(Error::invalid("scan geometry with zero extent"));
        }

        if let Some(expected) = camera.fixed_detector_size() {
            if self.detector != expected {
                return Err(Error::invalid("detector size does not match camera family"));
            }
        }

        if camera == CameraKind::Merlin && self.detector != 256 && self.detector != 512 {
            return Err(Error::invalid("detector size for merlin must be 256 or 512"));
        }

        Ok(())
    }
}


/// A rectangular region of interest on the scan grid: position and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiWindow {
    pub origin: Vec2<usize>,
    pub size: Vec2<usize>,
}

impl RoiWindow {

    /// The whole scan grid as an ROI.
    pub fn full(geometry: ScanGeometry) -> Self {
        Self { origin: Vec2(0, 0), size: Vec2(geometry.nx, geometry.ny) }
    }

    pub(crate) fn validate(&self, geometry: ScanGeometry) -> UnitResult {
        let fits_x = self.origin.x() + self.size.x() <= geometry.nx;
        let fits_y = self.origin.y() + self.size.y() <= geometry.ny;

        if self.size.x() == 0 || self.size.y() == 0 || !fits_x || !fits_y {
            return Err(Error::invalid("roi outside the scan grid"));
        }

        Ok(())
    }
}


/// Options every analysis honours, with the defaults of a plain single
/// image acquisition.
#[derive(Debug, Clone)]
pub struct RunOptions {

    /// Extend the total frame count at each end of image
    /// instead of stopping after `rep` images.
    pub continuous: bool,

    /// Sum per-image results into the aggregated output image.
    pub cumulative: bool,

    /// Reducer pool size. One or less schedules the reducer inline.
    pub n_threads: usize,

    /// Milliseconds between progress reports.
    pub report_interval_ms: u64,

    /// If set, raise the quit bit after this many reducer polls
    /// without progress. Disabled by default.
    pub max_stall_count: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            continuous: false,
            cumulative: true,
            n_threads: 1,
            report_interval_ms: 250,
            max_stall_count: None,
        }
    }
}


/// Everything the pipeline needs to know to open a camera stream.
#[derive(Debug, Clone)]
pub struct CameraSetup {
    pub kind: CameraKind,
    pub geometry: ScanGeometry,
    pub source: DataSource,

    /// Scan pattern file for `CameraKind::CheetahPattern`,
    /// whitespace-separated decimal probe positions.
    pub pattern_file: Option<PathBuf>,

    /// Counter depth of the Merlin raw frame format, 1, 6 or 12 bits.
    pub raw_counter_depth: u8,
}

impl CameraSetup {

    pub fn new(kind: CameraKind, geometry: ScanGeometry, source: DataSource) -> Self {
        Self { kind, geometry, source, pattern_file: None, raw_counter_depth: 12 }
    }

    pub fn validate(&self) -> UnitResult {
        self.geometry.validate(self.kind)?;

        if self.kind == CameraKind::CheetahPattern && self.pattern_file.is_none() {
            return Err(Error::invalid("pattern camera without a pattern file"));
        }

        if self.kind == CameraKind::Simulated || self.kind == CameraKind::Numpy {
            if let DataSource::Socket { .. } = self.source {
                return Err(Error::invalid("this camera family only supports file sources"));
            }
        }

        Ok(())
    }
}


/// Check the 4D output encoding options at run start.
pub(crate) fn validate_fourd_output(
    geometry: ScanGeometry, scan_bin: usize, det_bin: usize,
    chunksize: usize, bitdepth: usize, deflate_level: u8,
) -> UnitResult {
    if bitdepth != 8 && bitdepth != 16 && bitdepth != 32 {
        return Err(Error::invalid("bit depth must be 8, 16 or 32"));
    }

    if deflate_level == 0 || deflate_level > 9 {
        return Err(Error::invalid("deflate level must be within 1..=9"));
    }

    validate_binning(geometry, scan_bin, det_bin)?;

    if chunksize == 0 || chunksize % scan_bin != 0 || geometry.ny % chunksize != 0 {
        return Err(Error::invalid("chunk size must evenly split the scan"));
    }

    Ok(())
}

/// Binning factors must be powers of two that divide the grid.
pub(crate) fn validate_binning(geometry: ScanGeometry, scan_bin: usize, det_bin: usize) -> UnitResult {
    if !is_power_of_two(scan_bin) || !is_power_of_two(det_bin) {
        return Err(Error::invalid("binning factors must be powers of two"));
    }

    if geometry.nx % scan_bin != 0 || geometry.ny % scan_bin != 0 || geometry.detector % det_bin != 0 {
        return Err(Error::invalid("binning factors must divide the grid"));
    }

    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;

    fn geometry() -> ScanGeometry {
        ScanGeometry { nx: 64, ny: 64, rep: 1, dwell_ns: 1000, detector: 256 }
    }

    #[test]
    fn camera_from_extension(){
        assert_eq!(CameraKind::from_path(Path::new("scan.t3p")), Some(CameraKind::Advapix));
        assert_eq!(CameraKind::from_path(Path::new("scan.tpx3")), Some(CameraKind::Cheetah));
        assert_eq!(CameraKind::from_path(Path::new("scan.electron")), Some(CameraKind::Simulated));
        assert_eq!(CameraKind::from_path(Path::new("scan.mib")), Some(CameraKind::Merlin));
        assert_eq!(CameraKind::from_path(Path::new("scan.weird")), None);
    }

    #[test]
    fn rejects_wrong_detector_size(){
        let mut geometry = geometry();
        geometry.detector = 512;
        assert!(geometry.validate(CameraKind::Advapix).is_err());
        assert!(geometry.validate(CameraKind::Cheetah).is_ok());
    }

    #[test]
    fn rejects_bad_fourd_options(){
        let geometry = geometry();
        assert!(validate_fourd_output(geometry, 1, 2, 16, 8, 4).is_ok());
        assert!(validate_fourd_output(geometry, 1, 2, 16, 12, 4).is_err());
        assert!(validate_fourd_output(geometry, 1, 2, 16, 8, 0).is_err());
        assert!(validate_fourd_output(geometry, 3, 2, 16, 8, 4).is_err());
        assert!(validate_fourd_output(geometry, 1, 2, 17, 8, 4).is_err());
    }

    #[test]
    fn identity_roi_fits(){
        let geometry = geometry();
        assert!(RoiWindow::full(geometry).validate(geometry).is_ok());

        let outside = RoiWindow { origin: Vec2(60, 0), size: Vec2(8, 8) };
        assert!(outside.validate(geometry).is_err());
    }
}

//! Per-event aggregation kernels. One kernel is enabled per analysis and
//! called once per decoded event on the consumer thread; output planes are
//! partitioned by probe position, so the only lock in any hot path is the
//! nominally contended chunk mutex of the 4D writer.
//!
//! Dispatch is a sum type matched at the top of the consumer loop, and a
//! run may attach further kernels downstream of the first, all fed from the
//! same decoded stream.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::decluster::ClusterEvent;
use crate::error::{Error, UnitResult};
use crate::event::{ElectronFile, Event};
use crate::fourd::{ChunkPair, CountSample};
use crate::image::{ImagePair, SharedImage};
use crate::math::{squared_distance, Vec2};
use crate::meta::{RoiWindow, ScanGeometry};
use crate::progress::Progress;


/// One annular virtual detector: squared radii and a beam center.
#[derive(Debug, Clone, Copy)]
pub struct AnnularRing {
    pub inner_radius_sqr: f32,
    pub outer_radius_sqr: f32,
    pub offset: Vec2<f32>,
}

impl AnnularRing {

    pub fn new(inner_radius: f32, outer_radius: f32, offset: Vec2<f32>) -> Self {
        Self {
            inner_radius_sqr: inner_radius * inner_radius,
            outer_radius_sqr: outer_radius * outer_radius,
            offset,
        }
    }

    /// Render the ring into a detector-sized mask, laid out like the
    /// masked kernels expect: kx major.
    pub fn rasterize(&self, detector: usize) -> Vec<u64> {
        let mut mask = vec![0_u64; detector * detector];

        for kx in 0..detector {
            for ky in 0..detector {
                let d2 = squared_distance(kx as u16, ky as u16, self.offset);
                if d2 >= self.inner_radius_sqr && d2 <= self.outer_radius_sqr {
                    mask[kx * detector + ky] = 1;
                }
            }
        }

        mask
    }
}


/// Counts events inside one annular detector, one plane per image.
#[derive(Debug)]
pub struct VirtualStem {
    ring: AnnularRing,
    pub stack: Vec<SharedImage>,
}

impl VirtualStem {

    pub fn new(ring: AnnularRing, geometry: ScanGeometry) -> Self {
        Self { ring, stack: allocate_stack(geometry) }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let d2 = squared_distance(event.kx, event.ky, self.ring.offset);

        if d2 > self.ring.inner_radius_sqr && d2 <= self.ring.outer_radius_sqr {
            if let Some(plane) = self.stack.get(event.image_index as usize) {
                plane.add(event.probe_position as usize, event.weight as u64);
            }
        }
    }
}


/// Counts events inside any of several annular detectors.
#[derive(Debug)]
pub struct MultiVirtualStem {
    rings: SmallVec<[AnnularRing; 4]>,
    pub stack: Vec<SharedImage>,
}

impl MultiVirtualStem {

    pub fn new(rings: impl IntoIterator<Item = AnnularRing>, geometry: ScanGeometry) -> Self {
        Self { rings: rings.into_iter().collect(), stack: allocate_stack(geometry) }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        for ring in &self.rings {
            let d2 = squared_distance(event.kx, event.ky, ring.offset);

            if d2 >= ring.inner_radius_sqr && d2 <= ring.outer_radius_sqr {
                if let Some(plane) = self.stack.get(event.image_index as usize) {
                    plane.add(event.probe_position as usize, event.weight as u64);
                }
            }
        }
    }
}


/// Weights events by an arbitrary detector mask.
#[derive(Debug)]
pub struct MaskedVirtualStem {
    mask: Arc<Vec<u64>>,
    detector: usize,
    pub stack: Vec<SharedImage>,
}

impl MaskedVirtualStem {

    pub fn new(mask: Arc<Vec<u64>>, geometry: ScanGeometry) -> Self {
        debug_assert_eq!(mask.len(), geometry.detector * geometry.detector);
        Self { mask, detector: geometry.detector, stack: allocate_stack(geometry) }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let weight = self.mask[event.kx as usize * self.detector + event.ky as usize];

        if let Some(plane) = self.stack.get(event.image_index as usize) {
            plane.add(event.probe_position as usize, weight * event.weight as u64);
        }
    }
}


/// First-moment accumulators feeding the ricom reducer: per probe position
/// a dose count and the sums of kx and ky, double-buffered across images.
#[derive(Debug)]
pub struct CenterOfMass {
    pub dose: ImagePair,
    pub sum_x: ImagePair,
    pub sum_y: ImagePair,
    mask: Option<Arc<Vec<u64>>>,
    detector: usize,
}

impl CenterOfMass {

    pub fn new(geometry: ScanGeometry) -> Self {
        let nxy = geometry.nxy();

        Self {
            dose: ImagePair::zeroed(nxy),
            sum_x: ImagePair::zeroed(nxy),
            sum_y: ImagePair::zeroed(nxy),
            mask: None,
            detector: geometry.detector,
        }
    }

    /// Only count events where the detector mask is set.
    pub fn masked(geometry: ScanGeometry, mask: Arc<Vec<u64>>) -> Self {
        debug_assert_eq!(mask.len(), geometry.detector * geometry.detector);
        Self { mask: Some(mask), ..Self::new(geometry) }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let mut weight = event.weight as u64;

        if let Some(mask) = &self.mask {
            weight *= mask[event.kx as usize * self.detector + event.ky as usize];
        }

        let position = event.probe_position as usize;
        self.dose.slot(event.image_index).add(position, weight);
        self.sum_x.slot(event.image_index).add(position, event.kx as u64 * weight);
        self.sum_y.slot(event.image_index).add(position, event.ky as u64 * weight);
    }
}


/// The position-averaged diffraction pattern: a single detector-sized
/// histogram integrated over every probe position.
#[derive(Debug)]
pub struct Pacbed {
    pub pattern: SharedImage,
    detector: usize,
}

impl Pacbed {

    pub fn new(geometry: ScanGeometry) -> Self {
        Self {
            pattern: SharedImage::zeroed(geometry.detector * geometry.detector),
            detector: geometry.detector,
        }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let cell = event.kx as usize * self.detector + event.ky as usize;
        self.pattern.add(cell, event.weight as u64);
    }
}


/// Accumulates the squared detector distance from a common center,
/// double-buffered across images like the first-moment planes.
#[derive(Debug)]
pub struct Variance {
    pub planes: ImagePair,
    offset: Vec2<f32>,
}

impl Variance {

    pub fn new(geometry: ScanGeometry, offset: Vec2<f32>) -> Self {
        Self { planes: ImagePair::zeroed(geometry.nxy()), offset }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let d2 = squared_distance(event.kx, event.ky, self.offset) as u64;

        self.planes.slot(event.image_index)
            .add(event.probe_position as usize, d2 * event.weight as u64);
    }
}


/// The scan-space box selecting events for the ROI kernels.
/// The vertical axis is flipped relative to the scan row, and the
/// comparisons below mirror the acquisition convention exactly.
#[derive(Debug, Clone, Copy)]
pub struct RoiBox {
    lower_left: Vec2<i64>,
    upper_right: Vec2<i64>,
    width: i64,
    height: i64,
    nx: i64,
}

impl RoiBox {

    pub fn new(window: RoiWindow, geometry: ScanGeometry) -> Self {
        let lower_left = window.origin.map(|value| value as i64);
        let size = window.size.map(|value| value as i64);

        Self {
            lower_left,
            upper_right: Vec2(lower_left.x() + size.x(), lower_left.y() + size.y()),
            width: size.x(),
            height: size.y(),
            nx: geometry.nx as i64,
        }
    }

    /// The ROI-local scan cell of a probe position, or `None` outside.
    #[inline]
    fn scan_cell(&self, probe_position: u64) -> Option<usize> {
        let x = (probe_position as i64) % self.nx;
        let y = self.nx - (probe_position as i64) / self.nx;

        let hit = x >= self.lower_left.x() && x < self.upper_right.x()
            && y > self.lower_left.y() && y <= self.upper_right.y();

        if !hit { return None }

        let local_y = self.height - (y - self.lower_left.y());
        let local_x = x - self.lower_left.x();
        Some((local_y * self.width + local_x) as usize)
    }

    pub fn area(&self) -> usize {
        (self.width * self.height) as usize
    }
}


/// Region-of-interest extraction: a diffraction histogram and a scan map,
/// each kept per image and aggregated over all images.
#[derive(Debug)]
pub struct Roi {
    region: RoiBox,
    detector: usize,

    /// Weight diffraction cells by time over threshold instead of counts.
    weight_by_tot: bool,

    pub diffraction_stack: Vec<SharedImage>,
    pub scan_stack: Vec<SharedImage>,
    pub diffraction: SharedImage,
    pub scan: SharedImage,
}

impl Roi {

    pub fn new(window: RoiWindow, geometry: ScanGeometry, weight_by_tot: bool) -> Self {
        let region = RoiBox::new(window, geometry);
        let detector_area = geometry.detector * geometry.detector;

        Self {
            region,
            detector: geometry.detector,
            weight_by_tot,
            diffraction_stack: (0..=geometry.rep).map(|_| SharedImage::zeroed(detector_area)).collect(),
            scan_stack: (0..=geometry.rep).map(|_| SharedImage::zeroed(region.area())).collect(),
            diffraction: SharedImage::zeroed(detector_area),
            scan: SharedImage::zeroed(region.area()),
        }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let cell = match self.region.scan_cell(event.probe_position) {
            Some(cell) => cell,
            None => return,
        };

        let detector_cell = event.kx as usize * self.detector + event.ky as usize;
        let counts = event.weight as u64;
        let diffraction_counts = if self.weight_by_tot { event.tot as u64 } else { counts };

        if let Some(plane) = self.diffraction_stack.get(event.image_index as usize) {
            plane.add(detector_cell, diffraction_counts);
        }

        if let Some(plane) = self.scan_stack.get(event.image_index as usize) {
            plane.add(cell, counts);
        }

        self.diffraction.add(detector_cell, diffraction_counts);
        self.scan.add(cell, counts);
    }
}


/// ROI selected by a precomputed per-probe-position mask instead of a box.
/// The scan maps stay in full scan coordinates.
#[derive(Debug)]
pub struct RoiMask {
    masks: Vec<Arc<Vec<u8>>>,
    detector: usize,

    pub diffraction_stack: Vec<SharedImage>,
    pub scan_stack: Vec<SharedImage>,
    pub diffraction: SharedImage,
    pub scan: SharedImage,
}

impl RoiMask {

    /// One mask per image, each `nxy` cells of zero or one.
    pub fn new(masks: Vec<Arc<Vec<u8>>>, geometry: ScanGeometry) -> Self {
        let detector_area = geometry.detector * geometry.detector;
        let nxy = geometry.nxy();
        debug_assert!(masks.iter().all(|mask| mask.len() == nxy));

        Self {
            masks,
            detector: geometry.detector,
            diffraction_stack: (0..=geometry.rep).map(|_| SharedImage::zeroed(detector_area)).collect(),
            scan_stack: (0..=geometry.rep).map(|_| SharedImage::zeroed(nxy)).collect(),
            diffraction: SharedImage::zeroed(detector_area),
            scan: SharedImage::zeroed(nxy),
        }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let image = event.image_index as usize;
        let position = event.probe_position as usize;

        let selected = self.masks.get(image)
            .map_or(false, |mask| mask[position] == 1);
        if !selected { return }

        let detector_cell = event.kx as usize * self.detector + event.ky as usize;
        let counts = event.weight as u64;

        if let Some(plane) = self.diffraction_stack.get(image) {
            plane.add(detector_cell, counts);
        }

        if let Some(plane) = self.scan_stack.get(image) {
            plane.add(position, counts);
        }

        self.diffraction.add(detector_cell, counts);
        self.scan.add(position, counts);
    }
}


/// The rank-4 tensor accumulated by the ROI-4D kernel:
/// `(roi height, roi width, det/bin, det/bin)`.
#[derive(Debug)]
pub struct Roi4dTensor {
    pub shape: [usize; 4],
    pub cells: SharedImage,
}

impl Roi4dTensor {

    pub fn zeroed(shape: [usize; 4]) -> Self {
        Self { shape, cells: SharedImage::zeroed(shape.iter().product()) }
    }

    #[inline]
    fn flat_index(&self, scan_cell: usize, k_row: usize, k_column: usize) -> usize {
        (scan_cell * self.shape[2] + k_row) * self.shape[3] + k_column
    }

    pub fn get(&self, row: usize, column: usize, k_row: usize, k_column: usize) -> u64 {
        self.cells.get(self.flat_index(row * self.shape[1] + column, k_row, k_column))
    }
}

/// ROI extraction that additionally fills a binned rank-4 tensor.
#[derive(Debug)]
pub struct RoiFourD {
    region: RoiBox,
    detector: usize,
    det_bin: usize,

    pub tensor: Arc<Roi4dTensor>,
    pub diffraction: SharedImage,
    pub scan: SharedImage,
}

impl RoiFourD {

    pub fn new(window: RoiWindow, geometry: ScanGeometry, det_bin: usize) -> Self {
        let region = RoiBox::new(window, geometry);
        let binned = geometry.detector / det_bin;

        Self {
            region,
            detector: geometry.detector,
            det_bin,
            tensor: Arc::new(Roi4dTensor::zeroed([
                window.size.y(), window.size.x(), binned, binned,
            ])),
            diffraction: SharedImage::zeroed(geometry.detector * geometry.detector),
            scan: SharedImage::zeroed(region.area()),
        }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let cell = match self.region.scan_cell(event.probe_position) {
            Some(cell) => cell,
            None => return,
        };

        let counts = event.weight as u64;
        self.diffraction.add(event.kx as usize * self.detector + event.ky as usize, counts);
        self.scan.add(cell, counts);

        let index = self.tensor.flat_index(
            cell,
            event.kx as usize / self.det_bin,
            event.ky as usize / self.det_bin,
        );

        self.tensor.cells.add(index, counts);
    }
}


/// Accumulates binned diffraction patterns into one of two chunk buffers,
/// plus a binned dose map. The buffer for the chunk currently being
/// flushed is held under its mutex by the writer; the active buffer's
/// mutex is free, so the per-event lock is nominally contended only.
#[derive(Debug)]
pub enum ChunkStore {
    Depth8(ChunkPair<u8>),
    Depth16(ChunkPair<u16>),
    Depth32(ChunkPair<u32>),
}

impl ChunkStore {

    #[inline]
    fn bump(&self, chunk_index: usize, cell: usize, weight: u32) {
        match self {
            ChunkStore::Depth8(pair) => pair.lock(chunk_index)[cell].bump(weight),
            ChunkStore::Depth16(pair) => pair.lock(chunk_index)[cell].bump(weight),
            ChunkStore::Depth32(pair) => pair.lock(chunk_index)[cell].bump(weight),
        }
    }

    fn flushed_chunks(&self) -> usize {
        match self {
            ChunkStore::Depth8(pair) => pair.flushed_chunks(),
            ChunkStore::Depth16(pair) => pair.flushed_chunks(),
            ChunkStore::Depth32(pair) => pair.flushed_chunks(),
        }
    }
}

/// Ties each sample type to its variant of the chunk store, so the 4D
/// analysis can stay generic over the bit depth.
pub trait IntoChunkStore: CountSample {
    fn into_store(pair: ChunkPair<Self>) -> ChunkStore;
}

impl IntoChunkStore for u8 {
    fn into_store(pair: ChunkPair<Self>) -> ChunkStore { ChunkStore::Depth8(pair) }
}

impl IntoChunkStore for u16 {
    fn into_store(pair: ChunkPair<Self>) -> ChunkStore { ChunkStore::Depth16(pair) }
}

impl IntoChunkStore for u32 {
    fn into_store(pair: ChunkPair<Self>) -> ChunkStore { ChunkStore::Depth32(pair) }
}

/// The event kernel of the chunked 4D pipeline.
#[derive(Debug)]
pub struct ChunkedFourD {
    store: ChunkStore,

    /// Scan-binned dose map over the whole scan.
    pub dose: SharedImage,

    nx: usize,
    scan_bin: usize,
    det_bin: usize,
    binned_detector: usize,
    binned_nx: usize,

    /// Scan-binned rows per chunk.
    chunk_rows: usize,

    progress: Arc<Progress>,
}

impl ChunkedFourD {

    pub fn new(
        store: ChunkStore, geometry: ScanGeometry,
        scan_bin: usize, det_bin: usize, chunksize: usize,
        progress: Arc<Progress>,
    ) -> Self {
        let binned_nx = geometry.nx / scan_bin;
        let binned_ny = geometry.ny / scan_bin;

        Self {
            store,
            dose: SharedImage::zeroed(binned_nx * binned_ny),
            nx: geometry.nx,
            scan_bin,
            det_bin,
            binned_detector: geometry.detector / det_bin,
            binned_nx,
            chunk_rows: chunksize / scan_bin,
            progress,
        }
    }

    /// Samples in one chunk buffer.
    pub fn samples_per_chunk(&self) -> usize {
        self.chunk_rows * self.binned_nx * self.binned_detector * self.binned_detector
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let position = event.probe_position as usize;
        let x = (position % self.nx) / self.scan_bin;
        let y = (position / self.nx) / self.scan_bin;
        let binned_position = y * self.binned_nx + x;

        self.dose.add(binned_position, event.weight as u64);

        let positions_per_chunk = self.chunk_rows * self.binned_nx;
        let chunk_index = binned_position / positions_per_chunk;

        // a buffer holds the chunk after next only once its current chunk
        // is flushed; wait for the writer when the decoder runs ahead
        while chunk_index >= self.store.flushed_chunks() + 2 {
            if self.progress.is_cancelled() { return }
            std::thread::sleep(crate::ring::POLL_SLEEP);
        }

        let pattern_size = self.binned_detector * self.binned_detector;
        let cell = (binned_position % positions_per_chunk) * pattern_size
            + (event.kx as usize / self.det_bin) * self.binned_detector
            + event.ky as usize / self.det_bin;

        self.store.bump(chunk_index, cell, event.weight);
    }
}


/// Streams cropped, binned electron records straight to the output file.
/// A write failure is fatal: it raises the quit bit and the run aborts.
#[derive(Debug)]
pub struct ElectronWriter {
    file: Option<ElectronFile<std::fs::File>>,
    reduction: crate::decluster::ElectronReduction,
    nx: u64,
    progress: Arc<Progress>,
    pub error: Option<Error>,
}

impl ElectronWriter {

    pub fn new(
        file: ElectronFile<std::fs::File>,
        reduction: crate::decluster::ElectronReduction,
        geometry: ScanGeometry,
        progress: Arc<Progress>,
    ) -> Self {
        Self { file: Some(file), reduction, nx: geometry.nx as u64, progress, error: None }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let record = self.reduction.reduce(
            event.kx, event.ky,
            (event.probe_position % self.nx) as u16,
            (event.probe_position / self.nx) as u16,
            event.image_index,
        );

        if let (Some(record), Some(file)) = (record, self.file.as_mut()) {
            if let Err(error) = file.append(record) {
                log::error!("electron file write failed: {}", error);
                self.error = Some(error);
                self.file = None;
                self.progress.request_quit();
            }
        }
    }

    /// Write the terminator and close the file.
    pub fn finish(&mut self) -> UnitResult {
        if let Some(error) = self.error.take() { return Err(error) }

        match self.file.take() {
            Some(file) => file.finish(),
            None => Ok(()),
        }
    }
}


/// Collects events for the decluster pipeline instead of writing them
/// directly; the buffer is handed over at every raw chunk boundary.
#[derive(Debug)]
pub struct DeclusterFeed {
    buffer: Vec<ClusterEvent>,
    output: SyncSender<Vec<ClusterEvent>>,
    nx: u64,
}

impl DeclusterFeed {

    pub fn new(output: SyncSender<Vec<ClusterEvent>>, geometry: ScanGeometry) -> Self {
        Self { buffer: Vec::new(), output, nx: geometry.nx as u64 }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        self.buffer.push(ClusterEvent {
            kx: event.kx,
            ky: event.ky,
            rx: (event.probe_position % self.nx) as u16,
            ry: (event.probe_position / self.nx) as u16,
            image_index: event.image_index,
            toa: event.toa,
            tot: event.tot,
        });
    }

    /// Hand the buffer over; blocks when the decluster pipeline is
    /// `PIPELINE_DEPTH` buffers behind.
    fn flush(&mut self) {
        if self.buffer.is_empty() { return }

        let buffer = std::mem::take(&mut self.buffer);
        if self.output.send(buffer).is_err() {
            log::error!("decluster pipeline hung up early");
        }
    }
}


/// Shannon surprise map: each event adds the negative log probability of
/// its detector cell, alongside a plain count map.
#[derive(Debug)]
pub struct Information {
    probability: Arc<Vec<f32>>,
    detector: usize,

    /// Accumulated surprise in bits per probe position.
    pub information: Vec<f64>,
    pub counts: SharedImage,
}

impl Information {

    pub fn new(probability: Arc<Vec<f32>>, geometry: ScanGeometry) -> Self {
        debug_assert_eq!(probability.len(), geometry.detector * geometry.detector);

        Self {
            probability,
            detector: geometry.detector,
            information: vec![0.0; geometry.nxy()],
            counts: SharedImage::zeroed(geometry.nxy()),
        }
    }

    #[inline]
    fn process(&mut self, event: &Event) {
        let cell = event.kx as usize * self.detector + event.ky as usize;
        let position = event.probe_position as usize;

        self.information[position] +=
            -f64::from(self.probability[cell]).log2() * f64::from(event.weight);

        self.counts.add(position, event.weight as u64);
    }
}


/// Every aggregation kernel a run can enable.
#[derive(Debug)]
pub enum EventKernel {
    VirtualStem(VirtualStem),
    MultiVirtualStem(MultiVirtualStem),
    MaskedVirtualStem(MaskedVirtualStem),
    CenterOfMass(CenterOfMass),
    Pacbed(Pacbed),
    Variance(Variance),
    Roi(Roi),
    RoiMask(RoiMask),
    RoiFourD(RoiFourD),
    ChunkedFourD(ChunkedFourD),
    WriteElectron(ElectronWriter),
    DeclusterFeed(DeclusterFeed),
    Information(Information),
}

impl EventKernel {

    #[inline]
    pub fn process(&mut self, event: &Event) {
        match self {
            EventKernel::VirtualStem(kernel) => kernel.process(event),
            EventKernel::MultiVirtualStem(kernel) => kernel.process(event),
            EventKernel::MaskedVirtualStem(kernel) => kernel.process(event),
            EventKernel::CenterOfMass(kernel) => kernel.process(event),
            EventKernel::Pacbed(kernel) => kernel.process(event),
            EventKernel::Variance(kernel) => kernel.process(event),
            EventKernel::Roi(kernel) => kernel.process(event),
            EventKernel::RoiMask(kernel) => kernel.process(event),
            EventKernel::RoiFourD(kernel) => kernel.process(event),
            EventKernel::ChunkedFourD(kernel) => kernel.process(event),
            EventKernel::WriteElectron(kernel) => kernel.process(event),
            EventKernel::DeclusterFeed(kernel) => kernel.process(event),
            EventKernel::Information(kernel) => kernel.process(event),
        }
    }

    /// Called by the decoder after each raw chunk.
    fn finish_chunk(&mut self) {
        if let EventKernel::DeclusterFeed(kernel) = self {
            kernel.flush();
        }
    }
}


/// The kernel of the running analysis plus any downstream kernels
/// attached to the same decoded stream.
#[derive(Debug)]
pub struct KernelSet {
    pub primary: EventKernel,
    pub children: SmallVec<[EventKernel; 2]>,
}

impl KernelSet {

    pub fn single(primary: EventKernel) -> Self {
        Self { primary, children: SmallVec::new() }
    }

    pub fn attach(&mut self, child: EventKernel) {
        self.children.push(child);
    }

    #[inline]
    pub fn process(&mut self, event: &Event) {
        self.primary.process(event);
        for child in &mut self.children {
            child.process(event);
        }
    }

    pub fn finish_chunk(&mut self) {
        self.primary.finish_chunk();
        for child in &mut self.children {
            child.finish_chunk();
        }
    }
}

fn allocate_stack(geometry: ScanGeometry) -> Vec<SharedImage> {
    // one plane per image, plus one so a racing final line cannot overrun
    (0..=geometry.rep).map(|_| SharedImage::zeroed(geometry.nxy())).collect()
}


#[cfg(test)]
mod test {
    use super::*;

    fn geometry() -> ScanGeometry {
        ScanGeometry { nx: 8, ny: 8, rep: 1, dwell_ns: 1000, detector: 16 }
    }

    fn event_at(probe_position: u64, kx: u16, ky: u16) -> Event {
        Event::plain(probe_position, kx, ky, 0)
    }

    #[test]
    fn annulus_excludes_inner_and_includes_outer_bound(){
        let ring = AnnularRing::new(2.0, 4.0, Vec2(8.0, 8.0));
        let mut kernel = VirtualStem::new(ring, geometry());

        kernel.process(&event_at(0, 10, 8)); // d2 = 4, on the strict inner bound
        kernel.process(&event_at(1, 12, 8)); // d2 = 16, on the outer bound
        kernel.process(&event_at(2, 13, 8)); // d2 = 25, outside

        assert_eq!(kernel.stack[0].get(0), 0);
        assert_eq!(kernel.stack[0].get(1), 1);
        assert_eq!(kernel.stack[0].get(2), 0);
    }

    #[test]
    fn center_of_mass_accumulates_moments(){
        let mut kernel = CenterOfMass::new(geometry());
        kernel.process(&event_at(3, 4, 5));
        kernel.process(&event_at(3, 6, 1));

        assert_eq!(kernel.dose.slot(0).get(3), 2);
        assert_eq!(kernel.sum_x.slot(0).get(3), 10);
        assert_eq!(kernel.sum_y.slot(0).get(3), 6);
    }

    #[test]
    fn roi_flips_the_vertical_axis(){
        let geometry = geometry();
        let window = RoiWindow { origin: Vec2(0, 0), size: Vec2(8, 8) };
        let region = RoiBox::new(window, geometry);

        // probe position zero is scan row zero, y = nx - 0 = 8, the top row
        assert_eq!(region.scan_cell(0), Some(0));

        // one row down: y = 7, local row 1
        assert_eq!(region.scan_cell(8), Some(8));

        // last row: y = 1, local row 7
        assert_eq!(region.scan_cell(56), Some(56));
    }

    #[test]
    fn identity_roi_accepts_every_position(){
        let geometry = geometry();
        let window = RoiWindow { origin: Vec2(0, 0), size: Vec2(8, 8) };
        let mut kernel = Roi::new(window, geometry, false);

        for position in 0..geometry.nxy() as u64 {
            kernel.process(&event_at(position, 0, 0));
        }

        assert_eq!(kernel.scan.sum(), 64);
        assert_eq!(kernel.diffraction.get(0), 64);
    }

    #[test]
    fn roi_box_rejects_outside(){
        let geometry = geometry();
        let window = RoiWindow { origin: Vec2(2, 2), size: Vec2(4, 4) };
        let region = RoiBox::new(window, geometry);

        // x = 0 is left of the box
        assert_eq!(region.scan_cell(0), None);

        // row 3, x = 3: y = 8 - 3 = 5, inside (2, 6]
        let cell = region.scan_cell(3 * 8 + 3);
        assert_eq!(cell, Some((4 - (5 - 2)) * 4 + 1));
    }

    #[test]
    fn chunked_fourd_bins_and_wraps(){
        let geometry = ScanGeometry { nx: 8, ny: 8, rep: 1, dwell_ns: 0, detector: 16 };
        let store = ChunkStore::Depth8(ChunkPair::zeroed(2 * 8 * 8 * 8));
        let mut kernel = ChunkedFourD::new(
            store, geometry, 1, 2, 2, Arc::new(Progress::new()),
        );

        // probe 9 = row 1 column 1, chunk 0; detector (4, 6) bins to (2, 3)
        kernel.process(&event_at(9, 4, 6));
        assert_eq!(kernel.dose.get(9), 1);

        // probe in row 2 lands in chunk 1
        kernel.process(&event_at(2 * 8, 0, 0));

        match &kernel.store {
            ChunkStore::Depth8(pair) => {
                let chunk0 = pair.lock(0);
                assert_eq!(chunk0[9 * 64 + 2 * 8 + 3], 1);

                let chunk1 = pair.lock(1);
                assert_eq!(chunk1[0], 1);
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn information_adds_surprise(){
        let geometry = geometry();
        let mut probability = vec![1.0_f32; 16 * 16];
        probability[3 * 16 + 4] = 0.25;

        let mut kernel = Information::new(Arc::new(probability), geometry);
        kernel.process(&event_at(7, 3, 4));

        assert!((kernel.information[7] - 2.0).abs() < 1e-9);
        assert_eq!(kernel.counts.get(7), 1);
    }
}

//! Suppress multi-pixel clusters: one scattering electron lights up
//! neighbouring detector pixels within a short time window, and only the
//! first event of each such cluster should reach the electron file.
//!
//! This is a secondary pipeline behind the main consumer. Whole event
//! buffers travel through two bounded channels: the event kernel fills a
//! buffer per raw chunk and hands it to the decluster stage, which hands
//! the surviving events to the writer stage. The channel bounds give the
//! same backpressure as a 128-slot ring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result, UnitResult};
use crate::event::{ElectronFile, ElectronRecord};

/// How many event buffers may queue up before the main consumer blocks.
pub const PIPELINE_DEPTH: usize = 128;


/// One event awaiting declustering, with full position and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kx: u16,
    pub ky: u16,
    pub rx: u16,
    pub ry: u16,
    pub image_index: u16,

    /// Time of arrival in nanoseconds.
    pub toa: u64,

    pub tot: u16,
}

/// Tolerances deciding whether two events belong to the same cluster.
#[derive(Debug, Clone, Copy)]
pub struct DeclusterParams {

    /// Maximum time-of-arrival distance in nanoseconds.
    pub dtime: u64,

    /// Maximum detector pixel distance, per axis.
    pub dspace: u16,

    /// How many subsequent events to search for cluster members.
    /// 256 closes well over 99% of clusters on real streams.
    pub cluster_range: usize,
}

impl Default for DeclusterParams {
    fn default() -> Self {
        Self { dtime: 100, dspace: 6, cluster_range: 256 }
    }
}

/// Scan-space crop and binning applied by the writer stage,
/// the same reductions as the inline electron writer.
#[derive(Debug, Clone, Copy)]
pub struct ElectronReduction {
    pub scan_bin: u16,
    pub det_bin: u16,
    pub x_crop: u16,
    pub y_crop: u16,
}

impl ElectronReduction {

    /// Reduce an event to its file record, or `None` if cropped away.
    pub fn reduce(&self, kx: u16, ky: u16, rx: u16, ry: u16, image_index: u16) -> Option<ElectronRecord> {
        let record = ElectronRecord {
            kx: kx / self.det_bin,
            ky: ky / self.det_bin,
            rx: rx / self.scan_bin,
            ry: ry / self.scan_bin,
            image_index,
        };

        let keep = record.rx < self.x_crop / self.scan_bin
            && record.ry < self.y_crop / self.scan_bin;

        if keep { Some(record) } else { None }
    }
}


/// Keep the first event of every cluster in the buffer, in order.
/// Each event searches at most `cluster_range` events ahead, so the cost
/// is linear in the buffer length. The histogram counts cluster sizes.
pub fn decluster_buffer(
    events: &[ClusterEvent],
    params: DeclusterParams,
    histogram: &mut [u64],
) -> Vec<usize> {
    let mut consumed = vec![false; events.len()];
    let mut keep = Vec::new();

    for first in 0..events.len() {
        if consumed[first] { continue }

        let mut cluster_size = 1_u64;
        let search_end = (first + params.cluster_range).min(events.len());

        for candidate in first + 1 .. search_end {
            if consumed[candidate] { continue }

            let a = &events[first];
            let b = &events[candidate];

            let near_x = a.kx.abs_diff(b.kx) <= params.dspace;
            let near_y = a.ky.abs_diff(b.ky) <= params.dspace;
            let near_t = a.toa.abs_diff(b.toa) <= params.dtime;

            if near_x && near_y && near_t {
                consumed[candidate] = true;
                cluster_size += 1;
            }
        }

        if let Some(bucket) = histogram.get_mut(cluster_size as usize) {
            *bucket += 1;
        }

        keep.push(first);
    }

    keep
}


/// The running decluster pipeline: feed buffers in, join for the results.
#[derive(Debug)]
pub struct Declusterer {
    input: SyncSender<Vec<ClusterEvent>>,
    decluster_worker: JoinHandle<Vec<u64>>,
    write_worker: JoinHandle<UnitResult>,
    electrons_kept: Arc<AtomicU64>,
}

/// What the pipeline produced once it has drained.
#[derive(Debug)]
pub struct DeclusterOutcome {

    /// Histogram of observed cluster sizes, indexed by size.
    pub cluster_size_histogram: Vec<u64>,

    /// Electrons that survived declustering and cropping.
    pub electrons_kept: u64,
}

impl Declusterer {

    /// Spawn the decluster and writer stages.
    pub fn spawn(
        params: DeclusterParams,
        reduction: ElectronReduction,
        file: ElectronFile<std::fs::File>,
        histogram_len: usize,
    ) -> Self {
        log::info!(
            "declustering with dtime = {} ns, dspace = {}, cluster range = {}",
            params.dtime, params.dspace, params.cluster_range
        );

        let (input, buffers) = sync_channel::<Vec<ClusterEvent>>(PIPELINE_DEPTH);
        let (kept_send, kept_receive) = sync_channel::<Vec<ClusterEvent>>(PIPELINE_DEPTH);

        let electrons_kept = Arc::new(AtomicU64::new(0));
        let kept_counter = Arc::clone(&electrons_kept);

        let decluster_worker = std::thread::spawn(move || {
            let mut histogram = vec![0_u64; histogram_len];

            for buffer in buffers {
                let keep = decluster_buffer(&buffer, params, &mut histogram);
                kept_counter.fetch_add(keep.len() as u64, Ordering::Relaxed);

                let survivors = keep.into_iter().map(|index| buffer[index]).collect();
                if kept_send.send(survivors).is_err() { break }
            }

            histogram
        });

        let write_worker = std::thread::spawn(move || {
            let mut file = file;

            for survivors in kept_receive {
                for event in survivors {
                    let record = reduction.reduce(
                        event.kx, event.ky, event.rx, event.ry, event.image_index,
                    );

                    if let Some(record) = record {
                        file.append(record)?;
                    }
                }
            }

            file.finish()
        });

        Self { input, decluster_worker, write_worker, electrons_kept }
    }

    /// The sender the event kernel pushes full buffers into.
    /// Sending blocks while the pipeline is `PIPELINE_DEPTH` buffers behind.
    pub fn input(&self) -> SyncSender<Vec<ClusterEvent>> {
        self.input.clone()
    }

    /// Signal the end of the stream, drain both stages, and join.
    pub fn finish(self) -> Result<DeclusterOutcome> {
        let Self { input, decluster_worker, write_worker, electrons_kept } = self;
        drop(input);

        let cluster_size_histogram = decluster_worker.join()
            .map_err(|_| Error::invalid("decluster worker panicked"))?;

        write_worker.join()
            .map_err(|_| Error::invalid("electron writer panicked"))??;

        let electrons_kept = electrons_kept.load(Ordering::Relaxed);
        log::info!("{} electrons kept", electrons_kept);

        Ok(DeclusterOutcome { cluster_size_histogram, electrons_kept })
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn event(kx: u16, ky: u16, toa: u64) -> ClusterEvent {
        ClusterEvent { kx, ky, rx: 0, ry: 0, image_index: 0, toa, tot: 0 }
    }

    #[test]
    fn keeps_first_of_cluster_and_singletons(){
        let params = DeclusterParams { dtime: 100, dspace: 6, cluster_range: 256 };
        let events = [
            event(10, 10, 1000),
            event(11, 11, 1005),
            event(12, 12, 1010),
            event(200, 200, 2000),
        ];

        let mut histogram = vec![0_u64; 16];
        let keep = decluster_buffer(&events, params, &mut histogram);

        assert_eq!(keep, vec![0, 3]);
        assert_eq!(histogram[3], 1); // the three-event cluster
        assert_eq!(histogram[1], 1); // the singleton
    }

    #[test]
    fn zero_tolerances_are_the_identity(){
        let params = DeclusterParams { dtime: 0, dspace: 0, cluster_range: 256 };
        let events: Vec<ClusterEvent> = (0..20)
            .map(|index| event(index * 2, 0, index as u64 * 2))
            .collect();

        let mut histogram = vec![0_u64; 4];
        let keep = decluster_buffer(&events, params, &mut histogram);

        assert_eq!(keep.len(), events.len());
        assert_eq!(histogram[1], 20);
    }

    #[test]
    fn declustered_output_is_a_fixed_point(){
        let params = DeclusterParams::default();
        let events = [
            event(10, 10, 1000),
            event(11, 11, 1005),
            event(50, 50, 1000),
            event(10, 10, 5000),
        ];

        let mut histogram = vec![0_u64; 16];
        let keep = decluster_buffer(&events, params, &mut histogram);
        let survivors: Vec<ClusterEvent> = keep.iter().map(|&index| events[index]).collect();

        let again = decluster_buffer(&survivors, params, &mut histogram);
        assert_eq!(again.len(), survivors.len());
    }

    #[test]
    fn search_window_is_bounded(){
        let params = DeclusterParams { dtime: 1000, dspace: 6, cluster_range: 2 };
        let events = [
            event(10, 10, 0),
            event(10, 10, 1),
            event(10, 10, 2), // outside the window of the first event
        ];

        let mut histogram = vec![0_u64; 8];
        let keep = decluster_buffer(&events, params, &mut histogram);
        assert_eq!(keep, vec![0, 2]);
    }
}

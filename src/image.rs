//! Output planes shared between the decoding worker and the reducer.
//!
//! Kernels are partitioned by probe position, so no two threads update the
//! same cell at the same time; the cells are atomics anyway, which lets the
//! reducer and the host read completed lines while later lines are still
//! being filled, without any locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;


/// A flat plane of relaxed atomic counters, cheap to clone and share.
#[derive(Debug, Clone)]
pub struct SharedImage {
    cells: Arc<[AtomicU64]>,
}

impl SharedImage {

    /// Allocate a zeroed plane of `len` cells.
    pub fn zeroed(len: usize) -> Self {
        Self { cells: (0..len).map(|_| AtomicU64::new(0)).collect() }
    }

    pub fn len(&self) -> usize { self.cells.len() }

    pub fn is_empty(&self) -> bool { self.cells.is_empty() }

    #[inline]
    pub fn add(&self, index: usize, count: u64) {
        self.cells[index].fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        self.cells[index].load(Ordering::Relaxed)
    }

    /// Zero every cell. Only called at points where no other thread
    /// writes this plane, such as double-buffer hand-over.
    pub fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the current cell values out, for the host or for assertions.
    pub fn snapshot(&self) -> Vec<u64> {
        self.cells.iter().map(|cell| cell.load(Ordering::Relaxed)).collect()
    }

    pub fn sum(&self) -> u64 {
        self.cells.iter().map(|cell| cell.load(Ordering::Relaxed)).sum()
    }
}


/// The two alternating planes that double-buffer per-image accumulators
/// across consecutive images.
#[derive(Debug, Clone)]
pub struct ImagePair {
    planes: [SharedImage; 2],
}

impl ImagePair {

    pub fn zeroed(len: usize) -> Self {
        Self { planes: [SharedImage::zeroed(len), SharedImage::zeroed(len)] }
    }

    /// The plane accumulating the given image.
    #[inline]
    pub fn slot(&self, image_index: u16) -> &SharedImage {
        &self.planes[image_index as usize % 2]
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accumulates_and_snapshots(){
        let image = SharedImage::zeroed(4);
        image.add(1, 3);
        image.add(1, 2);
        image.add(3, 1);

        assert_eq!(image.snapshot(), vec![0, 5, 0, 1]);
        assert_eq!(image.sum(), 6);

        image.clear();
        assert_eq!(image.sum(), 0);
    }

    #[test]
    fn pair_alternates(){
        let pair = ImagePair::zeroed(2);
        pair.slot(0).add(0, 1);
        pair.slot(1).add(0, 10);
        pair.slot(2).add(0, 1);

        assert_eq!(pair.slot(0).get(0), 2);
        assert_eq!(pair.slot(1).get(0), 10);
    }
}

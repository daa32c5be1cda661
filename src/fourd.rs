//! The compressed four-dimensional output container.
//!
//! The dataset is a rank-4 tensor `(ny/bin, nx/bin, det/bin, det/bin)`
//! written as a sequence of zlib-compressed chunks of whole scan rows.
//! A chunk offset table is reserved up front and patched once the last
//! chunk has been written, so a truncated run leaves a recognizably
//! incomplete file instead of a silently wrong one.
//!
//! Layout, all little-endian:
//!
//! ```text
//! b"4DST"                 magic
//! u32                     format version, currently 1
//! u16 * 4                 shape: ny/bin, nx/bin, det/bin, det/bin
//! u32                     rows per chunk (already scan-binned)
//! u8                      bit depth: 8, 16 or 32
//! u8                      deflate level: 1..=9
//! u32                     chunk count
//! u64 * chunk_count       chunk byte offsets, patched on finish
//! per chunk: u64 length followed by a zlib stream
//! ```

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use miniz_oxide::deflate::compress_to_vec_zlib;
use zune_inflate::DeflateDecoder;

use crate::error::{u64_to_usize, usize_to_u64, Error, Result, UnitResult};
use crate::io::{Data, Tracking};

const MAGIC: [u8; 4] = *b"4DST";
const VERSION: u32 = 1;


/// One sample of the 4D tensor. Counts wrap at the chosen bit depth,
/// matching the acquisition hardware's own counters.
pub trait CountSample: Data + Copy + Default + Send + 'static {

    /// The bit depth recorded in the container header.
    const BIT_DEPTH: u8;

    /// Add detected counts to this sample.
    fn bump(&mut self, weight: u32);

    fn to_u64(self) -> u64;
}

macro_rules! implement_count_sample {
    ($kind: ident, $depth: expr) => {
        impl CountSample for $kind {
            const BIT_DEPTH: u8 = $depth;

            #[inline]
            #[allow(trivial_numeric_casts)]
            fn bump(&mut self, weight: u32) {
                *self = self.wrapping_add(weight as $kind);
            }

            fn to_u64(self) -> u64 { self as u64 }
        }
    };
}

implement_count_sample!(u8, 8);
implement_count_sample!(u16, 16);
implement_count_sample!(u32, 32);


/// The two alternating chunk buffers. The event kernel fills the active
/// buffer while the writer flushes and zeroes the other; each buffer has
/// its own mutex and the two sides only ever meet on a chunk boundary.
/// The flushed counter tells the kernel when a buffer may be reused for
/// the chunk after next.
#[derive(Debug, Clone)]
pub struct ChunkPair<T> {
    buffers: [Arc<Mutex<Vec<T>>>; 2],
    flushed: Arc<AtomicUsize>,
}

impl<T: CountSample> ChunkPair<T> {

    pub fn zeroed(samples_per_chunk: usize) -> Self {
        Self {
            buffers: [
                Arc::new(Mutex::new(vec![T::default(); samples_per_chunk])),
                Arc::new(Mutex::new(vec![T::default(); samples_per_chunk])),
            ],
            flushed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Lock the buffer that accumulates the given chunk.
    pub fn lock(&self, chunk_index: usize) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.buffers[chunk_index % 2].lock().expect("chunk buffer poisoned")
    }

    /// Chunks written out and zeroed so far.
    pub fn flushed_chunks(&self) -> usize {
        self.flushed.load(Ordering::Acquire)
    }

    /// Record that the next chunk in order has been written and zeroed.
    pub fn mark_flushed(&self) {
        self.flushed.fetch_add(1, Ordering::Release);
    }
}


/// The tensor dimensions and encoding parameters recorded at file open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {

    /// Scan-binned rows, scan-binned columns, binned detector, binned detector.
    pub shape: [usize; 4],

    /// Scan-binned rows per chunk.
    pub chunk_rows: usize,

    pub bit_depth: u8,
    pub deflate_level: u8,
}

impl ContainerLayout {

    pub fn chunk_count(&self) -> usize {
        self.shape[0] / self.chunk_rows
    }

    /// Samples in one chunk.
    pub fn samples_per_chunk(&self) -> usize {
        self.chunk_rows * self.shape[1] * self.shape[2] * self.shape[3]
    }
}


/// Writes chunks in increasing row order into a seekable byte sink.
#[derive(Debug)]
#[must_use]
pub struct ContainerWriter<W: Write + Seek> {
    write: Tracking<W>,
    layout: ContainerLayout,
    chunk_offsets: Vec<u64>,
    offset_table_position: usize,
}

impl<W: Write + Seek> ContainerWriter<W> {

    /// Write the header and a zeroed offset table placeholder.
    pub fn new(write: W, layout: ContainerLayout) -> Result<Self> {
        if layout.shape[0] % layout.chunk_rows != 0 {
            return Err(Error::invalid("chunk rows must divide the scan height"));
        }

        let mut write = Tracking::new(write);

        write.write_all(&MAGIC)?;
        VERSION.write(&mut write)?;

        for &extent in &layout.shape {
            (extent as u16).write(&mut write)?;
        }

        (layout.chunk_rows as u32).write(&mut write)?;
        layout.bit_depth.write(&mut write)?;
        layout.deflate_level.write(&mut write)?;
        (layout.chunk_count() as u32).write(&mut write)?;

        let offset_table_position = write.byte_position();
        u64::write_slice(&mut write, &vec![0_u64; layout.chunk_count()])?;

        Ok(Self {
            write, layout,
            chunk_offsets: vec![0; layout.chunk_count()],
            offset_table_position,
        })
    }

    pub fn layout(&self) -> ContainerLayout { self.layout }

    /// Compress and append the chunk with the given index.
    /// Errors when that chunk was already written.
    pub fn write_chunk<T: CountSample>(&mut self, chunk_index: usize, samples: &[T]) -> UnitResult {
        if T::BIT_DEPTH != self.layout.bit_depth {
            return Err(Error::invalid("sample type does not match the container bit depth"));
        }

        if samples.len() != self.layout.samples_per_chunk() {
            return Err(Error::invalid("chunk sample count does not match the layout"));
        }

        let offset = self.chunk_offsets.get_mut(chunk_index)
            .ok_or_else(|| Error::invalid("chunk index out of range"))?;

        if *offset != 0 {
            return Err(Error::invalid("chunk is already written"));
        }

        *offset = usize_to_u64(self.write.byte_position());

        let mut bytes = Vec::with_capacity(samples.len() * T::BYTE_SIZE);
        T::write_slice(&mut bytes, samples)?;

        let compressed = compress_to_vec_zlib(&bytes, self.layout.deflate_level);
        usize_to_u64(compressed.len()).write(&mut self.write)?;
        self.write.write_all(&compressed)?;

        Ok(())
    }

    /// Patch the offset table and flush. Errors when chunks are missing.
    pub fn finish(mut self) -> UnitResult {
        if self.chunk_offsets.iter().any(|&offset| offset == 0) {
            return Err(Error::invalid("some chunks are not written yet"));
        }

        self.write.seek_write_to(self.offset_table_position)?;
        u64::write_slice(&mut self.write, &self.chunk_offsets)?;
        self.write.flush()?;
        Ok(())
    }
}


/// A fully decoded container: layout plus the dense tensor,
/// widened to u64 regardless of the stored bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub layout: ContainerLayout,
    pub data: Vec<u64>,
}

impl Container {

    /// The sample at `(row, column, k_row, k_column)` of the binned tensor.
    pub fn get(&self, row: usize, column: usize, k_row: usize, k_column: usize) -> u64 {
        let [_, nx, det_a, det_b] = self.layout.shape;
        self.data[((row * nx + column) * det_a + k_row) * det_b + k_column]
    }
}

/// Read a complete container back from a seekable source.
pub fn read_container(read: &mut (impl Read + Seek)) -> Result<Container> {
    let mut magic = [0_u8; 4];
    read.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::invalid("not a 4D container"));
    }

    if u32::read(read)? != VERSION {
        return Err(Error::unsupported("unknown 4D container version"));
    }

    let mut shape = [0_usize; 4];
    for extent in &mut shape {
        *extent = u16::read(read)? as usize;
    }

    let layout = ContainerLayout {
        shape,
        chunk_rows: u32::read(read)? as usize,
        bit_depth: u8::read(read)?,
        deflate_level: u8::read(read)?,
    };

    let chunk_count = u32::read(read)? as usize;
    if layout.chunk_rows == 0 || chunk_count != layout.chunk_count() {
        return Err(Error::invalid("chunk count contradicts the container shape"));
    }

    let offsets = u64::read_vec(read, chunk_count)?;
    let samples_per_chunk = layout.samples_per_chunk();
    let mut data = vec![0_u64; shape.iter().product()];

    for (chunk_index, &offset) in offsets.iter().enumerate() {
        read.seek(SeekFrom::Start(offset))?;

        let compressed_length = u64_to_usize(u64::read(read)?, "chunk length")?;
        let mut compressed = vec![0_u8; compressed_length];
        read.read_exact(&mut compressed)?;

        let bytes = DeflateDecoder::new(&compressed).decode_zlib()
            .map_err(|_| Error::invalid("corrupt chunk stream"))?;

        let expected = samples_per_chunk * (layout.bit_depth as usize / 8);
        if bytes.len() != expected {
            return Err(Error::invalid("chunk decompressed to the wrong size"));
        }

        let target = &mut data[chunk_index * samples_per_chunk ..][.. samples_per_chunk];

        match layout.bit_depth {
            8 => for (cell, &byte) in target.iter_mut().zip(&bytes) {
                *cell = byte as u64;
            },

            16 => for (cell, pair) in target.iter_mut().zip(bytes.chunks_exact(2)) {
                *cell = u16::from_le_bytes([pair[0], pair[1]]) as u64;
            },

            32 => for (cell, quad) in target.iter_mut().zip(bytes.chunks_exact(4)) {
                *cell = u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]) as u64;
            },

            _ => return Err(Error::invalid("bit depth must be 8, 16 or 32")),
        }
    }

    Ok(Container { layout, data })
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn layout() -> ContainerLayout {
        ContainerLayout { shape: [8, 8, 4, 4], chunk_rows: 2, bit_depth: 16, deflate_level: 3 }
    }

    #[test]
    fn container_roundtrip(){
        let layout = layout();
        let mut write = Cursor::new(Vec::new());

        let mut writer = ContainerWriter::new(&mut write, layout).unwrap();
        for chunk_index in 0..layout.chunk_count() {
            let samples: Vec<u16> = (0..layout.samples_per_chunk())
                .map(|cell| (chunk_index * 1000 + cell) as u16)
                .collect();

            writer.write_chunk(chunk_index, &samples).unwrap();
        }
        writer.finish().unwrap();

        let container = read_container(&mut Cursor::new(write.into_inner())).unwrap();
        assert_eq!(container.layout, layout);
        assert_eq!(container.get(0, 0, 0, 0), 0);
        assert_eq!(container.get(0, 0, 0, 1), 1);
        assert_eq!(container.get(2, 0, 0, 0), 1000); // first cell of chunk 1
    }

    #[test]
    fn unfinished_container_is_detected(){
        let layout = layout();
        let mut write = Cursor::new(Vec::new());

        let mut writer = ContainerWriter::new(&mut write, layout).unwrap();
        let samples = vec![0_u16; layout.samples_per_chunk()];
        writer.write_chunk(0, &samples).unwrap();

        assert!(matches!(writer.finish(), Err(Error::Invalid(_))));
    }

    #[test]
    fn double_write_is_rejected(){
        let layout = layout();
        let mut write = Cursor::new(Vec::new());

        let mut writer = ContainerWriter::new(&mut write, layout).unwrap();
        let samples = vec![0_u16; layout.samples_per_chunk()];
        writer.write_chunk(1, &samples).unwrap();

        assert!(writer.write_chunk(1, &samples).is_err());
    }

    #[test]
    fn wrong_bit_depth_is_rejected(){
        let layout = layout();
        let mut write = Cursor::new(Vec::new());

        let mut writer = ContainerWriter::new(&mut write, layout).unwrap();
        let samples = vec![0_u8; layout.samples_per_chunk()];
        assert!(writer.write_chunk(0, &samples).is_err());
    }

    #[test]
    fn samples_wrap_at_their_depth(){
        let mut sample = 255_u8;
        sample.bump(1);
        assert_eq!(sample, 0);

        let mut sample = 65_535_u16;
        sample.bump(2);
        assert_eq!(sample, 1);
    }
}

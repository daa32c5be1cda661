//! Read and write little-endian primitives and records.
//! All detector packet formats and the 4D container are little-endian.

pub use std::io::{Read, Write, Seek, SeekFrom};
use lebe::prelude::*;

use crate::error::{Result, UnitResult};


/// Extension trait for primitive types like numbers and arrays.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume in a byte stream.
    const BYTE_SIZE: usize = std::mem::size_of::<Self>();

    /// Read a value of this type from the stream.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Fill the slice with values read from the stream.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write this value to the stream.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Write all values in the slice to the stream.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;

    /// Read a fixed number of values into a new vector.
    fn read_vec(read: &mut impl Read, count: usize) -> Result<Vec<Self>> {
        let mut vec = vec![Self::default(); count];
        Self::read_slice(read, &mut vec)?;
        Ok(vec)
    }
}

macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            fn read(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);
implement_data_for_primitive!(f32);
implement_data_for_primitive!(f64);


/// Remember the current byte position of a writer,
/// so chunk offsets can be recorded and patched later.
#[derive(Debug)]
pub struct Tracking<W> {
    inner: W,
    position: usize,
}

impl<W: Write> Tracking<W> {

    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// The number of bytes written so far.
    pub fn byte_position(&self) -> usize {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Tracking<W> {
    fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buffer)?;
        self.position += written;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Seek> Tracking<W> {

    /// Seek to an absolute byte position. Only used to patch
    /// previously written placeholder bytes, never to skip forward.
    pub fn seek_write_to(&mut self, position: usize) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Start(position as u64))?;
        self.position = position;
        Ok(())
    }
}

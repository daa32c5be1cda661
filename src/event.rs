//! The decoded event tuple passed to every aggregation kernel,
//! and the packed electron record the pipeline reads and writes.

use std::io::{BufWriter, Read, Write};

use crate::error::{Result, UnitResult};
use crate::io::Data;


/// One detector event, already mapped onto the scan raster.
/// Lives only for the duration of a kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {

    /// Index into the current image's scan grid, `y * nx + x`.
    pub probe_position: u64,

    /// Detector column of the event.
    pub kx: u16,

    /// Detector row of the event.
    pub ky: u16,

    /// Which of the repeated images this event belongs to.
    pub image_index: u16,

    /// Time of arrival in detector ticks; zero for frame cameras.
    pub toa: u64,

    /// Time over threshold, when the decode path extracts it.
    pub tot: u16,

    /// Number of counts this event carries. Event cameras always emit 1;
    /// frame cameras emit the pixel value so that count-accumulating
    /// kernels behave identically for both families.
    pub weight: u32,
}

impl Event {

    /// An event with a count of one and no timing information.
    pub fn plain(probe_position: u64, kx: u16, ky: u16, image_index: u16) -> Self {
        Self { probe_position, kx, ky, image_index, toa: 0, tot: 0, weight: 1 }
    }
}


/// The packed 10-byte record of one detected electron, as exchanged with
/// simulation tools. A record with `image_index == rep + 1` terminates
/// the stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElectronRecord {
    pub kx: u16,
    pub ky: u16,
    pub rx: u16,
    pub ry: u16,
    pub image_index: u16,
}

impl ElectronRecord {

    pub const BYTE_SIZE: usize = 10;

    pub fn read(read: &mut impl Read) -> Result<Self> {
        Ok(Self {
            kx: u16::read(read)?,
            ky: u16::read(read)?,
            rx: u16::read(read)?,
            ry: u16::read(read)?,
            image_index: u16::read(read)?,
        })
    }

    pub fn write(self, write: &mut impl Write) -> UnitResult {
        self.kx.write(write)?;
        self.ky.write(write)?;
        self.rx.write(write)?;
        self.ry.write(write)?;
        self.image_index.write(write)?;
        Ok(())
    }

    /// Decode one record from the start of a packed byte slice.
    pub fn from_bytes(bytes: &[u8; Self::BYTE_SIZE]) -> Self {
        Self {
            kx: u16::from_le_bytes([bytes[0], bytes[1]]),
            ky: u16::from_le_bytes([bytes[2], bytes[3]]),
            rx: u16::from_le_bytes([bytes[4], bytes[5]]),
            ry: u16::from_le_bytes([bytes[6], bytes[7]]),
            image_index: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }

    /// The sentinel record closing a stream of `rep` images.
    pub fn terminator(rep: usize) -> Self {
        Self { kx: 0, ky: 0, rx: 0, ry: 0, image_index: rep as u16 + 1 }
    }
}


/// Append-only writer for electron record files.
#[derive(Debug)]
pub struct ElectronFile<W: Write> {
    write: BufWriter<W>,
    rep: usize,
}

impl ElectronFile<std::fs::File> {

    /// Open failure is fatal before any processing starts.
    pub fn create(path: &std::path::Path, rep: usize) -> Result<Self> {
        Ok(Self::new(std::fs::File::create(path)?, rep))
    }
}

impl<W: Write> ElectronFile<W> {

    pub fn new(write: W, rep: usize) -> Self {
        Self { write: BufWriter::new(write), rep }
    }

    pub fn append(&mut self, record: ElectronRecord) -> UnitResult {
        record.write(&mut self.write)
    }

    /// Write the terminator record and flush.
    pub fn finish(mut self) -> UnitResult {
        ElectronRecord::terminator(self.rep).write(&mut self.write)?;
        self.write.flush()?;
        Ok(())
    }
}

/// Read every record of an electron file up to, but not including,
/// the terminator.
pub fn read_electron_file(read: &mut impl Read, rep: usize) -> Result<Vec<ElectronRecord>> {
    let mut records = Vec::new();

    loop {
        let record = ElectronRecord::read(read)?;
        if record.image_index as usize == rep + 1 { break }
        records.push(record);
    }

    Ok(records)
}

//! Blocking byte transport from a file or a TCP stream.
//!
//! Both variants share one contract: fill the whole destination buffer or
//! report how far the stream reached. The file variant is seekable, because
//! frame formats carry headers that are skipped; the socket variant adds the
//! one-shot acquisition handshake and a flush for stale sessions.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::net::{TcpListener, TcpStream};
use std::path::Path;

use crate::error::{Error, Result};
use crate::meta::SocketRole;


/// A blocking source of raw detector bytes.
pub trait ByteSource: Send {

    /// Read until `dest` is full or the stream ends.
    /// Returns the number of bytes actually read; anything short of
    /// `dest.len()` means the stream has ended.
    fn read_to_fill(&mut self, dest: &mut [u8]) -> Result<usize>;

    /// Read exactly `dest.len()` bytes, failing on a short read.
    fn read_exact_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        let read = self.read_to_fill(dest)?;
        if read == dest.len() { Ok(()) }
        else { Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())) }
    }
}


/// A detector dump on disk, possibly still growing.
#[derive(Debug)]
pub struct FileSource {
    stream: BufReader<File>,
}

impl FileSource {

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { stream: BufReader::new(file) })
    }

    /// Skip to an absolute byte position.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.stream.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

impl ByteSource for FileSource {
    fn read_to_fill(&mut self, dest: &mut [u8]) -> Result<usize> {
        read_to_fill(&mut self.stream, dest)
    }
}


/// A camera streaming over TCP. The server role listens for exactly one
/// connection; the client role dials the camera's data port.
#[derive(Debug)]
pub struct SocketSource {
    stream: TcpStream,
}

impl SocketSource {

    /// Establish the connection for the given role. The server role blocks
    /// until the camera connects.
    pub fn connect(address: &str, role: SocketRole) -> Result<Self> {
        let stream = match role {
            SocketRole::Client => TcpStream::connect(address)?,

            SocketRole::Server => {
                let listener = TcpListener::bind(address)?;
                let (stream, peer) = listener.accept()?;
                log::info!("camera connected from {}", peer);
                stream
            },
        };

        Ok(Self { stream })
    }

    /// Consume the `MPX,<10-digit length>,<header>` acquisition header the
    /// camera sends before frame data, returning the header text.
    pub fn read_acquisition_header(&mut self) -> Result<String> {
        read_acquisition_header(&mut self.stream)
    }

    /// Drain whatever a half-finished previous session left on the wire.
    /// Returns the number of discarded bytes.
    pub fn flush(&mut self) -> Result<u64> {
        self.stream.set_nonblocking(true)?;

        let mut discarded = 0_u64;
        let mut scratch = [0_u8; 4096];

        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(count) => discarded += count as u64,
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error.into()),
            }
        }

        self.stream.set_nonblocking(false)?;
        log::info!("socket flushed ({} stale bytes)", discarded);
        Ok(discarded)
    }
}

impl ByteSource for SocketSource {
    fn read_to_fill(&mut self, dest: &mut [u8]) -> Result<usize> {
        read_to_fill(&mut self.stream, dest)
    }
}


fn read_to_fill(read: &mut impl Read, dest: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < dest.len() {
        match read.read(&mut dest[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.into()),
        }
    }

    Ok(filled)
}

/// Parse the `MPX,<10-digit length>,<header bytes>` handshake from any
/// reader. Split out of `SocketSource` so it can be tested on plain buffers.
pub fn read_acquisition_header(read: &mut impl Read) -> Result<String> {
    let mut prefix = [0_u8; 15]; // "MPX," + 10 digits + ","
    if read_to_fill(read, &mut prefix)? != prefix.len() {
        return Err(Error::invalid("acquisition handshake ended early"));
    }

    if &prefix[..4] != b"MPX," || prefix[14] != b',' {
        return Err(Error::invalid("acquisition handshake does not start with MPX"));
    }

    let digits = std::str::from_utf8(&prefix[4..14])
        .map_err(|_| Error::invalid("acquisition header length is not ascii"))?;

    let length: usize = digits.trim_start_matches('0').parse()
        .map_err(|_| Error::invalid("acquisition header length is not a number"))?;

    // the length field counts the comma already consumed
    let mut header = vec![0_u8; length.saturating_sub(1)];
    if read_to_fill(read, &mut header)? != header.len() {
        return Err(Error::invalid("acquisition header ended early"));
    }

    Ok(String::from_utf8_lossy(&header).into_owned())
}


/// The layout of a numpy `.npy` file: sample width and array shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyLayout {
    pub bytes_per_sample: usize,
    pub shape: Vec<usize>,
    pub data_offset: u64,
}

/// Parse a version 1 numpy header. Only C-ordered unsigned 8 and 16 bit
/// arrays appear in detector dumps.
pub fn parse_npy_header(read: &mut impl Read) -> Result<NpyLayout> {
    let mut magic = [0_u8; 8];
    if read_to_fill(read, &mut magic)? != magic.len() || &magic[..6] != b"\x93NUMPY" {
        return Err(Error::invalid("not a numpy file"));
    }

    if magic[6] != 1 {
        return Err(Error::unsupported("only version 1 numpy files are supported"));
    }

    let mut length_bytes = [0_u8; 2];
    read_to_fill(read, &mut length_bytes)?;
    let header_length = u16::from_le_bytes(length_bytes) as usize;

    let mut header = vec![0_u8; header_length];
    if read_to_fill(read, &mut header)? != header.len() {
        return Err(Error::invalid("numpy header ended early"));
    }

    let header = String::from_utf8_lossy(&header);

    let bytes_per_sample = if header.contains("'descr': '|u1'") { 1 }
        else if header.contains("'descr': '<u2'") { 2 }
        else { return Err(Error::unsupported("numpy dtype must be |u1 or <u2")) };

    if header.contains("'fortran_order': True") {
        return Err(Error::unsupported("fortran ordered numpy arrays"));
    }

    let shape_start = header.find("'shape': (")
        .ok_or_else(|| Error::invalid("numpy header has no shape"))? + 10;
    let shape_end = header[shape_start..].find(')')
        .ok_or_else(|| Error::invalid("numpy header shape is unterminated"))? + shape_start;

    let shape = header[shape_start..shape_end].split(',')
        .map(str::trim).filter(|part| !part.is_empty())
        .map(|part| part.parse().map_err(|_| Error::invalid("numpy shape is not numeric")))
        .collect::<Result<Vec<usize>>>()?;

    Ok(NpyLayout {
        bytes_per_sample,
        shape,
        data_offset: 10 + header_length as u64,
    })
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_mpx_handshake(){
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MPX,0000000021,");
        bytes.extend_from_slice(b"HDR,dummy,content,xx");
        bytes.extend_from_slice(b"frame data follows");

        let mut read = Cursor::new(bytes);
        let header = read_acquisition_header(&mut read).unwrap();
        assert_eq!(header, "HDR,dummy,content,xx");

        let mut rest = String::new();
        read.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "frame data follows");
    }

    #[test]
    fn rejects_non_mpx_prefix(){
        let mut read = Cursor::new(b"XPM,0000000005,abcd".to_vec());
        assert!(read_acquisition_header(&mut read).is_err());
    }

    #[test]
    fn parses_npy_header(){
        let dict = "{'descr': '|u1', 'fortran_order': False, 'shape': (4096, 64, 64), }";
        let mut padded = dict.to_string();
        while (10 + padded.len()) % 64 != 0 { padded.push(' '); }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY\x01\x00");
        bytes.extend_from_slice(&(padded.len() as u16).to_le_bytes());
        bytes.extend_from_slice(padded.as_bytes());

        let layout = parse_npy_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(layout.bytes_per_sample, 1);
        assert_eq!(layout.shape, vec![4096, 64, 64]);
        assert_eq!(layout.data_offset, 10 + padded.len() as u64);
    }

    #[test]
    fn partial_fill_reports_length(){
        let mut read = Cursor::new(vec![1_u8, 2, 3]);
        let mut dest = [0_u8; 8];
        assert_eq!(read_to_fill(&mut read, &mut dest).unwrap(), 3);
        assert_eq!(&dest[..3], &[1, 2, 3]);
    }
}

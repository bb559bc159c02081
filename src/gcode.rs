//! Offset-tracking G-code line reader and the crate error type.
//!
//! Features are addressed by raw byte offsets into the input stream, so the
//! reader always knows the byte position of the line it just returned and can
//! jump back to any recorded offset.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::streaming::buffers::{DEFAULT_INPUT_BUFFER, DEFAULT_LINE_BUFFER};

/// Errors that can occur while rewriting a G-code file.
#[derive(Error, Debug)]
pub enum GcodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Options file could not be parsed: {0}")]
    Options(String),

    #[error("Malformed G-code at byte {offset}: {message}")]
    Structure { offset: u64, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, GcodeError>;

/// Open a file for reading, tagging failures with the path.
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<File> {
    File::open(path.as_ref()).map_err(|source| GcodeError::Open {
        path: path.as_ref().to_path_buf(),
        source,
    })
}

/// Create (truncate) a file for writing, tagging failures with the path.
pub fn create_file<P: AsRef<Path>>(path: P) -> Result<File> {
    File::create(path.as_ref()).map_err(|source| GcodeError::Open {
        path: path.as_ref().to_path_buf(),
        source,
    })
}

/// A seekable line reader that keeps byte-exact position bookkeeping.
///
/// Lines are returned with their original line ending so that pass-through
/// output is byte-identical to the input.
pub struct GcodeReader<R> {
    reader: BufReader<R>,
    pos: u64,
    len: u64,
    buffer: Vec<u8>,
}

impl<R: Read + Seek> GcodeReader<R> {
    /// Create a reader over any seekable source, positioned at its start.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader: BufReader::with_capacity(DEFAULT_INPUT_BUFFER, inner),
            pos: 0,
            len,
            buffer: Vec::with_capacity(DEFAULT_LINE_BUFFER),
        })
    }

    /// Read the next line into the internal buffer.
    ///
    /// Returns `None` at end of stream. The returned slice includes the line
    /// ending, if any.
    pub fn read_line(&mut self) -> io::Result<Option<&[u8]>> {
        self.buffer.clear();
        let n = self.reader.read_until(b'\n', &mut self.buffer)?;
        if n == 0 {
            return Ok(None);
        }
        self.pos += n as u64;
        Ok(Some(&self.buffer))
    }

    /// Read the next line into an owned buffer supplied by the caller.
    ///
    /// Returns the number of bytes read, 0 at end of stream.
    pub fn read_line_into(&mut self, line: &mut Vec<u8>) -> io::Result<usize> {
        line.clear();
        let n = self.reader.read_until(b'\n', line)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Byte offset of the start of the next line.
    #[inline]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Total length of the underlying stream in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Jump to an absolute byte offset.
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        if offset == self.pos {
            return Ok(());
        }
        let delta = offset as i64 - self.pos as i64;
        self.reader.seek_relative(delta)?;
        self.pos = offset;
        Ok(())
    }
}

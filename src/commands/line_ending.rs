//! Line-ending detection.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use memchr::memchr;
use tracing::warn;

use crate::config::LineEnding;
use crate::gcode::{open_file, Result};
use crate::streaming::buffers::LINE_ENDING_SAMPLE_BLOCK;

/// Line ending found in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedLineEnding {
    Windows,
    Unix,
    /// The file has no newline at all.
    Unknown,
}

impl fmt::Display for DetectedLineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectedLineEnding::Windows => write!(f, "{}", LineEnding::Windows),
            DetectedLineEnding::Unix => write!(f, "{}", LineEnding::Unix),
            DetectedLineEnding::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Detect the line ending of a file from its first newline.
pub fn detect_line_ending<P: AsRef<Path>>(path: P) -> Result<DetectedLineEnding> {
    let file = open_file(path)?;
    Ok(detect_line_ending_reader(file)?)
}

/// Detect the line ending of a stream from its first newline.
pub fn detect_line_ending_reader<R: Read>(mut reader: R) -> io::Result<DetectedLineEnding> {
    let mut block = vec![0u8; LINE_ENDING_SAMPLE_BLOCK];
    let mut previous: Option<u8> = None;
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            return Ok(DetectedLineEnding::Unknown);
        }
        let block = &block[..n];
        if let Some(i) = memchr(b'\n', block) {
            let before = if i == 0 { previous } else { Some(block[i - 1]) };
            return Ok(if before == Some(b'\r') {
                DetectedLineEnding::Windows
            } else {
                DetectedLineEnding::Unix
            });
        }
        previous = block.last().copied();
    }
}

/// Resolve `Auto` against the input file. Files without a newline fall back
/// to Unix.
pub fn resolve_line_ending<P: AsRef<Path>>(requested: LineEnding, input: P) -> Result<LineEnding> {
    if requested != LineEnding::Auto {
        return Ok(requested);
    }
    Ok(match detect_line_ending(input.as_ref())? {
        DetectedLineEnding::Windows => LineEnding::Windows,
        DetectedLineEnding::Unix => LineEnding::Unix,
        DetectedLineEnding::Unknown => {
            warn!(
                "no line ending found in {}, using {}",
                input.as_ref().display(),
                LineEnding::Unix
            );
            LineEnding::Unix
        }
    })
}

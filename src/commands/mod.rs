//! Command implementations for mfm.

pub mod line_ending;
pub mod process;

pub use line_ending::{
    detect_line_ending, detect_line_ending_reader, resolve_line_ending, DetectedLineEnding,
};
pub use process::{ProcessCommand, ProcessStats};

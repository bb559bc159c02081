//! Buffer size constants for the rewrite pass.
//!
//! The pass seeks back and forth within a single layer, so the input buffer
//! only needs to cover a handful of features; output is strictly sequential.

/// Default output buffer size (1 MB).
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024 * 1024;

/// Default input buffer size (64 KB).
/// Seeks outside the buffered window discard it, so larger buffers mostly
/// add refill cost.
pub const DEFAULT_INPUT_BUFFER: usize = 64 * 1024;

/// Default line buffer capacity (256 bytes).
/// G-code lines are short; long comment lines simply grow the buffer.
pub const DEFAULT_LINE_BUFFER: usize = 256;

/// Block size used when sampling a file for its line ending.
pub const LINE_ENDING_SAMPLE_BLOCK: usize = 4 * 1024;

/// Maximum number of lines scanned ahead when a layer does not start with a
/// feature marker.
pub const LAYER_START_LOOKAHEAD_LINES: usize = 200;

//! MFM: Map Feature Modifier
//!
//! Post-processes multi-color G-code to add periodic isoline bands and
//! height-banded color replacements, without re-slicing.
//!
//! # Features
//!
//! - **Single pass**: each layer is scanned once, then streamed by seeking
//!   to its features in the rewritten order
//! - **Byte-exact**: lines that are not rewritten are copied verbatim
//! - **Toolchange reuse**: prime towers are replayed as full toolchanges
//!   where a color change has to be inserted
//!
//! # Example
//!
//! ```rust,no_run
//! use mfm_gcode::{commands::ProcessCommand, config::{Configuration, UserOptions}};
//! use mfm_gcode::status::NullStatus;
//!
//! let options = UserOptions::from_path("options.json").unwrap();
//! let config = Configuration::new("model.gcode", "model-mfm.gcode", "toolchange.gcode")
//!     .with_options(&options);
//! let stats = ProcessCommand::new(config).run(&NullStatus).unwrap();
//! println!("{stats}");
//! ```

pub mod color;
pub mod commands;
pub mod config;
pub mod gcode;
pub mod layer;
pub mod position;
pub mod status;
pub mod streaming;
pub mod toolchange;

// Re-export commonly used types
pub use color::ColorTable;
pub use config::{Configuration, LineEnding, PeriodicColorRule, ReplacementColorRule, UserOptions};
pub use gcode::{GcodeError, GcodeReader, Result};
pub use position::Position;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::commands::{detect_line_ending, ProcessCommand, ProcessStats};
    pub use crate::config::{
        Configuration, LineEnding, PeriodicColorRule, ReplacementColorRule, UserOptions,
    };
    pub use crate::gcode::{GcodeError, Result};
    pub use crate::status::{NullStatus, StatusItem, StatusSink};
}

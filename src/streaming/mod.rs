//! Line-level streaming utilities shared by the rewrite engine.
//!
//! - Marker vocabulary and tool-select parsing
//! - Filtered output with synthesized restore/prime lines
//! - Buffer sizing

pub mod buffers;
pub mod output;
pub mod parsing;

pub use output::GcodeWriter;
pub use parsing::{feature_type, substitute_tool, tool_family_index, tool_select, Dialect};

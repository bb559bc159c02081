//! Tool-change decisions and insertion.
//!
//! After reordering, features no longer follow the tool selects of the
//! original stream, so the tool loaded before each feature is tracked and a
//! toolchange is inserted wherever it differs from what the feature needs.
//! A captured prime tower is replayed when one is available (full
//! toolchange), otherwise a short template is emitted (minimal toolchange).

use std::collections::VecDeque;
use std::io::{Read, Seek, Write};
use std::path::Path;

use memchr::memmem;
use tracing::debug;

use crate::color::ColorTable;
use crate::gcode::{open_file, GcodeReader, Result};
use crate::layer::{Feature, PrintState};
use crate::streaming::buffers::DEFAULT_LINE_BUFFER;
use crate::streaming::output::GcodeWriter;
use crate::streaming::parsing::substitute_tool;

/// Token replaced by the tool index in the minimal toolchange template.
pub const TEMPLATE_PLACEHOLDER: &[u8] = b"XX";

/// Feed rate of the priming move after an inserted toolchange.
pub const PRIME_FEED_RATE: f64 = 1800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolchangeKind {
    /// A captured prime tower replayed with the new tool.
    Full,
    /// The toolchange template.
    Minimal,
}

impl ToolchangeKind {
    /// Extrusion of the priming move after this kind of toolchange.
    pub fn prime_extrusion(&self) -> f64 {
        match self {
            ToolchangeKind::Full => 0.8,
            ToolchangeKind::Minimal => 2.0,
        }
    }
}

/// A toolchange scheduled at a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToolchange {
    /// Insert before the line starting at this offset.
    pub offset: u64,
    /// Tool the next feature needs.
    pub color: usize,
    /// Tool actually emitted for `color` after replacement.
    pub printing_color: usize,
}

/// Minimal toolchange G-code with a tool placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchangeTemplate {
    code: Vec<u8>,
}

impl ToolchangeTemplate {
    pub fn new(code: impl Into<Vec<u8>>) -> Self {
        Self { code: code.into() }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut code = Vec::new();
        open_file(path)?.read_to_end(&mut code)?;
        Ok(Self::new(code))
    }

    /// The template with every placeholder replaced by `tool`.
    pub fn render(&self, tool: usize) -> Vec<u8> {
        let mut buf = itoa::Buffer::new();
        let tool = buf.format(tool).as_bytes();
        let mut out = Vec::with_capacity(self.code.len() + 8);
        let mut last = 0;
        for i in memmem::find_iter(&self.code, TEMPLATE_PLACEHOLDER) {
            out.extend_from_slice(&self.code[last..i]);
            out.extend_from_slice(tool);
            last = i + TEMPLATE_PLACEHOLDER.len();
        }
        out.extend_from_slice(&self.code[last..]);
        out
    }
}

/// Tool loaded right before the feature after `current` starts, if no
/// toolchange is inserted. `None` as `current` means before the first
/// feature.
pub fn color_before_next(
    features: &VecDeque<Feature>,
    current: Option<usize>,
    printing_color: Option<usize>,
) -> Option<usize> {
    current
        .and_then(|i| features.get(i))
        .and_then(|f| f.printing_color)
        .or(printing_color)
}

/// Index and needed tool of the first feature after `current` that is not
/// a transparent prime tower.
pub fn color_for_next(features: &VecDeque<Feature>, current: Option<usize>) -> Option<(usize, usize)> {
    let from = current.map_or(0, |i| i + 1);
    let (index, feature) = features
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, f)| !f.is_transparent())?;
    feature.target_color().map(|color| (index, color))
}

/// Schedule a toolchange before the next feature if the loaded tool differs
/// from the (replaced) tool it needs.
pub fn needs_toolchange(
    features: &VecDeque<Feature>,
    current: Option<usize>,
    printing_color: Option<usize>,
    colors: &ColorTable,
) -> Option<PendingToolchange> {
    let (index, color) = color_for_next(features, current)?;
    let target = colors.printing_index(color);
    if color_before_next(features, current, printing_color) == Some(target) {
        return None;
    }
    Some(PendingToolchange {
        offset: features[index].start,
        color,
        printing_color: target,
    })
}

/// Schedule a toolchange at layer end when every feature has been entered
/// but captured prime towers are left, so the tower keeps growing. The
/// target is the tool the original stream ends the layer with.
pub fn layer_end_toolchange(state: &PrintState, colors: &ColorTable) -> Option<PendingToolchange> {
    if !state.features.is_empty() || state.prime_towers.is_empty() {
        return None;
    }
    let offset = state.layer_end?;
    let color = state.layer_end_original_color.or(state.printing_color)?;
    Some(PendingToolchange {
        offset,
        color,
        printing_color: colors.printing_index(color),
    })
}

/// Emit a scheduled toolchange at the current output position.
///
/// Replays the earliest captured prime tower with its tool selects
/// rewritten if one is left, else renders the template. The reader position
/// is restored afterwards.
pub fn insert_toolchange<R: Read + Seek, W: Write>(
    reader: &mut GcodeReader<R>,
    writer: &mut GcodeWriter<W>,
    state: &mut PrintState,
    pending: PendingToolchange,
    template: &ToolchangeTemplate,
    colors: &ColorTable,
) -> Result<ToolchangeKind> {
    let kind = match state.prime_towers.pop_front() {
        Some(tower) => {
            writer.write_comment(&format!(
                "; MFM Prime Tower and Toolchange (full) inserted to {} --replacement--> {}",
                pending.color, pending.printing_color
            ))?;
            let resume = reader.tell();
            reader.seek(tower.start)?;
            replay_prime_tower(reader, writer, &tower, pending.color, colors)?;
            reader.seek(resume)?;
            ToolchangeKind::Full
        }
        None => {
            writer.write_comment(&format!(
                "; MFM Toolchange (minimal) inserted to {} --replacement--> {}",
                pending.color, pending.printing_color
            ))?;
            let code = template.render(pending.printing_color);
            writer.write_raw(&code)?;
            if !code.is_empty() && !code.ends_with(b"\n") {
                writer.write_synthetic(b"")?;
            }
            ToolchangeKind::Minimal
        }
    };
    debug!(
        offset = pending.offset,
        ?kind,
        "toolchange inserted {} -> {}",
        pending.color,
        pending.printing_color
    );
    state.set_printing_color(pending.printing_color);
    state.pending_toolchange = None;
    Ok(kind)
}

/// Copy a prime tower's byte range to the output with its tool selects
/// switched to `color`. Everything from its wipe-finish marker on is left
/// out.
fn replay_prime_tower<R: Read + Seek, W: Write>(
    reader: &mut GcodeReader<R>,
    writer: &mut GcodeWriter<W>,
    tower: &Feature,
    color: usize,
    colors: &ColorTable,
) -> Result<()> {
    let mut line = Vec::with_capacity(DEFAULT_LINE_BUFFER);
    while reader.tell() < tower.end {
        if reader.read_line_into(&mut line)? == 0 {
            break;
        }
        writer.write_line(&substitute_tool(&line, color), colors)?;
        if tower.wipe_end == Some(reader.tell()) {
            writer.write_wipe_end_placeholders()?;
            writer.write_comment("; MFM Original WIPE_END skipped for inserted Prime Tower")?;
            break;
        }
    }
    Ok(())
}

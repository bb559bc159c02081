//! Marker vocabulary and tool-select parsing.
//!
//! Two slicer dialects are recognized at once through alternation in every
//! pattern: the Bambu/Orca style (`; CHANGE_LAYER`, `; Z_HEIGHT:`,
//! `; FEATURE:`) and the Prusa style (`;LAYER_CHANGE`, `;Z:`, `;TYPE:`).
//! The three `; MFM ...` markers are inserted by an upstream annotation step
//! and are required for toolchange relocation.

use regex::bytes::{NoExpand, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

static LAYER_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^;\s?(?:(?P<bambu>CHANGE_LAYER)|(?P<prusa>LAYER_CHANGE))").unwrap()
});
static LAYER_Z_HEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;\s?(?:Z_HEIGHT|Z):\s?(\d*\.?\d*)").unwrap());
static LAYER_HEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;\s?(?:LAYER_HEIGHT|HEIGHT):\s?(\d*\.?\d*)").unwrap());
static FEATURE_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;\s?(?:FEATURE|TYPE):\s?(.*)").unwrap());

static TOOLCHANGE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^; MFM TOOLCHANGE START").unwrap());
static TOOLCHANGE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^; MFM TOOLCHANGE END").unwrap());
static LAYER_CHANGE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^; MFM LAYER CHANGE END").unwrap());

static FILAMENT_END_GCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;\s?filament end gcode").unwrap());
static M204_S: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^M204\sS\d*").unwrap());
static LINE_WIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^;\s?(?:LINE_WIDTH|WIDTH):").unwrap());
static WIPE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^;\s?WIPE_END").unwrap());

static M620: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^M620 S(\d*)A").unwrap());
static TOOL_SELECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*T(\d+)").unwrap());
static M621: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^M621 S(\d*)A").unwrap());

/// Canonical name of the purge/prime tower feature.
pub const PRIME_TOWER: &str = "Prime tower";
/// Vendor name for the same region, renamed to [`PRIME_TOWER`] on sight.
pub const WIPE_TOWER: &str = "Wipe tower";
/// Placeholder type for a region that began before the current layer.
pub const UNKNOWN_CONTINUED: &str = "Unknown continued";
/// Feature types whose wipe-finish block is kept on periodic layers.
pub const RETAIN_WIPE_END_FEATURE_TYPES: &[&str] = &["Internal infill"];

/// Slicer comment dialect of a layer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `; CHANGE_LAYER`, `; Z_HEIGHT:`, `; LAYER_HEIGHT:`, `; FEATURE:`
    Bambu,
    /// `;LAYER_CHANGE`, `;Z:`, `;HEIGHT:`, `;TYPE:`
    Prusa,
}

/// Marker lines that may stand in for a feature marker at the start of a
/// layer whose first region continues from the previous layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationMarker {
    /// `M204 S...` travel acceleration reset
    AccelerationReset,
    /// `; filament end gcode`
    FilamentEnd,
    /// `;LINE_WIDTH:` / `;WIDTH:`
    LineWidth,
}

impl ContinuationMarker {
    #[inline]
    pub fn matches(self, line: &[u8]) -> bool {
        match self {
            ContinuationMarker::AccelerationReset => M204_S.is_match(line),
            ContinuationMarker::FilamentEnd => FILAMENT_END_GCODE.is_match(line),
            ContinuationMarker::LineWidth => LINE_WIDTH.is_match(line),
        }
    }
}

/// Returns the dialect if the line is a layer-change marker.
#[inline]
pub fn layer_change(line: &[u8]) -> Option<Dialect> {
    let caps = LAYER_CHANGE.captures(line)?;
    if caps.name("bambu").is_some() {
        Some(Dialect::Bambu)
    } else {
        Some(Dialect::Prusa)
    }
}

#[inline]
pub fn is_layer_change(line: &[u8]) -> bool {
    LAYER_CHANGE.is_match(line)
}

/// Parse a `; Z_HEIGHT:` / `;Z:` line.
pub fn layer_z_height(line: &[u8]) -> Option<f64> {
    let caps = LAYER_Z_HEIGHT.captures(line)?;
    parse_f64(caps.get(1)?.as_bytes())
}

/// Parse a `; LAYER_HEIGHT:` / `;HEIGHT:` line.
pub fn layer_thickness(line: &[u8]) -> Option<f64> {
    let caps = LAYER_HEIGHT.captures(line)?;
    parse_f64(caps.get(1)?.as_bytes())
}

/// Returns the feature type named by a feature marker line.
///
/// The vendor wipe tower label is canonicalized to [`PRIME_TOWER`].
pub fn feature_type(line: &[u8]) -> Option<String> {
    let caps = FEATURE_TYPE.captures(line)?;
    let name = String::from_utf8_lossy(caps.get(1)?.as_bytes())
        .trim_end()
        .to_string();
    if name == WIPE_TOWER {
        Some(PRIME_TOWER.to_string())
    } else {
        Some(name)
    }
}

#[inline]
pub fn is_feature_marker(line: &[u8]) -> bool {
    FEATURE_TYPE.is_match(line)
}

#[inline]
pub fn is_toolchange_start(line: &[u8]) -> bool {
    TOOLCHANGE_START.is_match(line)
}

#[inline]
pub fn is_toolchange_end(line: &[u8]) -> bool {
    TOOLCHANGE_END.is_match(line)
}

#[inline]
pub fn is_layer_change_end(line: &[u8]) -> bool {
    LAYER_CHANGE_END.is_match(line)
}

#[inline]
pub fn is_wipe_end(line: &[u8]) -> bool {
    WIPE_END.is_match(line)
}

/// Parse a bare tool-select instruction (`T1`).
///
/// The vendor pseudo tools `T255`, `T1000...` and `T1100` are not tool
/// selects.
pub fn tool_select(line: &[u8]) -> Option<usize> {
    let caps = TOOL_SELECT.captures(line)?;
    let digits = caps.get(1)?;
    let rest = &line[digits.end()..];
    let at_end = rest.iter().all(|b| *b == b'\r' || *b == b'\n');
    let digits = digits.as_bytes();
    if (digits == b"255" && at_end) || digits.starts_with(b"1000") || (digits == b"1100" && at_end)
    {
        return None;
    }
    parse_usize(digits)
}

/// Returns the tool index referenced by any tool-select-family instruction:
/// `M620 S{n}A`, `T{n}` or `M621 S{n}A`.
pub fn tool_family_index(line: &[u8]) -> Option<usize> {
    if let Some(caps) = M620.captures(line) {
        return parse_usize(caps.get(1)?.as_bytes());
    }
    if let Some(index) = tool_select(line) {
        return Some(index);
    }
    if let Some(caps) = M621.captures(line) {
        return parse_usize(caps.get(1)?.as_bytes());
    }
    None
}

/// Rewrite every tool-select-family instruction on the line to `index`.
///
/// Lines without such an instruction are returned borrowed.
pub fn substitute_tool(line: &[u8], index: usize) -> Cow<'_, [u8]> {
    let mut buf = itoa::Buffer::new();
    let n = buf.format(index).as_bytes();

    if M620.is_match(line) {
        let replacement = [b"M620 S".as_slice(), n, b"A".as_slice()].concat();
        return Cow::Owned(M620.replace(line, NoExpand(&replacement)).into_owned());
    }
    if tool_select(line).is_some() {
        let replacement = [b"T".as_slice(), n].concat();
        return Cow::Owned(TOOL_SELECT.replace(line, NoExpand(&replacement)).into_owned());
    }
    if M621.is_match(line) {
        let replacement = [b"M621 S".as_slice(), n, b"A".as_slice()].concat();
        return Cow::Owned(M621.replace(line, NoExpand(&replacement)).into_owned());
    }
    Cow::Borrowed(line)
}

/// Parse a decimal float, tolerating leading/trailing dots (`.5`, `2.`).
#[inline]
pub fn parse_f64(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[inline]
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

//! Layer scanning, periodic band classification and feature reordering.
//!
//! A layer starts at a layer-change marker and runs to the next one (or end
//! of file). Scanning a layer walks all of its lines once, cataloguing every
//! feature region by byte offset, without writing anything. The rewrite
//! engine then visits the features in a possibly different order by seeking.

use std::collections::VecDeque;
use std::io::{Read, Seek};

use tracing::{debug, info, warn};

use crate::color::ColorTable;
use crate::config::{PeriodicColorRule, ReplacementColorRule};
use crate::gcode::{GcodeError, GcodeReader, Result};
use crate::position::Position;
use crate::streaming::buffers::{DEFAULT_LINE_BUFFER, LAYER_START_LOOKAHEAD_LINES};
use crate::streaming::parsing::{self, ContinuationMarker, PRIME_TOWER, UNKNOWN_CONTINUED};
use crate::toolchange::PendingToolchange;

/// An embedded tool-switch block inside a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolchangeBlock {
    /// Offset of the toolchange-begin marker.
    pub start: u64,
    /// Offset of the toolchange-end marker, if one was seen.
    pub end: Option<u64>,
    /// Destination tool of the block.
    pub tool: Option<usize>,
}

/// Why parts of a feature are suppressed while it is streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipType {
    /// The feature's own toolchange block and its wipe-finish block are
    /// dropped; a toolchange is inserted before the feature instead.
    OriginalToolchangeAndWipeEnd,
}

/// A contiguous named region of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub feature_type: String,
    /// Offset of the feature marker line.
    pub start: u64,
    /// Offset of the line that closed the feature.
    pub end: u64,
    pub toolchange: Option<ToolchangeBlock>,
    /// Offset of the last wipe-finish marker in the feature.
    pub wipe_end: Option<u64>,
    /// Whether the feature carries the periodic band.
    pub periodic: bool,
    /// Tool active in the original stream when the feature began.
    pub original_color: Option<usize>,
    /// Band tool the feature must be printed with, if periodic.
    pub printing_color: Option<usize>,
    /// Motion state right before the feature marker.
    pub start_position: Position,
    pub skip: Option<SkipType>,
}

impl Feature {
    pub fn new(
        feature_type: impl Into<String>,
        start: u64,
        start_position: Position,
        original_color: Option<usize>,
    ) -> Self {
        Self {
            feature_type: feature_type.into(),
            start,
            end: start,
            toolchange: None,
            wipe_end: None,
            periodic: false,
            original_color,
            printing_color: None,
            start_position,
            skip: None,
        }
    }

    #[inline]
    pub fn is_prime_tower(&self) -> bool {
        self.feature_type == PRIME_TOWER
    }

    /// A prime tower carrying a toolchange can be replayed elsewhere.
    #[inline]
    pub fn is_reusable_prime_tower(&self) -> bool {
        self.is_prime_tower() && self.toolchange.is_some()
    }

    /// Prime towers without a toolchange do not change the tool and are
    /// skipped over by color lookups.
    #[inline]
    pub fn is_transparent(&self) -> bool {
        self.is_prime_tower() && self.toolchange.is_none()
    }

    /// Tool the feature needs: the band tool if periodic, else its original.
    #[inline]
    pub fn target_color(&self) -> Option<usize> {
        self.printing_color.or(self.original_color)
    }
}

/// State of the layer being rewritten.
///
/// Replaced wholesale at every layer boundary; [`PrintState::next_layer`]
/// decides what survives the boundary.
#[derive(Debug, Clone, Default)]
pub struct PrintState {
    /// False until the first layer-change marker.
    pub in_layer: bool,
    /// Top of the layer.
    pub height: f64,
    pub layer_thickness: f64,
    pub previous_layer_thickness: f64,
    /// Offset right after the layer-change marker.
    pub layer_start: u64,
    /// Offset of the next layer-change marker or end of file. `None` if the
    /// layer had no recognizable feature.
    pub layer_end: Option<u64>,
    /// Type of the last ordinary feature, in file order.
    pub last_feature_type: Option<String>,
    pub prev_layer_last_feature_type: Option<String>,
    /// Tool active at layer start in the original stream.
    pub original_color: Option<usize>,
    /// Tool active at layer end in the original stream.
    pub layer_end_original_color: Option<usize>,
    /// Tool currently loaded in the output stream.
    pub printing_color: Option<usize>,
    pub printing_periodic_color: bool,
    /// Whether this layer hosts the periodic band.
    pub periodic: bool,
    /// Band tool used to decide `printing_periodic_color`.
    pub band_color: Option<usize>,
    /// Motion state seen by the scanner, carried across layers.
    pub scan_position: Position,
    /// Motion state of the lines streamed so far.
    pub position: Position,
    pub features: VecDeque<Feature>,
    pub prime_towers: VecDeque<Feature>,
    pub prime_tower_starts: Vec<u64>,
    pub stop_positions: Vec<u64>,
    pub pending_toolchange: Option<PendingToolchange>,
    /// A wipe-finish block was suppressed. The next restore without a
    /// toolchange re-primes with the E and F of the last streamed move,
    /// which includes the suppressed tail.
    pub wipe_end_prime: bool,
    /// Suppress output until the next feature is entered.
    pub skip_write: bool,
    /// Suppress output of the current line only.
    pub skip_write_current_line: bool,
}

impl PrintState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state for the layer starting at `layer_start`, carrying over
    /// what must survive a layer boundary.
    pub fn next_layer(&self, layer_start: u64) -> Self {
        Self {
            in_layer: true,
            previous_layer_thickness: self.layer_thickness,
            layer_start,
            prev_layer_last_feature_type: self.last_feature_type.clone(),
            original_color: self.layer_end_original_color.or(self.original_color),
            printing_color: self.printing_color,
            printing_periodic_color: self.printing_periodic_color,
            scan_position: self.scan_position,
            position: self.position,
            wipe_end_prime: self.wipe_end_prime,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Record the tool now loaded in the output stream.
    pub fn set_printing_color(&mut self, color: usize) {
        self.printing_color = Some(color);
        self.printing_periodic_color = self.band_color == Some(color);
    }

    #[inline]
    pub fn is_stop(&self, offset: u64) -> bool {
        self.stop_positions.contains(&offset)
    }

    /// Remove a stop position. Returns false if `offset` was not a stop.
    pub fn take_stop(&mut self, offset: u64) -> bool {
        match self.stop_positions.iter().position(|s| *s == offset) {
            Some(i) => {
                self.stop_positions.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Whether a layer lies on a periodic band of `rule`.
///
/// The layer top must fall within the rule's height range and either land
/// inside a band, or the layer must be thicker than a band and its window
/// `(height - thickness, height]` cross a band. A layer directly after an
/// oversized band layer never claims the band again.
pub fn should_be_periodic_line(state: &PrintState, rule: &PeriodicColorRule) -> bool {
    let height = state.height;
    if height < rule.start_height || height > rule.end_height {
        return false;
    }
    let above_start = height - rule.start_height;
    if above_start.rem_euclid(rule.period) <= rule.band_thickness {
        return true;
    }
    if state.layer_thickness <= rule.band_thickness {
        return false;
    }
    if state.printing_periodic_color && state.previous_layer_thickness > rule.band_thickness {
        return false;
    }
    let bottom = above_start - state.layer_thickness;
    bottom.rem_euclid(rule.period) < rule.band_thickness
        || above_start > (bottom / rule.period).ceil() * rule.period + rule.band_thickness
}

/// Re-evaluate every replacement rule against the layer's height window.
///
/// Rules are applied in order, so the last matching rule for an original
/// tool wins.
pub fn update_replacement_colors(
    state: &PrintState,
    rules: &[ReplacementColorRule],
    colors: &mut ColorTable,
) {
    for rule in rules {
        if state.height > rule.start_height
            && state.height - state.layer_thickness < rule.end_height
        {
            colors.set_replacement(rule.original_color_index, rule.color_index);
        } else if colors.replacement(rule.original_color_index) == Some(rule.color_index) {
            colors.clear_replacement(rule.original_color_index);
        }
    }
}

/// Move periodic features to the front (stable) and record stop positions.
pub fn reorder_features(state: &mut PrintState) {
    if state.periodic {
        let (mut periodic, rest): (VecDeque<Feature>, VecDeque<Feature>) =
            state.features.drain(..).partition(|f| f.periodic);
        periodic.extend(rest);
        state.features = periodic;
    }

    state.prime_tower_starts = state.prime_towers.iter().map(|f| f.start).collect();
    state.stop_positions.clear();
    state
        .stop_positions
        .extend(state.features.iter().map(|f| f.start));
    state
        .stop_positions
        .extend(state.prime_tower_starts.iter().copied());
    if let Some(end) = state.layer_end {
        state.stop_positions.push(end);
    }

    debug!(
        features = state.features.len(),
        prime_towers = state.prime_towers.len(),
        "layer catalogue"
    );
    for (i, f) in state.features.iter().enumerate() {
        debug!(
            "{} {} start: {} end: {} original: {:?} periodic: {} printing: {:?} toolchange: {:?} wipe_end: {:?}",
            i,
            f.feature_type,
            f.start,
            f.end,
            f.original_color,
            f.periodic,
            f.printing_color,
            f.toolchange,
            f.wipe_end
        );
    }
    debug!(stops = ?state.stop_positions, "stop positions");
}

/// What the lookahead after a layer-change-end sentinel found first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerStart {
    Feature,
    Continuation(ContinuationMarker),
    Abandoned,
}

/// Catalogues layers against the configured color rules.
#[derive(Debug, Clone, Copy)]
pub struct LayerScanner<'a> {
    periodic_colors: &'a [PeriodicColorRule],
    replacement_colors: &'a [ReplacementColorRule],
}

impl<'a> LayerScanner<'a> {
    pub fn new(
        periodic_colors: &'a [PeriodicColorRule],
        replacement_colors: &'a [ReplacementColorRule],
    ) -> Self {
        Self {
            periodic_colors,
            replacement_colors,
        }
    }

    /// Scan the layer whose marker is the next line of `reader`.
    ///
    /// Reads a single line and returns `None` if it is not a layer-change
    /// marker; the caller re-seeks. Otherwise the whole layer is read and
    /// the reader is left at the next layer marker (or end of file). The
    /// replacement entries of `colors` are updated for the new layer.
    pub fn scan_layer<R: Read + Seek>(
        &self,
        reader: &mut GcodeReader<R>,
        previous: &PrintState,
        colors: &mut ColorTable,
    ) -> Result<Option<PrintState>> {
        let Some(dialect) = reader.read_line()?.and_then(parsing::layer_change) else {
            return Ok(None);
        };
        let mut state = previous.next_layer(reader.tell());

        match reader.read_line()?.and_then(parsing::layer_z_height) {
            Some(height) => state.height = height,
            None => warn!(offset = state.layer_start, "layer without a height declaration"),
        }
        match reader.read_line()?.and_then(parsing::layer_thickness) {
            Some(thickness) => state.layer_thickness = thickness,
            None => warn!(offset = state.layer_start, "layer without a thickness declaration"),
        }

        update_replacement_colors(&state, self.replacement_colors, colors);

        let rule = self
            .periodic_colors
            .iter()
            .find(|rule| should_be_periodic_line(&state, rule));
        state.periodic = rule.is_some();
        state.band_color = rule
            .or_else(|| self.periodic_colors.first())
            .map(|r| r.color_index);

        info!(
            height = state.height,
            thickness = state.layer_thickness,
            periodic = state.periodic,
            printing_periodic = state.printing_periodic_color,
            "layer {:?}",
            dialect
        );

        self.find_layer_features(reader, &mut state, rule)?;
        state.last_feature_type = state.features.back().map(|f| f.feature_type.clone());
        Ok(Some(state))
    }

    /// Walk the rest of the layer and catalogue its features.
    pub fn find_layer_features<R: Read + Seek>(
        &self,
        reader: &mut GcodeReader<R>,
        state: &mut PrintState,
        rule: Option<&PeriodicColorRule>,
    ) -> Result<()> {
        let mut line = Vec::with_capacity(DEFAULT_LINE_BUFFER);
        let mut current: Option<Feature> = None;
        let mut original_color = state.original_color;
        let mut continuation: Option<ContinuationMarker> = None;

        loop {
            let offset = reader.tell();
            if reader.read_line_into(&mut line)? == 0 {
                if let Some(feature) = current.take() {
                    file_feature(state, feature, offset);
                }
                state.layer_end = Some(offset);
                break;
            }
            if parsing::is_layer_change(&line) {
                if let Some(feature) = current.take() {
                    file_feature(state, feature, offset);
                }
                state.layer_end = Some(offset);
                break;
            }

            state.scan_position.update(&line);

            if state.features.is_empty() && parsing::is_layer_change_end(&line) {
                let resume = reader.tell();
                let found = lookahead(reader)?;
                reader.seek(resume)?;
                debug!(offset = resume, ?found, "layer start lookahead");
                match found {
                    LayerStart::Feature => continue,
                    LayerStart::Continuation(marker) => {
                        continuation = Some(marker);
                        continue;
                    }
                    LayerStart::Abandoned => {
                        debug!(offset = resume, "no feature before the next layer");
                        state.features.clear();
                        state.prime_towers.clear();
                        state.layer_end = None;
                        state.layer_end_original_color = original_color;
                        return Ok(());
                    }
                }
            }

            let marker_type = parsing::feature_type(&line);
            let continued = marker_type.is_none()
                && state.features.is_empty()
                && continuation.is_some_and(|m| m.matches(&line));

            if marker_type.is_some() || continued {
                // consecutive prime tower markers belong to one tower
                if let (Some(open), Some(name)) = (&current, &marker_type) {
                    if open.is_prime_tower() && name == PRIME_TOWER {
                        continue;
                    }
                }
                if let Some(feature) = current.take() {
                    file_feature(state, feature, offset);
                }
                let feature_type = match marker_type {
                    Some(name) => name,
                    None => {
                        continuation = None;
                        state
                            .prev_layer_last_feature_type
                            .take()
                            .unwrap_or_else(|| UNKNOWN_CONTINUED.to_string())
                    }
                };
                let mut feature =
                    Feature::new(feature_type, offset, state.scan_position, original_color);
                if let Some(rule) = rule {
                    if rule.applies_to(&feature.feature_type) {
                        feature.periodic = true;
                        feature.printing_color = Some(rule.color_index);
                    }
                }
                current = Some(feature);
                continue;
            }

            if let Some(tool) = parsing::tool_select(&line) {
                original_color = Some(tool);
                if let Some(block) = current.as_mut().and_then(|f| f.toolchange.as_mut()) {
                    block.tool = Some(tool);
                }
                continue;
            }

            let Some(feature) = current.as_mut() else {
                continue;
            };
            if parsing::is_toolchange_start(&line) {
                feature.toolchange = Some(ToolchangeBlock {
                    start: offset,
                    end: None,
                    tool: None,
                });
            } else if parsing::is_toolchange_end(&line) {
                match feature.toolchange.as_mut() {
                    Some(block) => block.end = Some(offset),
                    None => {
                        return Err(GcodeError::Structure {
                            offset,
                            message: format!(
                                "toolchange end marker without a start in feature '{}'",
                                feature.feature_type
                            ),
                        })
                    }
                }
            } else if parsing::is_wipe_end(&line) {
                feature.wipe_end = Some(offset);
            }
        }

        state.layer_end_original_color = original_color;
        Ok(())
    }
}

/// Close a feature at `end` and file it. Prime towers with a toolchange are
/// held back for reuse on periodic layers.
fn file_feature(state: &mut PrintState, mut feature: Feature, end: u64) {
    feature.end = end;
    if state.periodic && feature.is_reusable_prime_tower() {
        state.prime_towers.push_back(feature);
    } else {
        state.features.push_back(feature);
    }
}

/// Look ahead from a layer-change-end sentinel for the first marker that
/// starts a region. The caller restores the reader position.
fn lookahead<R: Read + Seek>(reader: &mut GcodeReader<R>) -> Result<LayerStart> {
    let mut line = Vec::with_capacity(DEFAULT_LINE_BUFFER);
    for _ in 0..LAYER_START_LOOKAHEAD_LINES {
        if reader.read_line_into(&mut line)? == 0 {
            break;
        }
        if parsing::is_feature_marker(&line) {
            return Ok(LayerStart::Feature);
        }
        if ContinuationMarker::AccelerationReset.matches(&line) {
            reader.read_line_into(&mut line)?;
            return Ok(if parsing::is_feature_marker(&line) {
                LayerStart::Feature
            } else {
                LayerStart::Continuation(ContinuationMarker::AccelerationReset)
            });
        }
        if ContinuationMarker::FilamentEnd.matches(&line) {
            return Ok(LayerStart::Continuation(ContinuationMarker::FilamentEnd));
        }
        if ContinuationMarker::LineWidth.matches(&line) {
            return Ok(LayerStart::Continuation(ContinuationMarker::LineWidth));
        }
        if parsing::is_layer_change(&line) {
            break;
        }
    }
    Ok(LayerStart::Abandoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rule() -> PeriodicColorRule {
        PeriodicColorRule::new(2, 0.3, 100.0, 0.5, 1.0)
    }

    fn layer(height: f64, thickness: f64) -> PrintState {
        PrintState {
            height,
            layer_thickness: thickness,
            ..PrintState::default()
        }
    }

    fn reader(text: &str) -> GcodeReader<Cursor<Vec<u8>>> {
        GcodeReader::new(Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn test_periodic_layer_top_inside_band() {
        // (1.3 - 0.3) mod 1 = 0 <= 0.5
        assert!(should_be_periodic_line(&layer(1.3, 0.2), &rule()));
        // (1.7 - 0.3) mod 1 = 0.4 <= 0.5
        assert!(should_be_periodic_line(&layer(1.7, 0.2), &rule()));
        // (1.9 - 0.3) mod 1 = 0.6 > 0.5 and the layer is thinner than a band
        assert!(!should_be_periodic_line(&layer(1.9, 0.2), &rule()));
    }

    #[test]
    fn test_periodic_outside_height_range() {
        assert!(!should_be_periodic_line(&layer(0.2, 0.2), &rule()));
        let short = PeriodicColorRule::new(2, 0.3, 1.0, 0.5, 1.0);
        assert!(!should_be_periodic_line(&layer(1.3, 0.2), &short));
    }

    #[test]
    fn test_thick_layer_bottom_inside_band() {
        // top (2.0 - 0.3) mod 1 = 0.7, bottom (1.7 - 0.8) mod 1 = 0.9,
        // then 1.7 > ceil(0.9) * 1 + 0.5 = 1.5
        assert!(should_be_periodic_line(&layer(2.0, 0.8), &rule()));
        // top 0.8 past the band start, bottom (1.8 - 0.6) mod 1 = 0.2 < 0.5
        assert!(should_be_periodic_line(&layer(2.1, 0.6), &rule()));
    }

    #[test]
    fn test_thick_layer_window_boundaries() {
        // bottom (1.65 - 0.6) mod 1 = 0.05 < 0.5
        assert!(should_be_periodic_line(&layer(1.95, 0.6), &rule()));
        let narrow = PeriodicColorRule::new(2, 0.0, 100.0, 0.1, 1.0);
        // top 1.75 mod 1 = 0.75, bottom 1.15 mod 1 = 0.15,
        // and 1.75 > ceil(1.15) * 1 + 0.1 = 2.1 does not hold
        assert!(!should_be_periodic_line(&layer(1.75, 0.6), &narrow));
        // same window shifted above the next band start
        assert!(should_be_periodic_line(&layer(2.05, 0.6), &narrow));
    }

    #[test]
    fn test_no_double_band_after_oversized_band_layer() {
        let mut state = layer(2.0, 0.8);
        state.printing_periodic_color = true;
        state.previous_layer_thickness = 0.8;
        assert!(!should_be_periodic_line(&state, &rule()));
        // a thin previous layer does not block the band
        state.previous_layer_thickness = 0.2;
        assert!(should_be_periodic_line(&state, &rule()));
    }

    #[test]
    fn test_replacement_window() {
        let rules = [ReplacementColorRule::new(3, 0, 5.0, 10.0)];
        let mut colors = ColorTable::new();
        update_replacement_colors(&layer(5.0, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), None);
        update_replacement_colors(&layer(5.2, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), Some(3));
        update_replacement_colors(&layer(10.1, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), Some(3));
        update_replacement_colors(&layer(10.4, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), None);
    }

    #[test]
    fn test_replacement_last_match_wins() {
        let rules = [
            ReplacementColorRule::new(3, 0, 0.0, 10.0),
            ReplacementColorRule::new(1, 0, 5.0, 10.0),
        ];
        let mut colors = ColorTable::new();
        update_replacement_colors(&layer(2.0, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), Some(3));
        update_replacement_colors(&layer(6.0, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), Some(1));
        update_replacement_colors(&layer(12.0, 0.2), &rules, &mut colors);
        assert_eq!(colors.replacement(0), None);
    }

    #[test]
    fn test_replacement_never_stale() {
        let rules = [
            ReplacementColorRule::new(3, 0, 0.0, 5.0),
            ReplacementColorRule::new(1, 0, 3.0, 8.0),
            ReplacementColorRule::new(2, 1, 4.0, 6.0),
        ];
        let mut colors = ColorTable::new();
        let mut height = 0.2;
        while height < 10.0 {
            let state = layer(height, 0.2);
            update_replacement_colors(&state, &rules, &mut colors);
            for original in [0, 1] {
                let last_match = rules
                    .iter()
                    .filter(|r| r.original_color_index == original)
                    .filter(|r| height > r.start_height && height - 0.2 < r.end_height)
                    .last()
                    .map(|r| r.color_index);
                assert_eq!(colors.replacement(original), last_match, "height {height}");
            }
            height += 0.2;
        }
    }

    const TWO_FEATURE_LAYER: &str = "\
; CHANGE_LAYER
; Z_HEIGHT: 1.3
; LAYER_HEIGHT: 0.2
; MFM LAYER CHANGE END
M204 S5000
; FEATURE: Outer wall
G1 X1 Y1 E.1 F1200
; FEATURE: Prime tower
; MFM TOOLCHANGE START
M620 S1A
T1
M621 S1A
; MFM TOOLCHANGE END
G1 X5 E.3
; WIPE_END
; FEATURE: Sparse infill
G1 X2 Y2 E.2
; WIPE_END
G1 X3
; CHANGE_LAYER
; Z_HEIGHT: 1.5
";

    #[test]
    fn test_scan_layer_catalogue() {
        let rules = [rule().with_enabled_features(["Sparse infill"])];
        let scanner = LayerScanner::new(&rules, &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(TWO_FEATURE_LAYER);
        let mut previous = PrintState::new();
        previous.original_color = Some(0);

        let mut state = scanner
            .scan_layer(&mut r, &previous, &mut colors)
            .unwrap()
            .unwrap();
        assert_eq!(state.height, 1.3);
        assert_eq!(state.layer_thickness, 0.2);
        assert!(state.periodic);
        assert_eq!(state.band_color, Some(2));

        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Outer wall", "Sparse infill"]);
        assert_eq!(state.prime_towers.len(), 1);
        let tower = &state.prime_towers[0];
        let block = tower.toolchange.unwrap();
        assert_eq!(block.tool, Some(1));
        assert!(block.end.is_some());
        assert!(tower.wipe_end.is_some());

        // tool 1 was selected inside the tower
        assert_eq!(state.features[0].original_color, Some(0));
        assert_eq!(state.features[1].original_color, Some(1));
        assert_eq!(state.layer_end_original_color, Some(1));
        assert!(state.features[1].periodic);
        assert_eq!(state.features[1].printing_color, Some(2));
        assert!(!state.features[0].periodic);
        assert_eq!(state.last_feature_type.as_deref(), Some("Sparse infill"));

        let layer_end = state.layer_end.unwrap();
        assert_eq!(r.tell(), layer_end + "; CHANGE_LAYER\n".len() as u64);
        assert_eq!(state.features[1].end, layer_end);

        reorder_features(&mut state);
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Sparse infill", "Outer wall"]);
    }

    #[test]
    fn test_stop_positions_complete_and_unique() {
        let rules = [rule()];
        let scanner = LayerScanner::new(&rules, &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(TWO_FEATURE_LAYER);
        let mut state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        reorder_features(&mut state);

        assert_eq!(
            state.stop_positions.len(),
            state.features.len() + state.prime_towers.len() + 1
        );
        let mut unique = state.stop_positions.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), state.stop_positions.len());
        let end = state.layer_end.unwrap();
        assert!(state
            .stop_positions
            .iter()
            .all(|s| *s >= state.layer_start && *s <= end));
        assert_eq!(state.prime_tower_starts, vec![state.prime_towers[0].start]);
    }

    #[test]
    fn test_prime_tower_kept_in_place_on_regular_layer() {
        let rules = [PeriodicColorRule::new(2, 50.0, 100.0, 0.5, 1.0)];
        let scanner = LayerScanner::new(&rules, &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(TWO_FEATURE_LAYER);
        let state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        assert!(!state.periodic);
        assert!(state.prime_towers.is_empty());
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Outer wall", "Prime tower", "Sparse infill"]);
    }

    #[test]
    fn test_not_a_layer_reads_one_line() {
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut r = reader("G1 X1\n; CHANGE_LAYER\n");
        assert!(scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .is_none());
        assert_eq!(r.tell(), 6);
    }

    #[test]
    fn test_continued_feature_from_previous_layer() {
        let text = "\
;LAYER_CHANGE
;Z:0.4
;HEIGHT:0.2
; MFM LAYER CHANGE END
G1 Z.4
;WIDTH:0.45
G1 X1 E.2
;TYPE:Solid infill
G1 X2 E.2
";
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut previous = PrintState::new();
        previous.last_feature_type = Some("Internal infill".into());
        let mut r = reader(text);
        let state = scanner
            .scan_layer(&mut r, &previous, &mut colors)
            .unwrap()
            .unwrap();
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Internal infill", "Solid infill"]);
        assert_eq!(state.features[0].start_position.z, Some(0.4));
        assert_eq!(state.layer_end, Some(text.len() as u64));
    }

    #[test]
    fn test_unknown_continued_placeholder() {
        let text = "\
;LAYER_CHANGE
;Z:0.4
;HEIGHT:0.2
; MFM LAYER CHANGE END
M204 S4000
G1 X1 E.2
;TYPE:Solid infill
";
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(text);
        let state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, [UNKNOWN_CONTINUED, "Solid infill"]);
    }

    const FILAMENT_END_LAYER: &str = "\
; CHANGE_LAYER
; Z_HEIGHT: 0.4
; LAYER_HEIGHT: 0.2
; MFM LAYER CHANGE END
G1 Z.4
; filament end gcode
; MFM TOOLCHANGE START
M620 S1A
T1
M621 S1A
; MFM TOOLCHANGE END
G1 X1 E.2
; FEATURE: Outer wall
G1 X2 E.2
";

    #[test]
    fn test_filament_end_opens_continued_feature() {
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut previous = PrintState::new();
        previous.original_color = Some(0);
        previous.last_feature_type = Some("Sparse infill".into());
        let mut r = reader(FILAMENT_END_LAYER);
        let state = scanner
            .scan_layer(&mut r, &previous, &mut colors)
            .unwrap()
            .unwrap();

        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Sparse infill", "Outer wall"]);
        let continued = &state.features[0];
        let start = FILAMENT_END_LAYER.find("; filament end gcode").unwrap() as u64;
        assert_eq!(continued.start, start);
        assert_eq!(continued.original_color, Some(0));
        let block = continued.toolchange.unwrap();
        assert_eq!(
            block.start,
            FILAMENT_END_LAYER.find("; MFM TOOLCHANGE START").unwrap() as u64
        );
        assert_eq!(
            block.end,
            Some(FILAMENT_END_LAYER.find("; MFM TOOLCHANGE END").unwrap() as u64)
        );
        assert_eq!(block.tool, Some(1));
        assert_eq!(state.features[1].original_color, Some(1));
        assert_eq!(
            continued.end,
            FILAMENT_END_LAYER.find("; FEATURE: Outer wall").unwrap() as u64
        );
    }

    #[test]
    fn test_filament_end_without_previous_type() {
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(FILAMENT_END_LAYER);
        let state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, [UNKNOWN_CONTINUED, "Outer wall"]);
        assert!(state.features[0].toolchange.is_some());
    }

    fn layer_after_filler(filler: usize) -> String {
        let mut text = String::from(
            "; CHANGE_LAYER\n; Z_HEIGHT: 0.4\n; LAYER_HEIGHT: 0.2\n; MFM LAYER CHANGE END\n",
        );
        for _ in 0..filler {
            text.push_str("G1 X1 Y1\n");
        }
        text.push_str("; FEATURE: Outer wall\nG1 X2 E.1\n");
        text
    }

    #[test]
    fn test_lookahead_is_bounded() {
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();

        let text = layer_after_filler(LAYER_START_LOOKAHEAD_LINES - 1);
        let mut r = reader(&text);
        let state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        let names: Vec<_> = state.features.iter().map(|f| f.feature_type.as_str()).collect();
        assert_eq!(names, ["Outer wall"]);
        assert_eq!(state.layer_end, Some(text.len() as u64));

        // the marker lies one line past the lookahead window
        let text = layer_after_filler(LAYER_START_LOOKAHEAD_LINES);
        let mut r = reader(&text);
        let state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        assert!(state.features.is_empty());
        assert_eq!(state.layer_end, None);
    }

    #[test]
    fn test_layer_without_features_is_abandoned() {
        let text = "\
; CHANGE_LAYER
; Z_HEIGHT: 0.2
; LAYER_HEIGHT: 0.2
; MFM LAYER CHANGE END
G1 Z.6
; CHANGE_LAYER
";
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(text);
        let mut state = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap()
            .unwrap();
        assert!(state.features.is_empty());
        assert_eq!(state.layer_end, None);
        reorder_features(&mut state);
        assert!(state.stop_positions.is_empty());
    }

    #[test]
    fn test_toolchange_end_without_start_fails() {
        let text = "\
; CHANGE_LAYER
; Z_HEIGHT: 0.2
; LAYER_HEIGHT: 0.2
; FEATURE: Outer wall
G1 X1 E1
; MFM TOOLCHANGE END
";
        let scanner = LayerScanner::new(&[], &[]);
        let mut colors = ColorTable::new();
        let mut r = reader(text);
        let err = scanner
            .scan_layer(&mut r, &PrintState::new(), &mut colors)
            .unwrap_err();
        let expected = text.find("; MFM TOOLCHANGE END").unwrap() as u64;
        match err {
            GcodeError::Structure { offset, .. } => assert_eq!(offset, expected),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_next_layer_carry_over() {
        let mut last = PrintState::new();
        last.layer_thickness = 0.3;
        last.original_color = Some(0);
        last.layer_end_original_color = Some(2);
        last.printing_color = Some(3);
        last.printing_periodic_color = true;
        last.last_feature_type = Some("Outer wall".into());
        last.skip_write = true;
        last.features.push_back(Feature::new("x", 0, Position::new(), None));

        let next = last.next_layer(42);
        assert!(next.in_layer);
        assert_eq!(next.previous_layer_thickness, 0.3);
        assert_eq!(next.original_color, Some(2));
        assert_eq!(next.printing_color, Some(3));
        assert!(next.printing_periodic_color);
        assert_eq!(next.prev_layer_last_feature_type.as_deref(), Some("Outer wall"));
        assert_eq!(next.layer_start, 42);
        assert!(!next.skip_write);
        assert!(next.features.is_empty());
    }

    #[test]
    fn test_take_stop() {
        let mut state = PrintState::new();
        state.stop_positions = vec![10, 20, 30];
        assert!(state.is_stop(20));
        assert!(state.take_stop(20));
        assert!(!state.take_stop(20));
        assert_eq!(state.stop_positions, vec![10, 30]);
    }
}

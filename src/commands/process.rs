//! The single-pass rewrite engine.
//!
//! # Algorithm
//!
//! The input is read line by line with a byte-offset cursor:
//! 1. While the current layer has no features left, every line is checked
//!    for a following layer-change marker. A new layer is scanned in full
//!    and its features reordered, then the cursor returns to the marker.
//! 2. While features remain, reaching a stop position (the start of a
//!    feature, a captured prime tower or the layer end) ends the feature
//!    being streamed and the cursor jumps to the start of the next feature
//!    in the reordered list.
//! 3. Entering a feature may insert a toolchange and restore the motion
//!    state. On periodic layers the feature's own toolchange and
//!    wipe-finish blocks are suppressed.
//!
//! Every line that is written goes through the color filter of
//! [`GcodeWriter`].

use std::fmt;
use std::io::{Read, Seek, Write};
use std::time::Instant;

use tracing::{debug, info};

use crate::color::ColorTable;
use crate::commands::line_ending::resolve_line_ending;
use crate::config::{Configuration, LineEnding};
use crate::gcode::{create_file, open_file, GcodeReader, Result};
use crate::layer::{reorder_features, Feature, LayerScanner, PrintState, SkipType};
use crate::status::{StatusItem, StatusSink, COMPLETED_PROGRESS};
use crate::streaming::buffers::DEFAULT_LINE_BUFFER;
use crate::streaming::output::GcodeWriter;
use crate::streaming::parsing::{self, RETAIN_WIPE_END_FEATURE_TYPES};
use crate::toolchange::{
    insert_toolchange, layer_end_toolchange, needs_toolchange, PendingToolchange,
    ToolchangeKind, ToolchangeTemplate, PRIME_FEED_RATE,
};

/// Rewrite command configuration.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    config: Configuration,
}

impl ProcessCommand {
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Rewrite the configured input file into the configured output file.
    ///
    /// Failures are reported to `status` as a terminal item before being
    /// returned. Output written before a failure stays on disk.
    pub fn run<S: StatusSink>(&self, status: &S) -> Result<ProcessStats> {
        let result = self.run_files(status);
        if let Err(e) = &result {
            status.post(StatusItem::new().with_right(format!("Failed to open {e}")));
        }
        result
    }

    fn run_files<S: StatusSink>(&self, status: &S) -> Result<ProcessStats> {
        self.config.validate()?;
        let template = ToolchangeTemplate::from_path(&self.config.toolchange_template)?;
        let line_ending = resolve_line_ending(self.config.line_ending, &self.config.input)?;
        info!(
            input = %self.config.input.display(),
            output = %self.config.output.display(),
            flavor = self.config.flavor.tag(),
            "line ending {}",
            line_ending
        );
        let input = open_file(&self.config.input)?;
        let output = create_file(&self.config.output)?;
        self.run_streaming(input, output, &template, line_ending, status)
    }

    /// Core rewrite over any seekable input and any output.
    pub fn run_streaming<R: Read + Seek, W: Write, S: StatusSink>(
        &self,
        input: R,
        output: W,
        template: &ToolchangeTemplate,
        line_ending: LineEnding,
        status: &S,
    ) -> Result<ProcessStats> {
        let started = Instant::now();
        let reader = GcodeReader::new(input)?;
        let writer = GcodeWriter::new(output, line_ending.as_bytes());
        let mut rewriter = Rewriter::new(&self.config, reader, writer, template, status);
        rewriter.run()?;

        status.post(
            StatusItem::new()
                .with_left(format!("Current Layer {}", rewriter.state.height))
                .with_right(format!("Completed in {:.2?}", started.elapsed()))
                .with_progress(COMPLETED_PROGRESS),
        );
        info!("{}", rewriter.stats);
        Ok(rewriter.stats)
    }
}

/// Statistics from a rewrite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub layers_found: usize,
    pub periodic_layers: usize,
    pub features_streamed: usize,
    pub full_toolchanges: usize,
    pub minimal_toolchanges: usize,
    /// Original toolchange blocks left out of periodic features.
    pub toolchanges_suppressed: usize,
    /// Captured prime towers never replayed.
    pub prime_towers_dropped: usize,
    pub bytes_read: u64,
    pub lines_written: u64,
}

impl ProcessStats {
    pub fn toolchanges_inserted(&self) -> usize {
        self.full_toolchanges + self.minimal_toolchanges
    }
}

impl fmt::Display for ProcessStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layers: {} ({} periodic), features: {}, toolchanges inserted: {} full / {} minimal, \
             suppressed: {}, prime towers dropped: {}, bytes read: {}, lines written: {}",
            self.layers_found,
            self.periodic_layers,
            self.features_streamed,
            self.full_toolchanges,
            self.minimal_toolchanges,
            self.toolchanges_suppressed,
            self.prime_towers_dropped,
            self.bytes_read,
            self.lines_written
        )
    }
}

/// State of one rewrite pass.
struct Rewriter<'a, R, W: Write, S> {
    config: &'a Configuration,
    scanner: LayerScanner<'a>,
    template: &'a ToolchangeTemplate,
    status: &'a S,
    reader: GcodeReader<R>,
    writer: GcodeWriter<W>,
    colors: ColorTable,
    state: PrintState,
    /// Feature being streamed.
    feature: Option<Feature>,
    /// Features entered on the current layer.
    entered: usize,
    stats: ProcessStats,
}

impl<'a, R: Read + Seek, W: Write, S: StatusSink> Rewriter<'a, R, W, S> {
    fn new(
        config: &'a Configuration,
        reader: GcodeReader<R>,
        writer: GcodeWriter<W>,
        template: &'a ToolchangeTemplate,
        status: &'a S,
    ) -> Self {
        Self {
            config,
            scanner: LayerScanner::new(&config.periodic_colors, &config.replacement_colors),
            template,
            status,
            reader,
            writer,
            colors: ColorTable::new(),
            state: PrintState::new(),
            feature: None,
            entered: 0,
            stats: ProcessStats::default(),
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut line = Vec::with_capacity(DEFAULT_LINE_BUFFER);
        if self.at_layer_change()? {
            self.scan_next_layer()?;
        }
        loop {
            if self.reader.read_line_into(&mut line)? == 0 {
                break;
            }
            let offset = self.reader.tell();
            self.state.skip_write_current_line = false;
            self.track(&line);

            if self.state.features.is_empty() {
                if self.layer_boundary(&line, offset)? {
                    continue;
                }
            } else if self.state.take_stop(offset) {
                self.next_feature(&line, offset)?;
            }

            self.suppress_originals(&line)?;

            if !self.state.skip_write && !self.state.skip_write_current_line {
                self.emit(&line)?;
            }
            if self.state.skip_write_current_line {
                self.state.skip_write = false;
                self.state.skip_write_current_line = false;
            }
        }

        self.writer.write_comment(&format!(
            "; Post Processed with {} {}",
            self.config.app_name, self.config.app_version
        ))?;
        self.writer.flush()?;
        self.stats.bytes_read = self.reader.len();
        self.stats.lines_written = self.writer.lines_written();
        Ok(())
    }

    /// Fold a read line into the streaming position. Tool selects before
    /// the first layer set the starting tool.
    fn track(&mut self, line: &[u8]) {
        self.state.position.update(line);
        if !self.state.in_layer {
            if let Some(tool) = parsing::tool_select(line) {
                self.state.original_color = Some(tool);
            }
        }
    }

    /// Write a line through the color filter and follow the loaded tool.
    fn emit(&mut self, line: &[u8]) -> Result<()> {
        if let Some(tool) = self.writer.write_line(line, &self.colors)? {
            self.state.set_printing_color(tool);
        }
        Ok(())
    }

    /// Handle a line read while no features are left on the layer.
    ///
    /// Returns true if the line has been fully handled.
    fn layer_boundary(&mut self, line: &[u8], offset: u64) -> Result<bool> {
        let mut flushed = false;
        if self.state.is_stop(offset) {
            if !self.state.skip_write {
                self.emit(line)?;
            }
            flushed = true;
            if self.state.prime_tower_starts.contains(&offset) {
                self.writer.write_comment("; MFM Original Prime Tower skipped")?;
            }
            self.finish_layer()?;
        }

        if !self.at_layer_change()? {
            return Ok(flushed);
        }
        // written before the scan updates the replacement table
        if !flushed && !self.state.skip_write {
            self.emit(line)?;
        }
        self.scan_next_layer()?;
        Ok(true)
    }

    /// Whether the next line is a layer-change marker. The reader position
    /// is kept.
    fn at_layer_change(&mut self) -> Result<bool> {
        let resume = self.reader.tell();
        let at_layer = self
            .reader
            .read_line()?
            .is_some_and(parsing::is_layer_change);
        self.reader.seek(resume)?;
        Ok(at_layer)
    }

    /// Scan the layer starting at the reader position and make it current,
    /// then return to its marker.
    fn scan_next_layer(&mut self) -> Result<()> {
        let resume = self.reader.tell();
        let scanned = self
            .scanner
            .scan_layer(&mut self.reader, &self.state, &mut self.colors)?;
        if let Some(next) = scanned {
            self.start_layer(next, resume);
        }
        self.reader.seek(resume)?;
        Ok(())
    }

    /// Close the current layer: place the layer-end toolchange, drop unused
    /// prime towers and move to the layer end.
    fn finish_layer(&mut self) -> Result<()> {
        if let Some(end) = self.state.layer_end {
            if let Some(pending) = self.state.pending_toolchange.filter(|p| p.offset == end) {
                self.insert(pending)?;
            }
            if !self.state.prime_towers.is_empty() {
                debug!(
                    count = self.state.prime_towers.len(),
                    height = self.state.height,
                    "unused prime towers dropped"
                );
                self.stats.prime_towers_dropped += self.state.prime_towers.len();
                self.state.prime_towers.clear();
            }
            self.reader.seek(end)?;
        }
        self.state.stop_positions.clear();
        self.state.skip_write = false;
        Ok(())
    }

    fn start_layer(&mut self, next: PrintState, offset: u64) {
        self.state = next;
        self.feature = None;
        self.entered = 0;
        self.stats.layers_found += 1;
        if self.state.is_periodic() {
            self.stats.periodic_layers += 1;
        }

        reorder_features(&mut self.state);
        self.state.pending_toolchange = needs_toolchange(
            &self.state.features,
            None,
            self.state.printing_color,
            &self.colors,
        );
        if let Some(pending) = &self.state.pending_toolchange {
            debug!(
                offset = pending.offset,
                "layer start toolchange scheduled {} -> {}",
                pending.color,
                pending.printing_color
            );
        }

        let len = self.reader.len();
        self.status.post(
            StatusItem::new()
                .with_left(format!("Current Layer {}", self.state.height))
                .with_right("Analyzing")
                .with_progress(percent(offset, len)),
        );
        let end = self.state.layer_end.unwrap_or(offset);
        let middle = self.state.layer_start + end.saturating_sub(self.state.layer_start) / 2;
        self.status.post(
            StatusItem::new()
                .with_right("Writing")
                .with_progress(percent(middle, len)),
        );
    }

    /// Jump from a stop position to the next feature in the reordered list.
    fn next_feature(&mut self, line: &[u8], offset: u64) -> Result<()> {
        let Some(mut feature) = self.state.features.pop_front() else {
            return Ok(());
        };
        let jumped_tower = self.state.prime_tower_starts.contains(&offset);
        self.status
            .post(StatusItem::new().with_right(format!("{} Writing", feature.feature_type)));
        self.reader.seek(feature.start)?;
        self.enter_feature(&mut feature, line, jumped_tower)?;
        self.feature = Some(feature);
        Ok(())
    }

    /// Start streaming a feature. `line` is the last line read before the
    /// jump and has not been written yet.
    fn enter_feature(&mut self, feature: &mut Feature, line: &[u8], jumped_tower: bool) -> Result<()> {
        let index = self.entered;
        self.entered += 1;
        self.stats.features_streamed += 1;

        let previous_skipped = self.state.skip_write;
        self.state.skip_write = false;
        if !previous_skipped {
            self.emit(line)?;
        }
        if jumped_tower {
            self.writer.write_comment("; MFM Original Prime Tower skipped")?;
        }

        let due = self
            .state
            .pending_toolchange
            .filter(|p| p.offset == feature.start);
        let inserted = match due {
            Some(pending) => Some(self.insert(pending)?),
            None => None,
        };
        self.state.skip_write_current_line = true;

        let periodic = self.state.is_periodic();
        if periodic || index == 0 {
            self.restore(feature, inserted)?;
        }
        if !periodic {
            return Ok(());
        }

        self.state.pending_toolchange = needs_toolchange(
            &self.state.features,
            None,
            self.state.printing_color,
            &self.colors,
        )
        .or_else(|| layer_end_toolchange(&self.state, &self.colors));
        feature.skip = Some(SkipType::OriginalToolchangeAndWipeEnd);
        Ok(())
    }

    /// Restore acceleration, position and travel feed rate from before the
    /// feature, then prime.
    fn restore(&mut self, feature: &Feature, inserted: Option<ToolchangeKind>) -> Result<()> {
        self.writer.write_comment("; MFM Pre-Feature Restore Positions")?;
        self.writer.write_acceleration_restore(&feature.start_position)?;
        self.writer.write_position_restore(&feature.start_position)?;
        match inserted {
            Some(kind) => self
                .writer
                .write_prime(kind.prime_extrusion(), Some(PRIME_FEED_RATE))?,
            None if self.state.wipe_end_prime => {
                self.state.wipe_end_prime = false;
                if let Some(e) = self.state.position.e {
                    self.writer.write_prime(e, self.state.position.f)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn insert(&mut self, pending: PendingToolchange) -> Result<ToolchangeKind> {
        let kind = insert_toolchange(
            &mut self.reader,
            &mut self.writer,
            &mut self.state,
            pending,
            self.template,
            &self.colors,
        )?;
        match kind {
            ToolchangeKind::Full => self.stats.full_toolchanges += 1,
            ToolchangeKind::Minimal => self.stats.minimal_toolchanges += 1,
        }
        Ok(kind)
    }

    /// Start suppressing the original toolchange or wipe-finish block of a
    /// periodic feature when the cursor reaches it. `line` is the line right
    /// before the block and is still written.
    fn suppress_originals(&mut self, line: &[u8]) -> Result<()> {
        let Some(feature) = &self.feature else {
            return Ok(());
        };
        if feature.skip != Some(SkipType::OriginalToolchangeAndWipeEnd) || self.state.skip_write {
            return Ok(());
        }
        let next = self.reader.tell();
        let at_toolchange = feature.toolchange.is_some_and(|tc| tc.start == next);
        let at_wipe_end = feature.wipe_end == Some(next)
            && !RETAIN_WIPE_END_FEATURE_TYPES.contains(&feature.feature_type.as_str());

        if at_toolchange {
            if !self.state.skip_write_current_line {
                self.emit(line)?;
            }
            self.writer.write_comment("; MFM Original Feature Toolchange skipped")?;
            self.state.skip_write = true;
            self.stats.toolchanges_suppressed += 1;
        } else if at_wipe_end {
            if !self.state.skip_write_current_line {
                self.emit(line)?;
            }
            self.writer.write_wipe_end_placeholders()?;
            self.writer.write_comment("; MFM Original WIPE_END skipped")?;
            self.state.skip_write = true;
            self.state.wipe_end_prime = true;
        }
        Ok(())
    }
}

#[inline]
fn percent(offset: u64, len: u64) -> f64 {
    if len == 0 {
        0.0
    } else {
        offset as f64 / len as f64 * 100.0
    }
}

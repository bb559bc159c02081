//! G-code output writer.
//!
//! Pass-through lines are written byte-for-byte, except that tool-select
//! family instructions are remapped through the active [`ColorTable`].
//! Synthesized lines (audit comments, restore and prime moves) use the
//! configured line ending and are formatted with itoa/ryu.

use std::io::{BufWriter, Write};

use crate::color::ColorTable;
use crate::gcode::Result;
use crate::position::Position;
use crate::streaming::buffers::DEFAULT_OUTPUT_BUFFER;
use crate::streaming::parsing::{substitute_tool, tool_family_index, tool_select};

const PRUSA_WIPE_END_PLACEHOLDER: &[u8] = b";WIPE_END placeholder for PrusaSlicer Gcode Viewer";
const BAMBU_WIPE_END_PLACEHOLDER: &[u8] = b"; WIPE_END placeholder for BambuStudio Gcode Preview";

/// Buffered G-code writer with a color-substitution filter.
pub struct GcodeWriter<W: Write> {
    writer: BufWriter<W>,
    line_ending: &'static [u8],
    itoa_buf: itoa::Buffer,
    ryu_buf: ryu::Buffer,
    lines_written: u64,
}

impl<W: Write> GcodeWriter<W> {
    pub fn new(output: W, line_ending: &'static [u8]) -> Self {
        Self::with_capacity(DEFAULT_OUTPUT_BUFFER, output, line_ending)
    }

    pub fn with_capacity(capacity: usize, output: W, line_ending: &'static [u8]) -> Self {
        Self {
            writer: BufWriter::with_capacity(capacity, output),
            line_ending,
            itoa_buf: itoa::Buffer::new(),
            ryu_buf: ryu::Buffer::new(),
            lines_written: 0,
        }
    }

    /// Write an input line through the color filter.
    ///
    /// Returns the emitted tool index if the line was a bare tool select, so
    /// the caller can track which tool is loaded.
    pub fn write_line(&mut self, line: &[u8], colors: &ColorTable) -> Result<Option<usize>> {
        let Some(index) = tool_family_index(line) else {
            self.writer.write_all(line)?;
            self.lines_written += 1;
            return Ok(None);
        };
        let printing = colors.printing_index(index);
        if printing == index {
            self.writer.write_all(line)?;
        } else {
            self.writer.write_all(&substitute_tool(line, printing))?;
        }
        self.lines_written += 1;
        Ok(tool_select(line).map(|_| printing))
    }

    /// Write a synthesized comment line.
    pub fn write_comment(&mut self, comment: &str) -> Result<()> {
        self.write_synthetic(comment.as_bytes())
    }

    /// Write bytes followed by the configured line ending.
    pub fn write_synthetic(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line)?;
        self.writer.write_all(self.line_ending)?;
        self.lines_written += 1;
        Ok(())
    }

    /// Write bytes verbatim, without filtering or a line ending.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.lines_written += count_lines(bytes);
        Ok(())
    }

    /// Stand-in comments for a suppressed wipe-finish block, so that slicer
    /// previews still see the end of the wipe.
    pub fn write_wipe_end_placeholders(&mut self) -> Result<()> {
        self.write_synthetic(PRUSA_WIPE_END_PLACEHOLDER)?;
        self.write_synthetic(BAMBU_WIPE_END_PLACEHOLDER)
    }

    /// `M204 P.. R.. T..` with every known acceleration. Nothing is written
    /// if none is known.
    pub fn write_acceleration_restore(&mut self, position: &Position) -> Result<()> {
        let words = [
            (b'P', position.accel_print),
            (b'R', position.accel_retract),
            (b'T', position.accel_travel),
        ];
        self.write_words(b"M204", &words)
    }

    /// `G0 X.. Y.. Z.. F..` back to the captured position, at travel speed.
    pub fn write_position_restore(&mut self, position: &Position) -> Result<()> {
        let words = [
            (b'X', position.x),
            (b'Y', position.y),
            (b'Z', position.z),
            (b'F', position.f_travel),
        ];
        self.write_words(b"G0", &words)
    }

    /// `G1 E.. F..` priming move.
    pub fn write_prime(&mut self, e: f64, f: Option<f64>) -> Result<()> {
        self.write_words(b"G1", &[(b'E', Some(e)), (b'F', f)])
    }

    fn write_words(&mut self, command: &[u8], words: &[(u8, Option<f64>)]) -> Result<()> {
        if words.iter().all(|(_, v)| v.is_none()) {
            return Ok(());
        }
        self.writer.write_all(command)?;
        for (letter, value) in words {
            if let Some(value) = value {
                self.writer.write_all(&[b' ', *letter])?;
                self.write_number(*value)?;
            }
        }
        self.writer.write_all(self.line_ending)?;
        self.lines_written += 1;
        Ok(())
    }

    /// Integral values print without a fractional part.
    #[inline]
    fn write_number(&mut self, value: f64) -> Result<()> {
        if value.fract() == 0.0 && value.abs() < 1e15 {
            self.writer
                .write_all(self.itoa_buf.format(value as i64).as_bytes())?;
        } else {
            self.writer.write_all(self.ryu_buf.format(value).as_bytes())?;
        }
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn count_lines(bytes: &[u8]) -> u64 {
    memchr::memchr_iter(b'\n', bytes).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written<F>(f: F) -> Vec<u8>
    where
        F: FnOnce(&mut GcodeWriter<&mut Vec<u8>>),
    {
        let mut output = Vec::new();
        {
            let mut writer = GcodeWriter::new(&mut output, b"\n");
            f(&mut writer);
            writer.flush().unwrap();
        }
        output
    }

    #[test]
    fn test_passthrough_is_verbatim() {
        let colors = ColorTable::new();
        let out = written(|w| {
            assert_eq!(w.write_line(b"G1 X1 E.2\r\n", &colors).unwrap(), None);
            assert_eq!(w.write_line(b"T2\r\n", &colors).unwrap(), Some(2));
        });
        assert_eq!(out, b"G1 X1 E.2\r\nT2\r\n");
    }

    #[test]
    fn test_filter_applies_replacement() {
        let mut colors = ColorTable::new();
        colors.set_replacement(0, 3);
        let out = written(|w| {
            w.write_line(b"M620 S0A\n", &colors).unwrap();
            assert_eq!(w.write_line(b"T0\n", &colors).unwrap(), Some(3));
            w.write_line(b"M621 S0A\n", &colors).unwrap();
            assert_eq!(w.write_line(b"T1\n", &colors).unwrap(), Some(1));
        });
        assert_eq!(out, b"M620 S3A\nT3\nM621 S3A\nT1\n");
    }

    #[test]
    fn test_restore_lines() {
        let mut p = Position::new();
        p.update(b"M204 S5000\n");
        p.update(b"G1 X10.5 Y20 Z.2 F1200\n");
        p.update(b"G1 X11 E.5 F1800\n");
        let out = written(|w| {
            w.write_acceleration_restore(&p).unwrap();
            w.write_position_restore(&p).unwrap();
            w.write_prime(0.8, Some(1800.0)).unwrap();
        });
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "M204 P5000 T5000\nG0 X11 Y20 Z0.2 F1200\nG1 E0.8 F1800\n"
        );
    }

    #[test]
    fn test_restore_skipped_when_unknown() {
        let p = Position::new();
        let out = written(|w| {
            w.write_acceleration_restore(&p).unwrap();
            w.write_position_restore(&p).unwrap();
        });
        assert!(out.is_empty());
    }

    #[test]
    fn test_synthetic_lines_use_line_ending() {
        let mut output = Vec::new();
        {
            let mut w = GcodeWriter::new(&mut output, b"\r\n");
            w.write_comment("; hello").unwrap();
            w.write_wipe_end_placeholders().unwrap();
            assert_eq!(w.lines_written(), 3);
            w.flush().unwrap();
        }
        assert_eq!(
            output,
            b"; hello\r\n;WIPE_END placeholder for PrusaSlicer Gcode Viewer\r\n; WIPE_END placeholder for BambuStudio Gcode Preview\r\n"
        );
    }
}

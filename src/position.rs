//! Position, feed rate and acceleration tracking.
//!
//! Every motion (`G0`-`G3`) and acceleration (`M204`) instruction seen is
//! folded into a [`Position`] so that motion state can be restored after a
//! feature has been relocated. Fields stay `None` until an instruction sets
//! them.

use memchr::memchr;

use crate::streaming::parsing::parse_f64;

/// Last known motion state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
    /// Last feed rate of any move.
    pub f: Option<f64>,
    /// Feed rate in effect at the last move without extrusion.
    pub f_travel: Option<f64>,
    /// Printing acceleration (`M204 P`).
    pub accel_print: Option<f64>,
    /// Retract acceleration (`M204 R`).
    pub accel_retract: Option<f64>,
    /// Travel acceleration (`M204 T`).
    pub accel_travel: Option<f64>,
}

impl Position {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one instruction into the position. Returns true if the line was a
    /// motion or acceleration instruction.
    pub fn update(&mut self, line: &[u8]) -> bool {
        if let Some(args) = motion_args(line) {
            self.apply_motion(args);
            true
        } else if let Some(args) = acceleration_args(line) {
            self.apply_acceleration(args);
            true
        } else {
            false
        }
    }

    fn apply_motion(&mut self, args: &[u8]) {
        let mut travel = true;
        for (axis, value) in words(args, b"XYZIJPREF") {
            match axis {
                b'X' => self.x = Some(value),
                b'Y' => self.y = Some(value),
                b'Z' => self.z = Some(value),
                b'E' => {
                    self.e = Some(value);
                    travel = false;
                }
                b'F' => self.f = Some(value),
                // arc centers and arc parameters
                _ => {}
            }
        }
        if travel && self.f.is_some() {
            self.f_travel = self.f;
        }
    }

    fn apply_acceleration(&mut self, args: &[u8]) {
        for (axis, value) in words(args, b"PRTS") {
            match axis {
                b'P' => self.accel_print = Some(value),
                b'R' => self.accel_retract = Some(value),
                b'T' => self.accel_travel = Some(value),
                b'S' => {
                    self.accel_print = Some(value);
                    self.accel_travel = Some(value);
                }
                _ => {}
            }
        }
    }
}

/// Arguments of a `G0`..`G3` instruction, or `None` for any other line.
fn motion_args(line: &[u8]) -> Option<&[u8]> {
    match line {
        [b'G', b'0'..=b'3', b' ', rest @ ..] => Some(rest),
        _ => None,
    }
}

/// Arguments of an `M204` instruction, or `None` for any other line.
fn acceleration_args(line: &[u8]) -> Option<&[u8]> {
    line.strip_prefix(b"M204 ")
}

/// Iterate `<letter><number>` words up to the first word that is not one of
/// `letters` followed by a number (a trailing comment ends the scan).
fn words<'a>(args: &'a [u8], letters: &'a [u8]) -> impl Iterator<Item = (u8, f64)> + 'a {
    let args = match memchr(b';', args) {
        Some(i) => &args[..i],
        None => args,
    };
    args.split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty())
        .map_while(move |w| {
            let axis = w[0];
            if !letters.contains(&axis) {
                return None;
            }
            parse_f64(&w[1..]).map(|v| (axis, v))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_updates_axes() {
        let mut p = Position::new();
        assert!(p.update(b"G1 X10.5 Y-2 Z.4 E.03 F1200\n"));
        assert_eq!(p.x, Some(10.5));
        assert_eq!(p.y, Some(-2.0));
        assert_eq!(p.z, Some(0.4));
        assert_eq!(p.e, Some(0.03));
        assert_eq!(p.f, Some(1200.0));
        // extruding move does not touch the travel feed rate
        assert_eq!(p.f_travel, None);
    }

    #[test]
    fn test_travel_feed_rate_split() {
        let mut p = Position::new();
        p.update(b"G1 X1 E1 F1500\n");
        p.update(b"G0 X2 Y2 F9000\n");
        assert_eq!(p.f_travel, Some(9000.0));
        p.update(b"G1 X3 E2 F1800\n");
        assert_eq!(p.f, Some(1800.0));
        assert_eq!(p.f_travel, Some(9000.0));
        // a travel move without F records the current feed rate
        p.update(b"G1 X4\n");
        assert_eq!(p.f_travel, Some(1800.0));
    }

    #[test]
    fn test_arc_parameters_ignored() {
        let mut p = Position::new();
        p.update(b"G2 Z0.6 I0.86 J0.86 P1 F30000 ; spiral lift\n");
        assert_eq!(p.z, Some(0.6));
        assert_eq!(p.x, None);
        assert_eq!(p.f, Some(30000.0));
    }

    #[test]
    fn test_acceleration() {
        let mut p = Position::new();
        assert!(p.update(b"M204 S5000\n"));
        assert_eq!(p.accel_print, Some(5000.0));
        assert_eq!(p.accel_travel, Some(5000.0));
        p.update(b"M204 P800 R1250 T3000\n");
        assert_eq!(p.accel_print, Some(800.0));
        assert_eq!(p.accel_retract, Some(1250.0));
        assert_eq!(p.accel_travel, Some(3000.0));
    }

    #[test]
    fn test_non_matching_lines_are_noops() {
        let mut p = Position::new();
        assert!(!p.update(b"G28\n"));
        assert!(!p.update(b"G10 X1\n"));
        assert!(!p.update(b"; G1 X1\n"));
        assert!(!p.update(b"M2040 S1\n"));
        assert_eq!(p, Position::new());
    }
}

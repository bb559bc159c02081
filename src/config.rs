//! Run configuration for MFM.
//!
//! A [`Configuration`] is immutable for the duration of one rewrite run and
//! carries everything the engine needs: paths, the ordered color rules, the
//! resolved line ending and the trailer identity. Rules are usually built
//! from a JSON options file expressed in real-world elevations.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::gcode::{open_file, GcodeError, Result};

/// Application name written to the output trailer.
pub const APP_NAME: &str = "MFM";

/// G-code flavors understood by the rewrite engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcodeFlavor {
    /// Marlin 2 output from Bambu/Orca/Prusa slicers, annotated with
    /// `; MFM TOOLCHANGE START/END` and `; MFM LAYER CHANGE END` markers.
    #[default]
    MarkedToolchange,
}

impl GcodeFlavor {
    pub fn tag(&self) -> &'static str {
        match self {
            GcodeFlavor::MarkedToolchange => "marlin2_bambu_prusa_markedtoolchangegcode",
        }
    }
}

/// Line ending used for synthesized output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LineEnding {
    /// Detect from the input file, falling back to Unix.
    #[default]
    Auto,
    /// `\r\n`
    Windows,
    /// `\n`
    Unix,
}

impl LineEnding {
    /// The concrete byte sequence. `Auto` must be resolved first; it is
    /// treated as Unix here.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::Windows => b"\r\n",
            LineEnding::Unix | LineEnding::Auto => b"\n",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineEnding::Auto => write!(f, "Autodetect"),
            LineEnding::Windows => write!(f, "Windows '\\r\\n'"),
            LineEnding::Unix => write!(f, "Unix '\\n'"),
        }
    }
}

/// A repeating isoline band.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicColorRule {
    /// Tool printed inside the band.
    pub color_index: usize,
    /// Model height of the first band.
    pub start_height: f64,
    /// Model height after which no band is printed.
    pub end_height: f64,
    /// Thickness of one band.
    pub band_thickness: f64,
    /// Distance between band starts.
    pub period: f64,
    /// Feature types that carry the band. Empty means all.
    pub enabled_features: Vec<String>,
}

impl PeriodicColorRule {
    pub fn new(
        color_index: usize,
        start_height: f64,
        end_height: f64,
        band_thickness: f64,
        period: f64,
    ) -> Self {
        Self {
            color_index,
            start_height,
            end_height,
            band_thickness,
            period,
            enabled_features: Vec::new(),
        }
    }

    pub fn with_enabled_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a feature of this type carries the band.
    pub fn applies_to(&self, feature_type: &str) -> bool {
        self.enabled_features.is_empty() || self.enabled_features.iter().any(|f| f == feature_type)
    }
}

/// A height range in which one tool is substituted for another.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementColorRule {
    /// Tool emitted inside the range.
    pub color_index: usize,
    /// Tool being replaced.
    pub original_color_index: usize,
    pub start_height: f64,
    pub end_height: f64,
}

impl ReplacementColorRule {
    pub fn new(
        color_index: usize,
        original_color_index: usize,
        start_height: f64,
        end_height: f64,
    ) -> Self {
        Self {
            color_index,
            original_color_index,
            start_height,
            end_height,
        }
    }
}

/// Everything one rewrite run needs.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub flavor: GcodeFlavor,
    pub input: PathBuf,
    pub output: PathBuf,
    pub toolchange_template: PathBuf,
    pub periodic_colors: Vec<PeriodicColorRule>,
    pub replacement_colors: Vec<ReplacementColorRule>,
    pub line_ending: LineEnding,
    pub app_name: String,
    pub app_version: String,
}

impl Configuration {
    pub fn new<P: Into<PathBuf>>(input: P, output: P, toolchange_template: P) -> Self {
        Self {
            flavor: GcodeFlavor::default(),
            input: input.into(),
            output: output.into(),
            toolchange_template: toolchange_template.into(),
            periodic_colors: Vec::new(),
            replacement_colors: Vec::new(),
            line_ending: LineEnding::Auto,
            app_name: APP_NAME.to_string(),
            app_version: crate::VERSION.to_string(),
        }
    }

    pub fn with_periodic_colors(mut self, rules: Vec<PeriodicColorRule>) -> Self {
        self.periodic_colors = rules;
        self
    }

    pub fn with_replacement_colors(mut self, rules: Vec<ReplacementColorRule>) -> Self {
        self.replacement_colors = rules;
        self
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    pub fn with_options(mut self, options: &UserOptions) -> Self {
        self.periodic_colors = options.periodic_colors();
        self.replacement_colors = options.replacement_colors();
        self
    }

    /// Check rule invariants before a run.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.periodic_colors {
            if rule.period.is_nan() || rule.period <= 0.0 {
                return Err(GcodeError::InvalidConfig(format!(
                    "periodic color period must be > 0, got {}",
                    rule.period
                )));
            }
            if rule.band_thickness > rule.period {
                tracing::warn!(
                    "periodic color band thickness {} exceeds period {}",
                    rule.band_thickness,
                    rule.period
                );
            }
        }
        Ok(())
    }
}

/// Replacement color entry of an options file, in real-world elevations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementColorOption {
    pub color_index: usize,
    pub original_color_index: usize,
    pub real_world_elevation_start: f64,
    pub real_world_elevation_end: f64,
}

/// User options file contents.
///
/// Heights are given in real-world units and converted to model heights
/// through the model scale and sea-level base thickness.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserOptions {
    pub model_to_real_world_default_units: f64,
    pub model_one_to_n_vertical_scale: f64,
    pub model_sea_level_base_thickness: f64,

    pub real_world_isoline_elevation_interval: Option<f64>,
    pub real_world_isoline_elevation_start: Option<f64>,
    pub real_world_isoline_elevation_end: Option<f64>,
    pub model_isoline_height: Option<f64>,
    pub isoline_color_index: Option<usize>,
    #[serde(default)]
    pub isoline_color_feature_types: Vec<String>,

    #[serde(default)]
    pub replacement_color_at_heights: Vec<ReplacementColorOption>,
}

impl UserOptions {
    /// Load options from a JSON file. Anything but a JSON object is rejected.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = open_file(path)?;
        let value: serde_json::Value = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| GcodeError::Options(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| GcodeError::Options(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(GcodeError::Options("top level is not a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| GcodeError::Options(e.to_string()))
    }

    /// Real-world elevation to model height, measured from the build plate.
    fn model_height(&self, elevation: f64) -> f64 {
        self.model_sea_level_base_thickness + self.model_scaled(elevation)
    }

    /// Real-world distance to model distance.
    fn model_scaled(&self, distance: f64) -> f64 {
        self.model_to_real_world_default_units * distance / self.model_one_to_n_vertical_scale
    }

    pub fn periodic_colors(&self) -> Vec<PeriodicColorRule> {
        let (Some(interval), Some(start), Some(end), Some(height), Some(color)) = (
            self.real_world_isoline_elevation_interval,
            self.real_world_isoline_elevation_start,
            self.real_world_isoline_elevation_end,
            self.model_isoline_height,
            self.isoline_color_index,
        ) else {
            return Vec::new();
        };
        // the band end is not offset by the base thickness
        vec![PeriodicColorRule::new(
            color,
            self.model_height(start),
            self.model_scaled(end),
            height,
            self.model_scaled(interval),
        )
        .with_enabled_features(self.isoline_color_feature_types.iter().cloned())]
    }

    pub fn replacement_colors(&self) -> Vec<ReplacementColorRule> {
        self.replacement_color_at_heights
            .iter()
            .map(|rc| {
                ReplacementColorRule::new(
                    rc.color_index,
                    rc.original_color_index,
                    self.model_height(rc.real_world_elevation_start),
                    self.model_height(rc.real_world_elevation_end),
                )
            })
            .collect()
    }
}

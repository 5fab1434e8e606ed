//! Per-section alignment settings and the immutable snapshot handed to a task.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::affine::AffineMatrix;

pub const DEFAULT_WINDOW_SCALE: f64 = 0.8125;
pub const DEFAULT_WHITENING: f64 = -0.68;
pub const DEFAULT_ITERATIONS: u32 = 3;
pub const DEFAULT_MANUAL_WINDOW_SCALE: f64 = 0.125;
/// Largest whitening magnitude the matcher accepts.
pub const WHITENING_LIMIT: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Method {
    #[default]
    Grid,
    ManualHint,
    ManualStrict,
}

impl Method {
    pub fn is_manual(&self) -> bool {
        matches!(self, Method::ManualHint | Method::ManualStrict)
    }
}

/// Manual correspondences in normalized image coordinates (0..1 on both axes),
/// so one set of points serves every scale level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualPoints {
    #[serde(default)]
    pub reference: Vec<[f64; 2]>,
    #[serde(default)]
    pub moving: Vec<[f64; 2]>,
}

impl ManualPoints {
    /// Number of usable pairs (both sides present).
    pub fn pair_count(&self) -> usize {
        self.reference.len().min(self.moving.len())
    }
}

/// Editable settings of one section at one scale level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelSettings {
    pub method: Method,
    /// Single window side as a fraction of the image extent.
    pub window_scale_1x1: f64,
    /// Quadrant window side as a fraction of half the image extent.
    pub window_scale_2x2: f64,
    /// Manual window side as a fraction of the image width.
    pub manual_window_scale: f64,
    pub whitening: f64,
    pub iterations: u32,
    /// Enabled quadrants, in order top-left, top-right, bottom-left, bottom-right.
    pub quadrants: [bool; 4],
    pub manual_points: ManualPoints,
}

impl Default for LevelSettings {
    fn default() -> Self {
        Self {
            method: Method::Grid,
            window_scale_1x1: DEFAULT_WINDOW_SCALE,
            window_scale_2x2: DEFAULT_WINDOW_SCALE,
            manual_window_scale: DEFAULT_MANUAL_WINDOW_SCALE,
            whitening: DEFAULT_WHITENING,
            iterations: DEFAULT_ITERATIONS,
            quadrants: [true; 4],
            manual_points: ManualPoints::default(),
        }
    }
}

impl LevelSettings {
    /// Rejects values the matcher cannot run with. Checked before any task is built.
    pub fn validate(&self) -> SettingsResult<()> {
        check_fraction("window_scale_1x1", self.window_scale_1x1)?;
        check_fraction("window_scale_2x2", self.window_scale_2x2)?;
        check_fraction("manual_window_scale", self.manual_window_scale)?;
        if !(self.whitening >= -WHITENING_LIMIT && self.whitening <= WHITENING_LIMIT) {
            return Err(SettingsError::OutOfRange {
                field: "whitening",
                range: "[-5, 5]",
                value: self.whitening,
            });
        }
        if self.iterations == 0 {
            return Err(SettingsError::OutOfRange {
                field: "iterations",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        Ok(())
    }
}

fn check_fraction(field: &'static str, value: f64) -> SettingsResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            range: "(0, 1]",
            value,
        })
    }
}

/// Everything a task needs to align one section, frozen at dispatch time.
///
/// Every field takes part in the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub index: usize,
    pub scale: u32,
    pub name: String,
    pub image: PathBuf,
    /// `None` for the anchor section.
    pub reference_image: Option<PathBuf>,
    pub reference_index: Option<usize>,
    pub image_size: [u32; 2],
    pub level: LevelSettings,
    pub is_refinement: bool,
    pub initial_affine: AffineMatrix,
}

impl TaskSettings {
    /// True when there is nothing to register against.
    pub fn is_self_reference(&self) -> bool {
        match &self.reference_image {
            None => true,
            Some(reference) => reference == &self.image || reference.as_os_str().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_settings_are_valid() {
        assert_eq!(LevelSettings::default().validate(), Ok(()));
    }

    #[test]
    fn test_level_settings_rejects_out_of_range_values() {
        let cases = [
            LevelSettings {
                window_scale_1x1: 0.0,
                ..Default::default()
            },
            LevelSettings {
                window_scale_2x2: 1.5,
                ..Default::default()
            },
            LevelSettings {
                manual_window_scale: f64::NAN,
                ..Default::default()
            },
            LevelSettings {
                whitening: -7.0,
                ..Default::default()
            },
            LevelSettings {
                iterations: 0,
                ..Default::default()
            },
        ];
        let fields: Vec<&str> = cases
            .iter()
            .map(|level| match level.validate() {
                Err(SettingsError::OutOfRange { field, .. }) => field,
                Ok(()) => "ok",
            })
            .collect();
        assert_eq!(
            fields,
            [
                "window_scale_1x1",
                "window_scale_2x2",
                "manual_window_scale",
                "whitening",
                "iterations"
            ]
        );
    }
}

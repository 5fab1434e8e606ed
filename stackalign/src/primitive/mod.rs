//! Seam to the pixel-level registration kernels.
//!
//! The kernels are black boxes: a windowed cross-correlation matcher and an
//! affine least-squares solver. [`SwimMirPrimitive`] drives the external
//! `swim` / `mir` executables.

mod swim;

pub use swim::{parse_mir_output, parse_swim_line, SwimMirPrimitive};

use std::path::PathBuf;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::affine::{AffineMatrix, PointPair};

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    /// No usable correlation. Recovered by the caller, never a task failure.
    #[error("Degenerate match: {0}")]
    Degenerate(String),
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status:?}: {stderr}")]
    Exit {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Malformed output from {program}: {detail}")]
    Malformed { program: String, detail: String },
}

impl PrimitiveError {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, PrimitiveError::Degenerate(_))
    }
}

pub type PrimitiveResult<T> = Result<T, PrimitiveError>;

/// One correlation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRequest {
    pub reference_image: PathBuf,
    pub moving_image: PathBuf,
    /// Window side lengths in pixels.
    pub size: [u32; 2],
    /// Window center in the reference image.
    pub stationary: DVec2,
    /// Predicted location of `stationary` in the moving image.
    pub moving: DVec2,
    /// Offset of a grid window from the image center, when the window is one of
    /// the fixed grid cells.
    pub grid_offset: Option<[i32; 2]>,
    pub guess: AffineMatrix,
    pub whitening: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMatch {
    pub stationary: DVec2,
    /// Refined location of `stationary` in the moving image.
    pub matched: DVec2,
    /// Raw shift reported by the matcher.
    pub displacement: DVec2,
    pub snr: f64,
    pub raw: String,
}

impl WindowMatch {
    pub fn pair(&self) -> PointPair {
        PointPair {
            moving: self.matched,
            stationary: self.stationary,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffineSolve {
    pub affine: AffineMatrix,
    pub raw: String,
}

/// Black-box registration kernels. Both calls block.
pub trait RegistrationPrimitive: Send + Sync {
    /// Matches every window, one result per request in request order.
    fn match_windows(&self, requests: &[WindowRequest]) -> PrimitiveResult<Vec<WindowMatch>>;

    /// Best-fit affine carrying each `moving` point onto its `stationary` point.
    fn solve_affine(&self, pairs: &[PointPair]) -> PrimitiveResult<AffineSolve>;
}

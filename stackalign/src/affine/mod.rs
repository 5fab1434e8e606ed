//! 2x3 affine transforms between section coordinate frames.
//!
//! An [`AffineMatrix`] `[[a, c, e], [b, d, f]]` maps a point of a moving section
//! into the frame of its reference section:
//!
//! ```text
//! | x' |   | a  c  e | | x |
//! | y' | = | b  d  f | | y |
//!                      | 1 |
//! ```
//!
//! Arithmetic goes through [`glam::DAffine2`]; the 2x3 array is the stored and
//! serialized form.

#[cfg(test)]
mod tests;

use glam::{DAffine2, DMat2, DVec2};
use nalgebra::{DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};

/// Determinants below this magnitude are treated as singular.
pub const SINGULAR_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AffineError {
    #[error("Affine must be 2x3, got {rows} rows with column counts {cols:?}")]
    Shape { rows: usize, cols: Vec<usize> },
    #[error("Affine contains a non-finite value")]
    NonFinite,
}

pub type AffineResult<T> = Result<T, AffineError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>")]
pub struct AffineMatrix(pub [[f64; 3]; 2]);

/// Scalar components of an affine, as produced by [`AffineMatrix::decompose`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineComponents {
    /// Radians.
    pub rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub skew_x: f64,
    pub tx: f64,
    pub ty: f64,
    /// Diagnostic only; not used to rebuild the affine.
    pub determinant: f64,
}

/// One correspondence: `moving` in the moving section lands on `stationary`
/// in the reference section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPair {
    pub moving: DVec2,
    pub stationary: DVec2,
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineMatrix {
    pub const IDENTITY: Self = Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    pub fn translation(t: DVec2) -> Self {
        Self([[1.0, 0.0, t.x], [0.0, 1.0, t.y]])
    }

    pub fn rotation(angle: f64) -> Self {
        let (sin_a, cos_a) = angle.sin_cos();
        Self([[cos_a, -sin_a, 0.0], [sin_a, cos_a, 0.0]])
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self([[sx, 0.0, 0.0], [0.0, sy, 0.0]])
    }

    pub fn skew_x(k: f64) -> Self {
        Self([[1.0, k, 0.0], [0.0, 1.0, 0.0]])
    }

    /// Builds skew, then scale, then rotation, then translation, each applied
    /// after the previous one.
    pub fn from_components(skew_x: f64, scale: DVec2, rotation: f64, t: DVec2) -> Self {
        Self::skew_x(skew_x)
            .then(&Self::scale(scale.x, scale.y))
            .then(&Self::rotation(rotation))
            .then(&Self::translation(t))
    }

    pub fn to_glam(&self) -> DAffine2 {
        let [[a, c, e], [b, d, f]] = self.0;
        DAffine2::from_mat2_translation(
            DMat2::from_cols(DVec2::new(a, b), DVec2::new(c, d)),
            DVec2::new(e, f),
        )
    }

    pub fn from_glam(affine: DAffine2) -> Self {
        let m = affine.matrix2;
        let t = affine.translation;
        Self([[m.x_axis.x, m.y_axis.x, t.x], [m.x_axis.y, m.y_axis.y, t.y]])
    }

    /// `compose(a, b)`: the transform that applies `a` first, then `b`.
    pub fn compose(a: &Self, b: &Self) -> Self {
        Self::from_glam(b.to_glam() * a.to_glam())
    }

    /// Applies `self`, then `next`.
    pub fn then(&self, next: &Self) -> Self {
        Self::compose(self, next)
    }

    /// Returns `None` when the linear part is singular.
    pub fn invert(&self) -> Option<Self> {
        if self.determinant().abs() < SINGULAR_EPSILON {
            return None;
        }
        Some(Self::from_glam(self.to_glam().inverse()))
    }

    pub fn apply_point(&self, p: DVec2) -> DVec2 {
        self.to_glam().transform_point2(p)
    }

    pub fn translation_part(&self) -> DVec2 {
        DVec2::new(self.0[0][2], self.0[1][2])
    }

    pub fn with_translation(mut self, t: DVec2) -> Self {
        self.0[0][2] = t.x;
        self.0[1][2] = t.y;
        self
    }

    pub fn determinant(&self) -> f64 {
        let [[a, c, _], [b, d, _]] = self.0;
        a * d - c * b
    }

    pub fn decompose(&self) -> AffineComponents {
        let [[a00, a01, a02], [a10, a11, a12]] = self.0;
        let rotation = a10.atan2(a00);
        let (sin_r, cos_r) = rotation.sin_cos();
        let scale_x = (a00 * a00 + a10 * a10).sqrt();
        let scale_y = a11 * cos_r - a01 * sin_r;
        let skew_x = (a01 * cos_r + a11 * sin_r) / scale_y;

        AffineComponents {
            rotation,
            scale_x,
            scale_y,
            skew_x,
            tx: a02,
            ty: a12,
            determinant: self.determinant(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }

    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Row-major `[a, c, e, b, d, f]`.
    pub fn to_flat(&self) -> [f64; 6] {
        let [[a, c, e], [b, d, f]] = self.0;
        [a, c, e, b, d, f]
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.0.iter().map(|row| row.to_vec()).collect()
    }
}

impl TryFrom<Vec<Vec<f64>>> for AffineMatrix {
    type Error = AffineError;

    fn try_from(rows: Vec<Vec<f64>>) -> AffineResult<Self> {
        if rows.len() != 2 || rows.iter().any(|row| row.len() != 3) {
            return Err(AffineError::Shape {
                rows: rows.len(),
                cols: rows.iter().map(Vec::len).collect(),
            });
        }
        let matrix = Self([
            [rows[0][0], rows[0][1], rows[0][2]],
            [rows[1][0], rows[1][1], rows[1][2]],
        ]);
        if !matrix.is_finite() {
            return Err(AffineError::NonFinite);
        }
        Ok(matrix)
    }
}

impl std::fmt::Display for AffineMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [[a, c, tx], [b, d, ty]] = self.0;
        write!(f, "[[{a:.6}, {c:.6}, {tx:.3}], [{b:.6}, {d:.6}, {ty:.3}]]")
    }
}

/// Least-squares affine mapping every `moving` point onto its `stationary` point.
///
/// Needs at least three non-collinear pairs; returns `None` otherwise.
pub fn fit_affine(pairs: &[PointPair]) -> Option<AffineMatrix> {
    if pairs.len() < 3 {
        return None;
    }

    // Two independent systems sharing the design matrix [mx my 1].
    let n = pairs.len();
    let design = DMatrix::from_fn(n, 3, |r, c| match c {
        0 => pairs[r].moving.x,
        1 => pairs[r].moving.y,
        _ => 1.0,
    });
    let target_x = DVector::from_iterator(n, pairs.iter().map(|p| p.stationary.x));
    let target_y = DVector::from_iterator(n, pairs.iter().map(|p| p.stationary.y));

    let svd = SVD::new(design, true, true);
    let rank = svd.rank(1e-9 * svd.singular_values.max().max(1.0));
    if rank < 3 {
        return None;
    }
    let row_x = svd.solve(&target_x, 1e-12).ok()?;
    let row_y = svd.solve(&target_y, 1e-12).ok()?;

    let affine = AffineMatrix([
        [row_x[0], row_x[1], row_x[2]],
        [row_y[0], row_y[1], row_y[2]],
    ]);
    affine.is_finite().then_some(affine)
}

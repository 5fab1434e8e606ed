use std::path::PathBuf;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, warn};

use super::windows::Window;
use crate::affine::{AffineMatrix, PointPair};
use crate::primitive::{PrimitiveError, PrimitiveResult, RegistrationPrimitive, WindowRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum IngredientKind {
    /// Affine solved straight from the supplied correspondences.
    ManualSolve,
    /// One centered window; only the translation is updated.
    SingleWindow,
    /// One window per enabled quadrant, full affine solve.
    QuadWindow,
    /// One window per manual correspondence, full affine solve.
    ManualRefine,
}

/// Images and matcher parameters shared by every ingredient of a recipe.
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub reference_image: PathBuf,
    pub moving_image: PathBuf,
    pub whitening: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone)]
pub struct Ingredient {
    pub kind: IngredientKind,
    pub windows: Vec<Window>,
    pub correspondences: Vec<PointPair>,
    /// Set after execution.
    pub affine: Option<AffineMatrix>,
    pub snr: Vec<f64>,
    pub degenerate: bool,
    pub raw: Vec<String>,
}

impl Ingredient {
    pub fn new(kind: IngredientKind, windows: Vec<Window>, correspondences: Vec<PointPair>) -> Self {
        Self {
            kind,
            windows,
            correspondences,
            affine: None,
            snr: Vec::new(),
            degenerate: false,
            raw: Vec::new(),
        }
    }

    /// Runs this step seeded with `current` and returns the affine for the next step.
    ///
    /// A degenerate match keeps `current` and records zero quality; any other
    /// primitive failure is returned to the caller.
    pub fn execute(
        &mut self,
        current: AffineMatrix,
        ctx: &MatchContext,
        primitive: &dyn RegistrationPrimitive,
    ) -> PrimitiveResult<AffineMatrix> {
        let result = match self.kind {
            IngredientKind::ManualSolve => self.solve_correspondences(primitive),
            IngredientKind::SingleWindow => self.match_translation(current, ctx, primitive),
            IngredientKind::QuadWindow | IngredientKind::ManualRefine => {
                self.match_affine(current, ctx, primitive)
            }
        };

        let affine = match result {
            Ok(affine) if affine.is_finite() => affine,
            Ok(affine) => {
                warn!(kind = %self.kind, %affine, "non-finite affine, keeping previous");
                self.mark_degenerate();
                current
            }
            Err(PrimitiveError::Degenerate(reason)) => {
                debug!(kind = %self.kind, %reason, "degenerate match, keeping previous affine");
                self.raw.push(format!("degenerate: {reason}"));
                self.mark_degenerate();
                current
            }
            Err(err) => return Err(err),
        };

        self.affine = Some(affine);
        Ok(affine)
    }

    fn mark_degenerate(&mut self) {
        self.degenerate = true;
        self.snr = vec![0.0; self.windows.len().max(1)];
    }

    fn solve_correspondences(
        &mut self,
        primitive: &dyn RegistrationPrimitive,
    ) -> PrimitiveResult<AffineMatrix> {
        let solve = primitive.solve_affine(&self.correspondences)?;
        self.raw.push(solve.raw);
        Ok(solve.affine)
    }

    fn requests(&self, current: &AffineMatrix, ctx: &MatchContext) -> PrimitiveResult<Vec<WindowRequest>> {
        let inverse = current
            .invert()
            .ok_or_else(|| PrimitiveError::Degenerate("singular seed affine".into()))?;

        Ok(self
            .windows
            .iter()
            .map(|window| WindowRequest {
                reference_image: ctx.reference_image.clone(),
                moving_image: ctx.moving_image.clone(),
                size: window.size,
                stationary: window.center,
                moving: inverse.apply_point(window.center),
                grid_offset: window.grid_offset,
                guess: *current,
                whitening: ctx.whitening,
                iterations: ctx.iterations,
            })
            .collect())
    }

    fn match_translation(
        &mut self,
        current: AffineMatrix,
        ctx: &MatchContext,
        primitive: &dyn RegistrationPrimitive,
    ) -> PrimitiveResult<AffineMatrix> {
        let requests = self.requests(&current, ctx)?;
        let matches = primitive.match_windows(&requests)?;
        let Some(found) = matches.first() else {
            return Err(PrimitiveError::Degenerate("no window result".into()));
        };

        self.snr = vec![found.snr];
        self.raw.push(found.raw.clone());

        // Residual between where the match lands and the window center.
        let shift: DVec2 = found.stationary - current.apply_point(found.matched);
        Ok(current.with_translation(current.translation_part() + shift))
    }

    fn match_affine(
        &mut self,
        current: AffineMatrix,
        ctx: &MatchContext,
        primitive: &dyn RegistrationPrimitive,
    ) -> PrimitiveResult<AffineMatrix> {
        if self.windows.len() < 3 {
            return Err(PrimitiveError::Degenerate(format!(
                "{} windows, need 3 for an affine",
                self.windows.len()
            )));
        }
        let requests = self.requests(&current, ctx)?;
        let matches = primitive.match_windows(&requests)?;

        self.snr = matches.iter().map(|m| m.snr).collect();
        self.raw.extend(matches.iter().map(|m| m.raw.clone()));

        let pairs: Vec<PointPair> = matches.iter().map(|m| m.pair()).collect();
        let solve = primitive.solve_affine(&pairs)?;
        self.raw.push(solve.raw);
        Ok(solve.affine)
    }
}

//! Alignment recipes: an ordered list of refinement steps for one section pair.
//!
//! Each [`Ingredient`] is seeded with the affine produced by the one before it.
//! The ingredient list is fixed by the section's method:
//!
//! | method                     | ingredients                               |
//! |----------------------------|-------------------------------------------|
//! | grid, first pass           | single window, quad window, quad window   |
//! | grid, refining coarser     | quad window                               |
//! | manual hint                | manual solve, manual refine, manual refine|
//! | manual strict              | manual solve                              |
//!
//! A recipe owns all of its state and touches nothing shared, so any number of
//! them can run side by side.

mod ingredient;
pub mod windows;

#[cfg(test)]
mod tests;

pub use ingredient::{Ingredient, IngredientKind, MatchContext};
pub use windows::Window;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::affine::{AffineMatrix, PointPair};
use crate::primitive::{PrimitiveResult, RegistrationPrimitive};
use crate::settings::{Method, TaskSettings};

/// Manual methods need this many correspondences.
pub const MIN_MANUAL_POINTS: usize = 3;

/// Summary of the per-window SNRs of the last ingredient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnrReport {
    pub mean: f64,
    pub stddev: f64,
    pub count: usize,
    pub min: f64,
    pub max: f64,
}

impl SnrReport {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            stddev: variance.sqrt(),
            count: values.len(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeOutcome {
    pub affine: AffineMatrix,
    pub snr: Vec<f64>,
    pub report: SnrReport,
    pub tokens: Vec<String>,
    /// False when the recipe could not run at all (e.g. too few manual points).
    pub complete: bool,
}

pub fn ingredient_plan(method: Method, is_refinement: bool) -> Vec<IngredientKind> {
    use IngredientKind::*;
    match (method, is_refinement) {
        (Method::Grid, false) => vec![SingleWindow, QuadWindow, QuadWindow],
        (Method::Grid, true) => vec![QuadWindow],
        (Method::ManualHint, _) => vec![ManualSolve, ManualRefine, ManualRefine],
        (Method::ManualStrict, _) => vec![ManualSolve],
    }
}

#[derive(Debug)]
pub struct Recipe {
    settings: TaskSettings,
    ingredients: Vec<Ingredient>,
    affine: AffineMatrix,
}

impl Recipe {
    pub fn new(settings: &TaskSettings) -> Self {
        let size = settings.image_size;
        let level = &settings.level;

        let manual = windows::manual_pixels(&level.manual_points, size);
        let manual_size = windows::manual_window_size(size, level);
        let correspondences: Vec<PointPair> = manual
            .iter()
            .map(|&(stationary, moving)| PointPair { moving, stationary })
            .collect();

        let ingredients = ingredient_plan(level.method, settings.is_refinement)
            .into_iter()
            .map(|kind| match kind {
                IngredientKind::SingleWindow => {
                    Ingredient::new(kind, vec![windows::single_window(size, level)], Vec::new())
                }
                IngredientKind::QuadWindow => {
                    Ingredient::new(kind, windows::quad_windows(size, level), Vec::new())
                }
                IngredientKind::ManualSolve => Ingredient::new(
                    kind,
                    Vec::new(),
                    correspondences.clone(),
                ),
                IngredientKind::ManualRefine => {
                    let windows = manual
                        .iter()
                        .map(|&(center, _)| Window {
                            center,
                            size: manual_size,
                            grid_offset: None,
                        })
                        .collect();
                    Ingredient::new(kind, windows, Vec::new())
                }
            })
            .collect();

        Self {
            settings: settings.clone(),
            ingredients,
            affine: settings.initial_affine,
        }
    }

    pub fn ingredients(&self) -> &[Ingredient] {
        &self.ingredients
    }

    pub fn execute(&mut self, primitive: &dyn RegistrationPrimitive) -> PrimitiveResult<RecipeOutcome> {
        let settings = &self.settings;

        let reference_image = match &settings.reference_image {
            Some(reference) if !settings.is_self_reference() => reference.clone(),
            _ => {
                debug!(index = settings.index, "no distinct reference, identity result");
                return Ok(RecipeOutcome {
                    affine: AffineMatrix::identity(),
                    snr: Vec::new(),
                    report: SnrReport::default(),
                    tokens: vec!["self-reference".into()],
                    complete: true,
                });
            }
        };

        if settings.level.method.is_manual()
            && settings.level.manual_points.pair_count() < MIN_MANUAL_POINTS
        {
            info!(
                index = settings.index,
                points = settings.level.manual_points.pair_count(),
                "not enough manual correspondences"
            );
            return Ok(RecipeOutcome {
                affine: self.affine,
                snr: Vec::new(),
                report: SnrReport::default(),
                tokens: vec![format!(
                    "manual alignment needs {MIN_MANUAL_POINTS} correspondences"
                )],
                complete: false,
            });
        }

        let ctx = MatchContext {
            reference_image,
            moving_image: settings.image.clone(),
            whitening: settings.level.whitening,
            iterations: settings.level.iterations,
        };

        let mut tokens = Vec::new();
        for (i, ingredient) in self.ingredients.iter_mut().enumerate() {
            self.affine = ingredient.execute(self.affine, &ctx, primitive)?;
            let report = SnrReport::from_values(&ingredient.snr);
            tokens.push(format!(
                "{i}:{} snr={:.3} windows={} degenerate={}",
                ingredient.kind,
                report.mean,
                ingredient.windows.len(),
                ingredient.degenerate
            ));
        }

        let snr = self
            .ingredients
            .last()
            .map(|last| last.snr.clone())
            .unwrap_or_default();
        if let Some(last) = self.ingredients.last() {
            tokens.extend(last.raw.iter().cloned());
        }

        Ok(RecipeOutcome {
            affine: self.affine,
            report: SnrReport::from_values(&snr),
            snr,
            tokens,
            complete: true,
        })
    }
}

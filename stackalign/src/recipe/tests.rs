use std::sync::atomic::Ordering;

use glam::DVec2;

use super::*;
use crate::primitive::PrimitiveError;
use crate::settings::{LevelSettings, ManualPoints};
use crate::test_utils::{image_path, task_settings, SyntheticPrimitive};

fn truth() -> AffineMatrix {
    AffineMatrix([[1.01, 0.02, 5.0], [-0.015, 0.995, -3.0]])
}

fn manual_level(method: Method, pairs: usize) -> LevelSettings {
    let reference = [[0.25, 0.25], [0.75, 0.25], [0.5, 0.75], [0.3, 0.6]];
    LevelSettings {
        method,
        manual_points: ManualPoints {
            reference: reference[..pairs].to_vec(),
            // Moving points sit 10px further right at 1024px.
            moving: reference[..pairs]
                .iter()
                .map(|p| [p[0] + 10.0 / 1024.0, p[1]])
                .collect(),
        },
        ..Default::default()
    }
}

#[test]
fn test_ingredient_plan() {
    use IngredientKind::*;
    assert_eq!(
        ingredient_plan(Method::Grid, false),
        vec![SingleWindow, QuadWindow, QuadWindow]
    );
    assert_eq!(ingredient_plan(Method::Grid, true), vec![QuadWindow]);
    assert_eq!(
        ingredient_plan(Method::ManualHint, false),
        vec![ManualSolve, ManualRefine, ManualRefine]
    );
    assert_eq!(ingredient_plan(Method::ManualStrict, true), vec![ManualSolve]);
}

#[test]
fn test_grid_recipe_recovers_affine() {
    let settings = task_settings(1, LevelSettings::default());
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 1), truth());

    let mut recipe = Recipe::new(&settings);
    assert_eq!(recipe.ingredients().len(), 3);
    let outcome = recipe.execute(&primitive).unwrap();

    assert!(outcome.complete);
    assert!(outcome.affine.approx_eq(&truth(), 1e-9), "{}", outcome.affine);
    assert_eq!(outcome.snr.len(), 4);
    assert_eq!(outcome.report.count, 4);
    assert_eq!(outcome.report.mean, crate::test_utils::SYNTHETIC_SNR);
    assert!(outcome.tokens[0].starts_with("0:single_window"));
}

#[test]
fn test_single_window_updates_translation_only() {
    let settings = task_settings(1, LevelSettings::default());
    let shift = AffineMatrix::translation(DVec2::new(7.0, -4.0));
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 1), shift);

    let mut recipe = Recipe::new(&settings);
    recipe.execute(&primitive).unwrap();
    let single = &recipe.ingredients()[0];
    assert_eq!(single.kind, IngredientKind::SingleWindow);
    assert!(single.affine.unwrap().approx_eq(&shift, 1e-9));
}

#[test]
fn test_refinement_runs_single_quad_step() {
    let mut settings = task_settings(2, LevelSettings::default());
    settings.is_refinement = true;
    settings.initial_affine = AffineMatrix::translation(DVec2::new(4.0, -2.0));
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 2), truth());

    let mut recipe = Recipe::new(&settings);
    let outcome = recipe.execute(&primitive).unwrap();
    assert_eq!(recipe.ingredients().len(), 1);
    assert!(outcome.affine.approx_eq(&truth(), 1e-9));
    assert_eq!(primitive.match_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_manual_strict_uses_correspondences_only() {
    let settings = task_settings(1, manual_level(Method::ManualStrict, 3));
    // The truth disagrees with the correspondences; strict never matches windows.
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 1), truth());

    let outcome = Recipe::new(&settings).execute(&primitive).unwrap();
    assert!(outcome.complete);
    let expected = AffineMatrix::translation(DVec2::new(-10.0, 0.0));
    assert!(outcome.affine.approx_eq(&expected, 1e-9), "{}", outcome.affine);
    assert_eq!(primitive.match_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_manual_hint_refines_with_windows() {
    let settings = task_settings(1, manual_level(Method::ManualHint, 4));
    let actual = AffineMatrix::translation(DVec2::new(-12.0, 2.0));
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 1), actual);

    let mut recipe = Recipe::new(&settings);
    let outcome = recipe.execute(&primitive).unwrap();
    assert!(outcome.affine.approx_eq(&actual, 1e-9), "{}", outcome.affine);
    assert_eq!(recipe.ingredients()[1].windows.len(), 4);
    assert!(recipe.ingredients()[1]
        .windows
        .iter()
        .all(|w| w.size == [128, 128]));
}

#[test]
fn test_too_few_manual_points_is_incomplete() {
    let mut settings = task_settings(1, manual_level(Method::ManualHint, 2));
    settings.initial_affine = AffineMatrix::translation(DVec2::new(1.0, 1.0));
    let primitive = SyntheticPrimitive::new();

    let outcome = Recipe::new(&settings).execute(&primitive).unwrap();
    assert!(!outcome.complete);
    assert_eq!(outcome.affine, settings.initial_affine);
    assert_eq!(primitive.solve_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_degenerate_matches_keep_previous_affine() {
    let mut settings = task_settings(1, LevelSettings::default());
    settings.initial_affine = AffineMatrix::translation(DVec2::new(3.0, 0.0));
    let primitive = SyntheticPrimitive::new().with_degenerate(image_path(1, 1));

    let mut recipe = Recipe::new(&settings);
    let outcome = recipe.execute(&primitive).unwrap();
    assert!(outcome.complete);
    assert_eq!(outcome.affine, settings.initial_affine);
    assert_eq!(outcome.snr, vec![0.0; 4]);
    assert!(recipe.ingredients().iter().all(|i| i.degenerate));
}

#[test]
fn test_too_few_quadrants_keeps_translation() {
    let level = LevelSettings {
        quadrants: [true, true, false, false],
        ..Default::default()
    };
    let settings = task_settings(1, level);
    let shift = AffineMatrix::translation(DVec2::new(-6.0, 9.0));
    let primitive = SyntheticPrimitive::new().with_truth(image_path(1, 1), shift);

    let mut recipe = Recipe::new(&settings);
    let outcome = recipe.execute(&primitive).unwrap();
    assert!(outcome.affine.approx_eq(&shift, 1e-9));
    assert!(!recipe.ingredients()[0].degenerate);
    assert!(recipe.ingredients()[1].degenerate);
}

#[test]
fn test_kernel_failure_propagates() {
    let settings = task_settings(1, LevelSettings::default());
    let primitive = SyntheticPrimitive::new().with_failing(image_path(1, 1));

    let err = Recipe::new(&settings).execute(&primitive).unwrap_err();
    assert!(matches!(err, PrimitiveError::Exit { status: Some(139), .. }));
}

#[test]
fn test_self_reference_is_identity() {
    let mut settings = task_settings(0, LevelSettings::default());
    settings.initial_affine = AffineMatrix::translation(DVec2::new(5.0, 5.0));
    let primitive = SyntheticPrimitive::new();

    let outcome = Recipe::new(&settings).execute(&primitive).unwrap();
    assert!(outcome.complete);
    assert_eq!(outcome.affine, AffineMatrix::identity());
    assert_eq!(primitive.match_calls.load(Ordering::SeqCst), 0);

    settings.reference_image = Some(settings.image.clone());
    let outcome = Recipe::new(&settings).execute(&primitive).unwrap();
    assert_eq!(outcome.affine, AffineMatrix::identity());
}

#[test]
fn test_snr_report() {
    let report = SnrReport::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    assert_eq!(report.mean, 5.0);
    assert_eq!(report.stddev, 2.0);
    assert_eq!(report.min, 2.0);
    assert_eq!(report.max, 9.0);
    assert_eq!(SnrReport::from_values(&[]), SnrReport::default());
}

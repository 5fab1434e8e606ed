use super::*;
use std::f64::consts::PI;

const TOL: f64 = 1e-9;

fn sample_affines() -> Vec<AffineMatrix> {
    vec![
        AffineMatrix::identity(),
        AffineMatrix::translation(DVec2::new(12.5, -3.0)),
        AffineMatrix::rotation(0.3),
        AffineMatrix([[1.02, 0.03, 5.0], [-0.01, 0.98, -7.5]]),
        AffineMatrix([[0.5, -1.2, 100.0], [0.8, 0.9, 42.0]]),
    ]
}

#[test]
fn test_compose_with_identity_is_noop() {
    let id = AffineMatrix::identity();
    for a in sample_affines() {
        assert!(AffineMatrix::compose(&id, &a).approx_eq(&a, TOL));
        assert!(AffineMatrix::compose(&a, &id).approx_eq(&a, TOL));
    }
}

#[test]
fn test_compose_with_inverse_is_identity() {
    for a in sample_affines() {
        let inv = a.invert().unwrap();
        let round = AffineMatrix::compose(&a, &inv);
        assert!(
            round.approx_eq(&AffineMatrix::identity(), 1e-9),
            "Expected identity, got {}",
            round
        );
    }
}

#[test]
fn test_compose_applies_first_argument_first() {
    let shift = AffineMatrix::translation(DVec2::new(10.0, 0.0));
    let turn = AffineMatrix::rotation(PI / 2.0);
    let p = DVec2::new(1.0, 0.0);

    // shift then rotate: (11, 0) -> (0, 11)
    let shift_then_turn = AffineMatrix::compose(&shift, &turn).apply_point(p);
    assert!((shift_then_turn - DVec2::new(0.0, 11.0)).length() < TOL);

    // rotate then shift: (0, 1) -> (10, 1)
    let turn_then_shift = AffineMatrix::compose(&turn, &shift).apply_point(p);
    assert!((turn_then_shift - DVec2::new(10.0, 1.0)).length() < TOL);
}

#[test]
fn test_apply_point_matches_matrix_form() {
    let a = AffineMatrix([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    let p = a.apply_point(DVec2::new(-1.0, 2.0));
    assert_eq!(p, DVec2::new(1.0 * -1.0 + 2.0 * 2.0 + 3.0, 4.0 * -1.0 + 5.0 * 2.0 + 6.0));
}

#[test]
fn test_invert_singular_returns_none() {
    let singular = AffineMatrix([[1.0, 2.0, 0.0], [2.0, 4.0, 0.0]]);
    assert!(singular.invert().is_none());
}

#[test]
fn test_decompose_pure_parts() {
    let c = AffineMatrix::rotation(0.25).decompose();
    assert!((c.rotation - 0.25).abs() < TOL);
    assert!((c.scale_x - 1.0).abs() < TOL);
    assert!((c.scale_y - 1.0).abs() < TOL);
    assert!(c.skew_x.abs() < TOL);

    let c = AffineMatrix::scale(2.0, 0.5).decompose();
    assert!((c.scale_x - 2.0).abs() < TOL);
    assert!((c.scale_y - 0.5).abs() < TOL);
    assert!((c.determinant - 1.0).abs() < TOL);

    let c = AffineMatrix::translation(DVec2::new(3.0, -4.0)).decompose();
    assert_eq!((c.tx, c.ty), (3.0, -4.0));
}

#[test]
fn test_decompose_skew_matches_formula() {
    let a = AffineMatrix([[1.0, 0.2, 0.0], [0.0, 1.0, 0.0]]);
    let c = a.decompose();
    assert!(c.rotation.abs() < TOL);
    assert!((c.skew_x - 0.2).abs() < TOL);
}

#[test]
fn test_from_components_order() {
    // Skew applied first, so it is not scaled into the translation.
    let a = AffineMatrix::from_components(
        0.1,
        DVec2::new(2.0, 3.0),
        0.0,
        DVec2::new(5.0, 6.0),
    );
    assert!(a.approx_eq(&AffineMatrix([[2.0, 0.2, 5.0], [0.0, 3.0, 6.0]]), TOL));
}

#[test]
fn test_try_from_rejects_bad_shape() {
    let ok: Vec<Vec<f64>> = vec![vec![1.0, 0.0, 2.0], vec![0.0, 1.0, 3.0]];
    assert_eq!(
        AffineMatrix::try_from(ok).unwrap(),
        AffineMatrix::translation(DVec2::new(2.0, 3.0))
    );

    let three_rows = vec![vec![1.0, 0.0, 0.0]; 3];
    assert!(matches!(
        AffineMatrix::try_from(three_rows),
        Err(AffineError::Shape { rows: 3, .. })
    ));

    let short_row = vec![vec![1.0, 0.0], vec![0.0, 1.0, 0.0]];
    assert!(AffineMatrix::try_from(short_row).is_err());

    let nan = vec![vec![f64::NAN, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
    assert_eq!(AffineMatrix::try_from(nan), Err(AffineError::NonFinite));
}

#[test]
fn test_deserialize_validates_shape() {
    let parsed: AffineMatrix = serde_json::from_str("[[1,0,4],[0,1,5]]").unwrap();
    assert_eq!(parsed.translation_part(), DVec2::new(4.0, 5.0));
    assert!(serde_json::from_str::<AffineMatrix>("[[1,0],[0,1]]").is_err());

    let text = serde_json::to_string(&parsed).unwrap();
    assert_eq!(text, "[[1.0,0.0,4.0],[0.0,1.0,5.0]]");
}

#[test]
fn test_fit_affine_recovers_exact_transform() {
    let truth = AffineMatrix([[1.01, 0.02, 14.0], [-0.03, 0.99, -6.0]]);
    let pairs: Vec<PointPair> = [
        DVec2::new(100.0, 100.0),
        DVec2::new(900.0, 120.0),
        DVec2::new(110.0, 880.0),
        DVec2::new(870.0, 910.0),
    ]
    .into_iter()
    .map(|moving| PointPair {
        moving,
        stationary: truth.apply_point(moving),
    })
    .collect();

    let fitted = fit_affine(&pairs).unwrap();
    assert!(fitted.approx_eq(&truth, 1e-6), "Expected {}, got {}", truth, fitted);
}

#[test]
fn test_fit_affine_degenerate_inputs() {
    let collinear: Vec<PointPair> = (0..4)
        .map(|i| {
            let p = DVec2::new(i as f64, 2.0 * i as f64);
            PointPair {
                moving: p,
                stationary: p,
            }
        })
        .collect();
    assert!(fit_affine(&collinear).is_none());
    assert!(fit_affine(&collinear[..2]).is_none());
}

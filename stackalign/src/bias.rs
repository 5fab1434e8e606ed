//! Removal of index-correlated drift from the cumulative chain.
//!
//! Every cumulative affine is decomposed into six scalars (skew, two scales,
//! rotation, two translations). Each scalar is fitted with a least-squares
//! polynomial over section index. The value at index 0 is the stack's offset,
//! the rest is drift. The chain is then rebuilt from the pairwise affines with a
//! per-section correction that cancels the drift's slope at that section:
//!
//! ```text
//! correction(i) = skew(-d) . scale(1 - d) . rotation(-d) . translation(-d)
//! ```
//!
//! where `d` is the drift derivative of the matching component at `i`. The fit
//! and rebuild run exactly twice; the second fit only adds drift terms.

use glam::DVec2;
use nalgebra::{DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::{debug, info};

use crate::affine::{AffineComponents, AffineMatrix};
use crate::config::BiasConfig;
use crate::cumulative::ChainLink;

pub const BIAS_PASSES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    SkewX,
    ScaleX,
    ScaleY,
    Rotation,
    TranslationX,
    TranslationY,
}

impl Component {
    pub fn value(&self, c: &AffineComponents) -> f64 {
        match self {
            Component::SkewX => c.skew_x,
            Component::ScaleX => c.scale_x,
            Component::ScaleY => c.scale_y,
            Component::Rotation => c.rotation,
            Component::TranslationX => c.tx,
            Component::TranslationY => c.ty,
        }
    }
}

/// Polynomial in the normalized variable `t = (x - center) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub center: f64,
    pub scale: f64,
    /// Ascending powers of `t`.
    pub coeffs: Vec<f64>,
}

impl Polynomial {
    /// Least-squares fit of degree `min(degree, n - 1)`; `None` without samples.
    pub fn fit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Self> {
        let n = xs.len().min(ys.len());
        if n == 0 {
            return None;
        }
        let degree = degree.min(n - 1);

        let center = xs.iter().sum::<f64>() / n as f64;
        let half_range = xs
            .iter()
            .map(|x| (x - center).abs())
            .fold(0.0_f64, f64::max);
        let scale = if half_range > 0.0 { half_range } else { 1.0 };

        let design = DMatrix::from_fn(n, degree + 1, |r, c| {
            ((xs[r] - center) / scale).powi(c as i32)
        });
        let target = DVector::from_column_slice(&ys[..n]);
        let svd = SVD::new(design, true, true);
        let solution = svd.solve(&target, 1e-12).ok()?;

        Some(Self {
            center,
            scale,
            coeffs: solution.iter().copied().collect(),
        })
    }

    fn t(&self, x: f64) -> f64 {
        (x - self.center) / self.scale
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = self.t(x);
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * t + c)
    }

    /// Derivative with respect to `x`.
    pub fn derivative(&self, x: f64) -> f64 {
        let t = self.t(x);
        let dt: f64 = self
            .coeffs
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, c)| acc * t + k as f64 * c);
        dt / self.scale
    }
}

/// Offset plus accumulated drift terms for one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiasFunc {
    /// Fitted value at index 0 from the first pass.
    pub offset: f64,
    /// Every term contributes `p(x) - p(0)`.
    pub drift: Vec<Polynomial>,
}

impl BiasFunc {
    pub fn drift_at(&self, x: f64) -> f64 {
        self.drift.iter().map(|p| p.eval(x) - p.eval(0.0)).sum()
    }

    pub fn slope_at(&self, x: f64) -> f64 {
        self.drift.iter().map(|p| p.derivative(x)).sum()
    }
}

/// One [`BiasFunc`] per [`Component`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiasModel {
    pub skew_x: BiasFunc,
    pub scale_x: BiasFunc,
    pub scale_y: BiasFunc,
    pub rotation: BiasFunc,
    pub translation_x: BiasFunc,
    pub translation_y: BiasFunc,
}

impl BiasModel {
    pub fn func(&self, component: Component) -> &BiasFunc {
        match component {
            Component::SkewX => &self.skew_x,
            Component::ScaleX => &self.scale_x,
            Component::ScaleY => &self.scale_y,
            Component::Rotation => &self.rotation,
            Component::TranslationX => &self.translation_x,
            Component::TranslationY => &self.translation_y,
        }
    }

    fn func_mut(&mut self, component: Component) -> &mut BiasFunc {
        match component {
            Component::SkewX => &mut self.skew_x,
            Component::ScaleX => &mut self.scale_x,
            Component::ScaleY => &mut self.scale_y,
            Component::Rotation => &mut self.rotation,
            Component::TranslationX => &mut self.translation_x,
            Component::TranslationY => &mut self.translation_y,
        }
    }

    /// Fits every component over `links`. The first fit sets the offsets; later
    /// fits only add drift.
    pub fn fit(&mut self, links: &[ChainLink], degree: usize, first: bool) {
        let xs: Vec<f64> = links.iter().map(|l| l.index as f64).collect();
        let decomposed: Vec<AffineComponents> =
            links.iter().map(|l| l.cumulative.decompose()).collect();

        for component in Component::iter() {
            let ys: Vec<f64> = decomposed.iter().map(|c| component.value(c)).collect();
            let Some(poly) = Polynomial::fit(&xs, &ys, degree) else {
                continue;
            };
            let func = self.func_mut(component);
            if first {
                func.offset = poly.eval(0.0);
            }
            func.drift.push(poly);
        }
    }

    /// Correction cancelling the drift slope at section `x`.
    pub fn correction(&self, x: f64) -> AffineMatrix {
        AffineMatrix::from_components(
            -self.skew_x.slope_at(x),
            DVec2::new(1.0 - self.scale_x.slope_at(x), 1.0 - self.scale_y.slope_at(x)),
            -self.rotation.slope_at(x),
            DVec2::new(
                -self.translation_x.slope_at(x),
                -self.translation_y.slope_at(x),
            ),
        )
    }

    /// Correction cancelling the fitted offsets.
    pub fn initial_correction(&self) -> AffineMatrix {
        AffineMatrix::from_components(
            -self.skew_x.offset,
            DVec2::new(1.0 / self.scale_x.offset, 1.0 / self.scale_y.offset),
            -self.rotation.offset,
            DVec2::new(-self.translation_x.offset, -self.translation_y.offset),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasReport {
    pub model: BiasModel,
    pub initial_correction: AffineMatrix,
    /// Per-section correction, indexed like the chain.
    pub corrections: Vec<AffineMatrix>,
}

/// Rebuilds the cumulative chain from the pairwise affines with drift removed.
///
/// Links without a reference keep their cumulative affine, or start from the
/// initial correction when `recenter` is set. Excluded links still inherit
/// their reference's cumulative affine unchanged. Returns `None` for chains too
/// short to fit.
pub fn detrend(links: &mut [ChainLink], config: &BiasConfig) -> Option<BiasReport> {
    if links.len() < 2 {
        debug!(len = links.len(), "chain too short for bias fit");
        return None;
    }

    let mut model = BiasModel::default();
    model.fit(links, config.poly_order, true);
    let initial_correction = model.initial_correction();
    let mut corrections = Vec::new();

    for pass in 0..BIAS_PASSES {
        corrections = links
            .iter()
            .map(|l| model.correction(l.index as f64))
            .collect();
        rebuild(links, &corrections, config.recenter.then_some(initial_correction));
        if pass + 1 < BIAS_PASSES {
            model.fit(links, config.poly_order, false);
        }
    }

    let last = links.last().map_or(0.0, |l| l.index as f64);
    info!(
        sections = links.len(),
        drift_x = model.translation_x.drift_at(last),
        drift_y = model.translation_y.drift_at(last),
        "bias removed"
    );

    Some(BiasReport {
        model,
        initial_correction,
        corrections,
    })
}

fn rebuild(links: &mut [ChainLink], corrections: &[AffineMatrix], seed: Option<AffineMatrix>) {
    for i in 0..links.len() {
        let cumulative = match links[i].reference {
            None => match seed {
                Some(seed) if links[i].include => AffineMatrix::compose(&links[i].pairwise, &seed),
                Some(seed) => seed,
                None => links[i].cumulative,
            },
            Some(r) if !links[i].include => links[r].cumulative,
            Some(r) => {
                // Sections skipped between r and i still drift; correct each step.
                let mut c = AffineMatrix::compose(&links[i].pairwise, &links[r].cumulative);
                for correction in &corrections[r + 1..=i] {
                    c = AffineMatrix::compose(&c, correction);
                }
                c
            }
        };
        links[i].cumulative = cumulative;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cumulative::compose_chain;

    fn chain(pairwise: &[AffineMatrix]) -> Vec<ChainLink> {
        let mut links: Vec<ChainLink> = pairwise
            .iter()
            .enumerate()
            .map(|(i, p)| ChainLink::new(i, i.checked_sub(1), true, *p))
            .collect();
        compose_chain(&mut links);
        links
    }

    fn shift(x: f64, y: f64) -> AffineMatrix {
        AffineMatrix::translation(DVec2::new(x, y))
    }

    #[test]
    fn test_polynomial_fit_recovers_cubic() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 - 0.5 * x + 0.01 * x * x * x).collect();
        let p = Polynomial::fit(&xs, &ys, 4).unwrap();
        for x in [0.0, 7.5, 19.0] {
            let expected = 2.0 - 0.5 * x + 0.01 * x * x * x;
            assert!((p.eval(x) - expected).abs() < 1e-8, "at {x}: {}", p.eval(x));
            let slope = -0.5 + 0.03 * x * x;
            assert!((p.derivative(x) - slope).abs() < 1e-8);
        }
    }

    #[test]
    fn test_polynomial_degree_capped_by_samples() {
        let p = Polynomial::fit(&[3.0], &[7.0], 4).unwrap();
        assert_eq!(p.coeffs.len(), 1);
        assert_eq!(p.eval(100.0), 7.0);
        assert_eq!(p.derivative(100.0), 0.0);
        assert!(Polynomial::fit(&[], &[], 4).is_none());
    }

    #[test]
    fn test_linear_translation_drift_is_removed() {
        let mut pairwise = vec![shift(1.0, 0.0); 5];
        pairwise[0] = AffineMatrix::identity();
        let mut links = chain(&pairwise);
        assert_eq!(links[4].cumulative.translation_part(), DVec2::new(4.0, 0.0));

        let report = detrend(&mut links, &BiasConfig::default()).unwrap();
        for link in &links {
            let t = link.cumulative.translation_part();
            assert!(t.length() < 1e-6, "section {}: {}", link.index, t);
            assert!(link.cumulative.approx_eq(&AffineMatrix::identity(), 1e-6));
        }
        assert!((report.model.translation_x.slope_at(2.0) - 1.0).abs() < 1e-6);
        assert!(report.model.translation_x.offset.abs() < 1e-6);
    }

    #[test]
    fn test_no_drift_is_left_unchanged() {
        let mut links = chain(&[AffineMatrix::identity(); 6]);
        let before = links.clone();
        detrend(&mut links, &BiasConfig::default()).unwrap();
        for (a, b) in links.iter().zip(&before) {
            assert!(a.cumulative.approx_eq(&b.cumulative, 1e-9));
        }
    }

    #[test]
    fn test_identical_offset_chain_is_left_unchanged() {
        let offset = AffineMatrix([[1.02, 0.01, 15.0], [-0.01, 0.97, -4.0]]);
        let mut links: Vec<ChainLink> = (0..5)
            .map(|i| {
                let mut link = ChainLink::new(
                    i,
                    i.checked_sub(1),
                    true,
                    AffineMatrix::identity(),
                );
                link.cumulative = offset;
                link
            })
            .collect();
        detrend(&mut links, &BiasConfig::default()).unwrap();
        for link in &links {
            assert!(
                link.cumulative.approx_eq(&offset, 1e-9),
                "section {}: {}",
                link.index,
                link.cumulative
            );
        }
    }

    #[test]
    fn test_excluded_sections_still_inherit() {
        let mut pairwise = vec![shift(2.0, -1.0); 6];
        pairwise[0] = AffineMatrix::identity();
        let mut links = chain(&pairwise);
        links[3].include = false;
        links[4].reference = Some(2);
        compose_chain(&mut links);

        detrend(&mut links, &BiasConfig::default()).unwrap();
        assert_eq!(links[3].cumulative, links[2].cumulative);
        assert_eq!(links[3].pairwise, AffineMatrix::identity());
    }

    #[test]
    fn test_recenter_seeds_anchor_with_initial_correction() {
        let mut pairwise = vec![shift(1.0, 0.0); 4];
        pairwise[0] = AffineMatrix::identity();
        let mut links = chain(&pairwise);
        let config = BiasConfig {
            recenter: true,
            ..Default::default()
        };
        let report = detrend(&mut links, &config).unwrap();
        assert!(report
            .initial_correction
            .approx_eq(&AffineMatrix::identity(), 1e-6));
        assert!(links[0]
            .cumulative
            .approx_eq(&report.initial_correction, 1e-9));
    }

    #[test]
    fn test_short_chain_is_skipped() {
        let mut links = chain(&[AffineMatrix::identity()]);
        assert!(detrend(&mut links, &BiasConfig::default()).is_none());
    }
}

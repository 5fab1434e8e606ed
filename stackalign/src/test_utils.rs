//! Synthetic registration kernels and stack fixtures for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::affine::{fit_affine, AffineMatrix, PointPair};
use crate::primitive::{
    AffineSolve, PrimitiveError, PrimitiveResult, RegistrationPrimitive, WindowMatch,
    WindowRequest,
};
use crate::settings::{LevelSettings, TaskSettings};
use crate::stack::{LevelData, Section, Stack};

pub const SYNTHETIC_SNR: f64 = 20.0;

/// Matches windows against a known ground-truth affine per moving image.
///
/// Images without a registered truth align with identity.
#[derive(Debug, Default)]
pub struct SyntheticPrimitive {
    truth: HashMap<PathBuf, AffineMatrix>,
    degenerate: HashSet<PathBuf>,
    failing: HashSet<PathBuf>,
    pub match_calls: AtomicUsize,
    pub solve_calls: AtomicUsize,
}

impl SyntheticPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_truth(mut self, moving: impl Into<PathBuf>, affine: AffineMatrix) -> Self {
        self.truth.insert(moving.into(), affine);
        self
    }

    /// Every window of `moving` fails to correlate.
    pub fn with_degenerate(mut self, moving: impl Into<PathBuf>) -> Self {
        self.degenerate.insert(moving.into());
        self
    }

    /// Every window of `moving` fails like a crashed kernel.
    pub fn with_failing(mut self, moving: impl Into<PathBuf>) -> Self {
        self.failing.insert(moving.into());
        self
    }

    fn truth(&self, moving: &Path) -> AffineMatrix {
        self.truth.get(moving).copied().unwrap_or_default()
    }
}

impl RegistrationPrimitive for SyntheticPrimitive {
    fn match_windows(&self, requests: &[WindowRequest]) -> PrimitiveResult<Vec<WindowMatch>> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        requests
            .iter()
            .map(|request| {
                if self.failing.contains(&request.moving_image) {
                    return Err(PrimitiveError::Exit {
                        program: "synthetic".into(),
                        status: Some(139),
                        stderr: "segmentation fault".into(),
                    });
                }
                if self.degenerate.contains(&request.moving_image) {
                    return Err(PrimitiveError::Degenerate("flat correlation".into()));
                }
                let inverse = self
                    .truth(&request.moving_image)
                    .invert()
                    .ok_or_else(|| PrimitiveError::Degenerate("singular truth".into()))?;
                let matched = inverse.apply_point(request.stationary);
                Ok(WindowMatch {
                    stationary: request.stationary,
                    matched,
                    displacement: matched - request.moving,
                    snr: SYNTHETIC_SNR,
                    raw: format!(
                        "{SYNTHETIC_SNR}: {} {} {}",
                        request.reference_image.display(),
                        request.stationary,
                        matched
                    ),
                })
            })
            .collect()
    }

    fn solve_affine(&self, pairs: &[PointPair]) -> PrimitiveResult<AffineSolve> {
        self.solve_calls.fetch_add(1, Ordering::SeqCst);
        let affine = fit_affine(pairs)
            .ok_or_else(|| PrimitiveError::Degenerate(format!("{} pairs", pairs.len())))?;
        Ok(AffineSolve {
            raw: format!("AI {affine}"),
            affine,
        })
    }
}

pub const IMAGE_SIZE: u32 = 1024;

pub fn image_path(scale: u32, index: usize) -> PathBuf {
    PathBuf::from(format!("/stack/scale_{scale}/s{index:03}.tif"))
}

pub fn task_settings(index: usize, level: LevelSettings) -> TaskSettings {
    TaskSettings {
        index,
        scale: 1,
        name: format!("s{index:03}.tif"),
        image: image_path(1, index),
        reference_image: index.checked_sub(1).map(|r| image_path(1, r)),
        reference_index: index.checked_sub(1),
        image_size: [IMAGE_SIZE, IMAGE_SIZE],
        level,
        is_refinement: false,
        initial_affine: AffineMatrix::identity(),
    }
}

/// `n` included sections, each present at every scale in `scales`.
pub fn synthetic_stack(n: usize, scales: &[u32]) -> Stack {
    let sections = (0..n)
        .map(|index| Section {
            name: format!("s{index:03}.tif"),
            include: true,
            levels: scales
                .iter()
                .map(|&scale| {
                    (
                        scale,
                        LevelData {
                            image: image_path(scale, index),
                            image_size: [IMAGE_SIZE / scale, IMAGE_SIZE / scale],
                            settings: LevelSettings::default(),
                            results: None,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        })
        .collect();

    Stack {
        name: "synthetic".into(),
        sections,
        ..Default::default()
    }
}

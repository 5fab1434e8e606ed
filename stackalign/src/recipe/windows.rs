//! Window placement for the grid and manual ingredients.

use glam::DVec2;

use crate::settings::{LevelSettings, ManualPoints};

/// One correlation window in reference-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub center: DVec2,
    pub size: [u32; 2],
    /// Offset from the image center for grid windows.
    pub grid_offset: Option<[i32; 2]>,
}

/// Rounds to the nearest integer, bumping odd values up to the next even one.
pub fn ensure_even(value: f64) -> u32 {
    let n = value.round().max(0.0) as u32;
    n + (n % 2)
}

fn image_center(image_size: [u32; 2]) -> DVec2 {
    DVec2::new((image_size[0] / 2) as f64, (image_size[1] / 2) as f64)
}

fn grid_window(center: DVec2, size: [u32; 2], image_size: [u32; 2]) -> Window {
    let c = image_center(image_size);
    Window {
        center,
        size,
        grid_offset: Some([(center.x - c.x) as i32, (center.y - c.y) as i32]),
    }
}

pub fn single_window_size(image_size: [u32; 2], level: &LevelSettings) -> [u32; 2] {
    [
        ensure_even(image_size[0] as f64 * level.window_scale_1x1),
        ensure_even(image_size[1] as f64 * level.window_scale_1x1),
    ]
}

pub fn quad_window_size(image_size: [u32; 2], level: &LevelSettings) -> [u32; 2] {
    [
        ensure_even(image_size[0] as f64 / 2.0 * level.window_scale_2x2),
        ensure_even(image_size[1] as f64 / 2.0 * level.window_scale_2x2),
    ]
}

/// The single window covering the image center.
pub fn single_window(image_size: [u32; 2], level: &LevelSettings) -> Window {
    grid_window(
        image_center(image_size),
        single_window_size(image_size, level),
        image_size,
    )
}

/// Quadrant windows, top-left, top-right, bottom-left, bottom-right, with
/// disabled quadrants left out.
///
/// Centers sit half a quadrant window inside the single window's border so the
/// four windows tile the same region.
pub fn quad_windows(image_size: [u32; 2], level: &LevelSettings) -> Vec<Window> {
    let [w, h] = [image_size[0] as f64, image_size[1] as f64];
    let single = single_window_size(image_size, level);
    let quad = quad_window_size(image_size, level);

    let x1 = ((w - single[0] as f64) / 2.0 + quad[0] as f64 / 2.0).trunc();
    let x2 = (w - x1).trunc();
    let y1 = ((h - single[1] as f64) / 2.0 + quad[1] as f64 / 2.0).trunc();
    let y2 = (h - y1).trunc();

    [(x1, y1), (x2, y1), (x1, y2), (x2, y2)]
        .into_iter()
        .zip(level.quadrants)
        .filter(|(_, enabled)| *enabled)
        .map(|((x, y), _)| grid_window(DVec2::new(x, y), quad, image_size))
        .collect()
}

/// Square window side for manual windows.
pub fn manual_window_size(image_size: [u32; 2], level: &LevelSettings) -> [u32; 2] {
    let side = ensure_even(image_size[0] as f64 * level.manual_window_scale);
    [side, side]
}

/// Manual correspondences converted to pixels, `(reference, moving)` per pair.
pub fn manual_pixels(points: &ManualPoints, image_size: [u32; 2]) -> Vec<(DVec2, DVec2)> {
    let to_px = |p: &[f64; 2]| {
        DVec2::new(
            ensure_even(p[0] * image_size[0] as f64) as f64,
            ensure_even(p[1] * image_size[1] as f64) as f64,
        )
    };
    points
        .reference
        .iter()
        .zip(&points.moving)
        .map(|(r, m)| (to_px(r), to_px(m)))
        .collect()
}

//! Configuration types.
//!
//! All configuration structs live here; each has a `Default` matching the
//! values used in production runs and a `validate()`. Process configuration
//! panics on values no caller should ever construct; settings that travel with a
//! stack file return an error instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::{SettingsError, SettingsResult};

// =============================================================================
// Registration primitive
// =============================================================================

/// Locations of the external registration executables and the matcher
/// options shared by every window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveConfig {
    pub swim: PathBuf,
    pub mir: PathBuf,
    /// Suppress fixed-pattern noise within this many pixels of zero shift.
    pub clobber_fixed_noise: Option<u32>,
    /// Expected rotation between neighbouring sections, in degrees.
    pub initial_rotation: f64,
}

impl Default for PrimitiveConfig {
    fn default() -> Self {
        Self {
            swim: PathBuf::from("swim"),
            mir: PathBuf::from("mir"),
            clobber_fixed_noise: None,
            initial_rotation: 0.0,
        }
    }
}

// =============================================================================
// Task queue
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Cores left free for the driver and the OS.
    pub reserved_cores: usize,
    /// Upper bound on concurrent workers regardless of core count.
    pub max_workers: usize,
    /// Extra rounds granted to failed tasks. 0 disables retries.
    pub retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reserved_cores: 1,
            max_workers: 16,
            retries: 1,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) {
        assert!(self.max_workers >= 1, "max_workers must be at least 1");
    }

    /// Worker count for a batch of `n_tasks`: host cores minus the reserve,
    /// capped by `max_workers` and the batch size, never below one.
    pub fn worker_count(&self, n_tasks: usize) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores
            .saturating_sub(self.reserved_cores)
            .min(self.max_workers)
            .min(n_tasks)
            .max(1)
    }
}

// =============================================================================
// Bias detrending
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Remove index-correlated drift from the cumulative chain after aligning.
    pub null_bias: bool,
    /// Degree of the drift polynomials; lowered automatically for short stacks.
    pub poly_order: usize,
    /// Seed the anchor with the inverse of the fitted constant offsets, moving the
    /// whole stack so the fitted start of the chain sits at identity.
    pub recenter: bool,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            null_bias: true,
            poly_order: 4,
            recenter: false,
        }
    }
}

impl BiasConfig {
    pub const MAX_POLY_ORDER: usize = 8;

    pub fn validate(&self) -> SettingsResult<()> {
        if (1..=Self::MAX_POLY_ORDER).contains(&self.poly_order) {
            Ok(())
        } else {
            Err(SettingsError::OutOfRange {
                field: "poly_order",
                range: "[1, 8]",
                value: self.poly_order as f64,
            })
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Process-wide settings, loaded from a YAML or JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub primitive: PrimitiveConfig,
    pub queue: QueueConfig,
    /// Directory for durable cache entries. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    /// Directory for per-section results and bias diagnostics.
    pub output_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl EngineConfig {
    pub fn validate(&self) {
        self.queue.validate();
    }
}

/// Per-run options for [`crate::driver::AlignmentDriver::align`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignOptions {
    pub scale: u32,
    /// Recompute every section even when its fingerprint is cached.
    pub ignore_cache: bool,
    /// Inclusive index range; `None` aligns the whole stack.
    pub range: Option<(usize, usize)>,
}

impl AlignOptions {
    pub fn new(scale: u32) -> Self {
        Self {
            scale,
            ..Default::default()
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        match self.range {
            None => true,
            Some((start, end)) => (start..=end).contains(&index),
        }
    }
}

//! The ordered section stack and its per-level settings and results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::affine::AffineMatrix;
use crate::cache::Fingerprint;
use crate::config::BiasConfig;
use crate::recipe::SnrReport;
use crate::settings::{LevelSettings, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Stack file error")]
    File(#[from] common::FileFormatError),
    #[error("Scale {0} is not present in the stack")]
    UnknownScale(u32),
    #[error("Stack has no sections")]
    Empty,
    #[error("Invalid bias settings: {0}")]
    InvalidBias(#[source] SettingsError),
    #[error("Section {section} at scale {scale}: {source}")]
    InvalidSettings {
        section: String,
        scale: u32,
        #[source]
        source: SettingsError,
    },
}

pub type StackResult<T> = Result<T, StackError>;

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Results of the most recent successful alignment of one section at one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignResults {
    pub pairwise: AffineMatrix,
    pub cumulative: AffineMatrix,
    #[serde(default)]
    pub snr: Vec<f64>,
    #[serde(default)]
    pub snr_report: SnrReport,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelData {
    pub image: PathBuf,
    pub image_size: [u32; 2],
    #[serde(default)]
    pub settings: LevelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<AlignResults>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub include: bool,
    /// Keyed by downsampling factor; 1 is full resolution.
    pub levels: BTreeMap<u32, LevelData>,
}

impl Section {
    pub fn level(&self, scale: u32) -> Option<&LevelData> {
        self.levels.get(&scale)
    }

    pub fn level_mut(&mut self, scale: u32) -> Option<&mut LevelData> {
        self.levels.get_mut(&scale)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bias: BiasConfig,
    pub sections: Vec<Section>,
}

impl Stack {
    pub fn load(path: &Path) -> StackResult<Self> {
        let stack: Stack = common::load_file(path)?;
        if stack.sections.is_empty() {
            return Err(StackError::Empty);
        }
        stack.validate()?;
        Ok(stack)
    }

    /// Checks the bias settings and the settings of every section level.
    pub fn validate(&self) -> StackResult<()> {
        self.bias.validate().map_err(StackError::InvalidBias)?;
        for section in &self.sections {
            for (&scale, level) in &section.levels {
                level
                    .settings
                    .validate()
                    .map_err(|source| StackError::InvalidSettings {
                        section: section.name.clone(),
                        scale,
                        source,
                    })?;
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> StackResult<()> {
        common::save_file(path, self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// First included section. Its pairwise affine is always identity.
    pub fn anchor(&self) -> Option<usize> {
        self.sections.iter().position(|s| s.include)
    }

    /// Nearest earlier included section.
    pub fn reference_index(&self, index: usize) -> Option<usize> {
        self.sections[..index.min(self.sections.len())]
            .iter()
            .rposition(|s| s.include)
    }

    /// Every scale present in any section, coarsest first.
    pub fn scales(&self) -> Vec<u32> {
        let scales: BTreeSet<u32> = self
            .sections
            .iter()
            .flat_map(|s| s.levels.keys().copied())
            .collect();
        scales.into_iter().rev().collect()
    }

    /// Next coarser scale than `scale`, if the stack has one.
    pub fn coarser_scale(&self, scale: u32) -> Option<u32> {
        self.scales().into_iter().filter(|&s| s > scale).min()
    }

    pub fn ensure_scale(&self, scale: u32) -> StackResult<()> {
        if self.sections.iter().all(|s| s.levels.contains_key(&scale)) {
            Ok(())
        } else {
            Err(StackError::UnknownScale(scale))
        }
    }

    pub fn results(&self, index: usize, scale: u32) -> Option<&AlignResults> {
        self.sections
            .get(index)?
            .level(scale)?
            .results
            .as_ref()
    }
}

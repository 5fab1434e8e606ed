//! Content-addressed store of pairwise affines.
//!
//! Keys are fingerprints of a [`TaskSettings`] snapshot. Entries live in memory
//! and, when a directory is given, also as one JSON record per fingerprint so
//! they survive between runs. The cache has a single owner (the driver); workers
//! never see it.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::affine::AffineMatrix;
use crate::settings::TaskSettings;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize cache entry")]
    Serialize(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Stable hex digest of a settings snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can be turned into a cache key.
pub trait CacheKey {
    fn fingerprint(&self) -> Fingerprint;
}

impl CacheKey for Fingerprint {
    fn fingerprint(&self) -> Fingerprint {
        self.clone()
    }
}

impl CacheKey for TaskSettings {
    /// Serializes through `serde_json::Value`, whose maps keep keys sorted, so
    /// the digest depends only on field names and values.
    fn fingerprint(&self) -> Fingerprint {
        let canonical = serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| format!("{self:?}"));
        Fingerprint(common::fnv::hex_digest(&canonical))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    fingerprint: Fingerprint,
    affine: AffineMatrix,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: HashMap<Fingerprint, AffineMatrix>,
    dir: Option<PathBuf>,
}

impl ResultCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a durable cache rooted at `dir`, creating the directory.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            entries: HashMap::new(),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{fingerprint}.json")))
    }

    /// Reads an entry from disk. Unreadable or corrupt records count as misses.
    fn load(&self, fingerprint: &Fingerprint) -> Option<AffineMatrix> {
        let path = self.entry_path(fingerprint)?;
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheRecord>(&text) {
            Ok(record) if &record.fingerprint == fingerprint => Some(record.affine),
            Ok(record) => {
                warn!(
                    path = %path.display(),
                    stored = %record.fingerprint,
                    "cache record fingerprint mismatch, treating as miss"
                );
                None
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt cache record, treating as miss");
                None
            }
        }
    }

    pub fn haskey<K: CacheKey + ?Sized>(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn get<K: CacheKey + ?Sized>(&self, key: &K) -> Option<AffineMatrix> {
        let fingerprint = key.fingerprint();
        self.entries
            .get(&fingerprint)
            .copied()
            .or_else(|| self.load(&fingerprint))
    }

    /// Inserts or replaces the entry for `key`.
    pub fn put<K: CacheKey + ?Sized>(&mut self, key: &K, affine: AffineMatrix) -> CacheResult<()> {
        let fingerprint = key.fingerprint();
        if let Some(path) = self.entry_path(&fingerprint) {
            let record = CacheRecord {
                fingerprint: fingerprint.clone(),
                affine,
            };
            let text = serde_json::to_string_pretty(&record)?;
            std::fs::write(&path, text).map_err(|source| CacheError::Io { path, source })?;
        }
        debug!(%fingerprint, "cache put");
        self.entries.insert(fingerprint, affine);
        Ok(())
    }

    pub fn remove<K: CacheKey + ?Sized>(&mut self, key: &K) -> CacheResult<()> {
        let fingerprint = key.fingerprint();
        self.entries.remove(&fingerprint);
        if let Some(path) = self.entry_path(&fingerprint) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::Io { path, source }),
            }
        }
        Ok(())
    }

    /// Drops every entry, including durable records.
    pub fn clear(&mut self) -> CacheResult<usize> {
        let mut removed: usize = self.entries.len();
        self.entries.clear();
        if let Some(dir) = &self.dir {
            removed = 0;
            for path in self.record_paths()? {
                std::fs::remove_file(&path).map_err(|source| CacheError::Io { path, source })?;
                removed += 1;
            }
            debug!(dir = %dir.display(), removed, "cache cleared");
        }
        Ok(removed)
    }

    /// Number of entries, counting durable records when backed by a directory.
    pub fn len(&self) -> CacheResult<usize> {
        match &self.dir {
            Some(_) => Ok(self.record_paths()?.len()),
            None => Ok(self.entries.len()),
        }
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    fn record_paths(&self) -> CacheResult<Vec<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let io_err = |source| CacheError::Io {
            path: dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

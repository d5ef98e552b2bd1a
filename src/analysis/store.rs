//! Per-target model cache with lazy loading and hot swap.
//!
//! Scoring calls take the read lock just long enough to clone an `Arc` to the
//! artifact; `refresh()` builds replacements off-lock and swaps them in under
//! a short write lock. An in-flight scoring call keeps using the artifact it
//! cloned, so a swap never tears a score.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info};

use super::model::{ModelArtifact, ModelError};

#[derive(Debug, Clone)]
enum CacheEntry {
    Loaded(Arc<ModelArtifact>),
    Missing,
    /// Artifact present but unusable. `version` dedupes the error log.
    Rejected { reason: String, version: Option<u64> },
}

/// What the store knows about a target's model.
#[derive(Debug, Clone)]
pub enum ModelLookup {
    Model(Arc<ModelArtifact>),
    Missing,
    Rejected(String),
}

impl ModelLookup {
    pub fn is_model(&self) -> bool {
        matches!(self, ModelLookup::Model(_))
    }
}

pub struct ModelStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/model_<id>.json`, with anything outside `[A-Za-z0-9]` mapped to `_`.
    pub fn artifact_path(&self, target: &str) -> PathBuf {
        let safe: String = target
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("model_{}.json", safe))
    }

    /// Load artifacts for every target up front so startup logs show what
    /// each one will be scored with.
    pub fn preload<'a>(&self, targets: impl IntoIterator<Item = &'a str>) {
        for target in targets {
            match self.lookup(target) {
                ModelLookup::Model(m) => info!(
                    target = %target,
                    version = m.version,
                    kind = m.kind_name(),
                    "model loaded"
                ),
                ModelLookup::Missing => {
                    info!(target = %target, "no model artifact, using static thresholds")
                }
                ModelLookup::Rejected(_) => {}
            }
        }
    }

    /// Current model for `target`, loading it from disk on first use.
    pub fn lookup(&self, target: &str) -> ModelLookup {
        if let Some(entry) = self.cache.read().get(target) {
            return entry.clone().into();
        }

        let entry = self.read_entry(target, None);
        let mut cache = self.cache.write();
        // Another caller may have raced us to the first load.
        let entry = cache.entry(target.to_string()).or_insert(entry);
        entry.clone().into()
    }

    pub fn has_model(&self, target: &str) -> bool {
        self.lookup(target).is_model()
    }

    /// Cached entry only; never touches the disk. Unknown targets read as
    /// `Missing`.
    pub fn cached(&self, target: &str) -> ModelLookup {
        self.cache
            .read()
            .get(target)
            .cloned()
            .map_or(ModelLookup::Missing, Into::into)
    }

    /// Re-read every known target's artifact and swap in newer ones.
    ///
    /// Returns the number of targets whose entry changed.
    pub fn refresh(&self) -> usize {
        let known: Vec<(String, CacheEntry)> = self
            .cache
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut updates = Vec::new();
        for (target, current) in known {
            let previous_rejection = match &current {
                CacheEntry::Rejected { version, .. } => Some(*version),
                _ => None,
            };
            let fresh = self.read_entry(&target, previous_rejection);

            let replace = match (&current, &fresh) {
                (CacheEntry::Loaded(old), CacheEntry::Loaded(new)) => new.is_newer_than(old),
                // A bad new file does not evict a good loaded model.
                (CacheEntry::Loaded(_), CacheEntry::Rejected { .. }) => false,
                (CacheEntry::Loaded(_), CacheEntry::Missing) => true,
                (CacheEntry::Missing, CacheEntry::Missing) => false,
                (
                    CacheEntry::Rejected { version: a, .. },
                    CacheEntry::Rejected { version: b, .. },
                ) => a != b,
                _ => true,
            };
            if replace {
                match &fresh {
                    CacheEntry::Loaded(m) => info!(
                        target = %target,
                        version = m.version,
                        kind = m.kind_name(),
                        "model swapped in"
                    ),
                    CacheEntry::Missing => {
                        info!(target = %target, "model artifact removed, reverting to static thresholds")
                    }
                    CacheEntry::Rejected { .. } => {}
                }
                updates.push((target, fresh));
            }
        }

        let changed = updates.len();
        if changed > 0 {
            let mut cache = self.cache.write();
            for (target, entry) in updates {
                cache.insert(target, entry);
            }
        }
        changed
    }

    /// Read and validate one artifact. Rejections are logged unless the same
    /// artifact version was already rejected.
    fn read_entry(&self, target: &str, already_rejected: Option<Option<u64>>) -> CacheEntry {
        let path = self.artifact_path(target);
        if !path.exists() {
            return CacheEntry::Missing;
        }

        let (result, version) = match ModelArtifact::load(&path) {
            Ok(artifact) => {
                let version = Some(artifact.version);
                (artifact.validate(target).map(|_| artifact), version)
            }
            Err(e) => (Err(e), None),
        };

        match result {
            Ok(artifact) => CacheEntry::Loaded(Arc::new(artifact)),
            Err(e) => {
                if already_rejected != Some(version) {
                    log_rejection(target, &path, version, &e);
                }
                CacheEntry::Rejected {
                    reason: e.to_string(),
                    version,
                }
            }
        }
    }
}

fn log_rejection(target: &str, path: &Path, version: Option<u64>, e: &ModelError) {
    error!(
        target = %target,
        path = %path.display(),
        version = ?version,
        error = %e,
        "model artifact rejected, falling back to static thresholds"
    );
}

impl From<CacheEntry> for ModelLookup {
    fn from(entry: CacheEntry) -> Self {
        match entry {
            CacheEntry::Loaded(m) => ModelLookup::Model(m),
            CacheEntry::Missing => ModelLookup::Missing,
            CacheEntry::Rejected { reason, .. } => ModelLookup::Rejected(reason),
        }
    }
}

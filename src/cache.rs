//! Freshness cache deciding whether a repository needs re-analysis.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{FinalRecommendation, RepoId, RepositoryRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub repo: RepoId,
    pub last_analyzed_at: DateTime<Utc>,
    pub recommendation: FinalRecommendation,
}

/// Backing store for [`AnalysisCache`].
pub trait CacheStore: Send + Sync {
    fn get(&self, repo: &RepoId) -> Result<Option<CacheEntry>>;
    fn put(&self, entry: CacheEntry) -> Result<()>;
    fn entries(&self) -> Result<Vec<CacheEntry>>;
    /// Drop every entry, returning how many there were.
    fn clear(&self) -> Result<usize>;
}

/// In-process store, lost at exit.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<RepoId, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, repo: &RepoId) -> Result<Option<CacheEntry>> {
        Ok(lock(&self.entries).get(repo).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        lock(&self.entries).insert(entry.repo.clone(), entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    fn clear(&self) -> Result<usize> {
        let mut entries = lock(&self.entries);
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}

/// Flat JSON index file holding every entry.
///
/// The whole index is loaded on open and rewritten on each `put`, through a
/// temporary file renamed over the old one.
#[derive(Debug)]
pub struct JsonIndexStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl JsonIndexStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read cache index {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("cache index {} is corrupt", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace cache index {}", self.path.display()))?;
        Ok(())
    }
}

impl CacheStore for JsonIndexStore {
    fn get(&self, repo: &RepoId) -> Result<Option<CacheEntry>> {
        Ok(lock(&self.entries).get(&repo.to_string()).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(entry.repo.to_string(), entry);
        self.flush(&entries)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    /// Empties the index and deletes its file.
    fn clear(&self) -> Result<usize> {
        let mut entries = lock(&self.entries);
        let removed = entries.len();
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove cache index {}", self.path.display()))?;
        }
        entries.clear();
        Ok(removed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Skip policy over a [`CacheStore`].
#[derive(Clone)]
pub struct AnalysisCache {
    store: Arc<dyn CacheStore>,
}

impl AnalysisCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// Entry for `repo`, if any. A failing store reads as a miss.
    pub fn lookup(&self, repo: &RepositoryRef) -> Option<CacheEntry> {
        match self.store.get(&repo.id) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(repo = %repo.id, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Skip iff not forced, an entry exists, and the repository has not
    /// changed since it was analyzed.
    pub fn should_skip(&self, repo: &RepositoryRef, force: bool) -> bool {
        self.fresh_entry(repo, force).is_some()
    }

    /// The entry that lets `repo` be skipped, if any. Reads the store once.
    pub fn fresh_entry(&self, repo: &RepositoryRef, force: bool) -> Option<CacheEntry> {
        if force {
            return None;
        }
        self.lookup(repo)
            .filter(|entry| repo.updated_at <= entry.last_analyzed_at)
    }

    /// Record a successful analysis. Only called for jobs that reached Done.
    pub fn record(
        &self,
        repo: &RepositoryRef,
        recommendation: &FinalRecommendation,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.put(CacheEntry {
            repo: repo.id.clone(),
            last_analyzed_at: completed_at,
            recommendation: recommendation.clone(),
        })
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.store.entries()
    }

    pub fn clear(&self) -> Result<usize> {
        self.store.clear()
    }
}

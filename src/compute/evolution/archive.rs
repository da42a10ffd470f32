//! Pareto front of the search and checkpoint storage.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::schema::{EvolutionSnapshot, IndividualSnapshot};

use super::population::Individual;

// ============================================================================
// Pareto front
// ============================================================================

/// Non-dominated individuals under (error, complexity).
///
/// Members are ordered by ascending complexity, hence descending error.
/// Individuals with identical error and complexity are all kept. Members
/// that leave the front are parked in the old set until the next prune.
#[derive(Debug, Default)]
pub struct ParetoArchive {
    front: Vec<Arc<Individual>>,
    old: Vec<Arc<Individual>>,
    pending: Vec<Arc<Individual>>,
}

impl ParetoArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue evaluated individuals for the next recalculation. Diverged
    /// individuals are ignored.
    pub fn offer<I>(&mut self, individuals: I)
    where
        I: IntoIterator<Item = Arc<Individual>>,
    {
        self.pending
            .extend(individuals.into_iter().filter(|ind| ind.is_viable()));
    }

    /// Remove individuals replaced in their population from the front.
    pub fn retire(&mut self, replaced: &[Arc<Individual>]) {
        let ids: HashSet<u64> = replaced.iter().map(|ind| ind.id).collect();
        let (gone, kept): (Vec<_>, Vec<_>) = self
            .front
            .drain(..)
            .partition(|ind| ids.contains(&ind.id));
        self.front = kept;
        self.old.extend(gone);
    }

    /// Merge queued individuals into the front.
    pub fn recalculate(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let previous: HashSet<u64> = self.front.iter().map(|ind| ind.id).collect();

        let mut candidates: Vec<Arc<Individual>> = self.front.drain(..).collect();
        candidates.append(&mut self.pending);
        candidates.sort_by(|a, b| {
            a.error()
                .total_cmp(&b.error())
                .then(a.complexity.cmp(&b.complexity))
        });

        let mut kept: Vec<Arc<Individual>> = Vec::new();
        let mut min_complexity = usize::MAX;
        for ind in candidates {
            let duplicate = kept
                .last()
                .is_some_and(|last| last.error() == ind.error() && last.complexity == ind.complexity);
            if ind.complexity < min_complexity || duplicate {
                min_complexity = min_complexity.min(ind.complexity);
                kept.push(ind);
            } else if previous.contains(&ind.id) {
                self.old.push(ind);
            }
        }

        kept.reverse();
        self.front = kept;
    }

    /// Members by ascending complexity.
    pub fn front(&self) -> &[Arc<Individual>] {
        &self.front
    }

    pub fn old(&self) -> &[Arc<Individual>] {
        &self.old
    }

    /// Lowest-error member.
    pub fn best(&self) -> Option<&Arc<Individual>> {
        self.front.last()
    }

    pub fn len(&self) -> usize {
        self.front.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }

    /// Forget old members no live generation refers to.
    pub fn prune_old(&mut self, live: &HashSet<u64>) {
        self.old.retain(|ind| live.contains(&ind.id));
    }

    pub fn front_snapshot(&self) -> Vec<IndividualSnapshot> {
        self.front.iter().map(|ind| ind.snapshot()).collect()
    }

    pub fn old_snapshot(&self) -> Vec<IndividualSnapshot> {
        self.old.iter().map(|ind| ind.snapshot()).collect()
    }
}

// ============================================================================
// Checkpoint storage
// ============================================================================

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid checkpoint JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receives checkpoints of a running search.
pub trait EvolutionStore: Send {
    /// Persist a snapshot, replacing any earlier one of the same search.
    fn submit(&mut self, snapshot: &EvolutionSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot stored under `name`.
    fn load(&self, name: &str) -> Result<Option<EvolutionSnapshot>, StoreError>;
}

/// One pretty-printed JSON file per search in a directory, accumulating the
/// generation history of every checkpoint of the search.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Open a store, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl EvolutionStore for JsonDirStore {
    fn submit(&mut self, snapshot: &EvolutionSnapshot) -> Result<(), StoreError> {
        let path = self.path_for(&snapshot.name);
        let tmp = path.with_extension("json.tmp");

        // The engine prunes what it has handed over, so history accumulates
        // here. A finished file belongs to an earlier run and is replaced.
        let mut merged = snapshot.clone();
        if let Some(earlier) = self.load(&snapshot.name)?.filter(|e| !e.finished) {
            merged.merge_history(earlier);
        }
        let json = serde_json::to_string_pretty(&merged)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<EvolutionSnapshot>, StoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

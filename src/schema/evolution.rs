//! Evolution configuration and reporting types for the island model search.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{ConfigError, Genotype, SimParams};

/// Top-level configuration for a network model search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search name, also the key checkpoints are stored under.
    #[serde(default = "default_search_name")]
    pub name: String,
    /// Island layout and termination.
    #[serde(default)]
    pub islands: IslandConfig,
    /// Crossover and mutation rates.
    #[serde(default)]
    pub operators: OperatorConfig,
    /// Evaluation worker pool.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Checkpointing.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Error thresholds and integrator settings.
    #[serde(default)]
    pub sim: SimParams,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            name: default_search_name(),
            islands: IslandConfig::default(),
            operators: OperatorConfig::default(),
            evaluation: EvaluationConfig::default(),
            persistence: PersistenceConfig::default(),
            sim: SimParams::default(),
            random_seed: None,
        }
    }
}

fn default_search_name() -> String {
    "search".to_string()
}

/// Island model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IslandConfig {
    /// Number of independently evolving islands.
    #[serde(default = "default_n_islands")]
    pub n_islands: usize,
    /// Individuals per island, rounded up to an even number.
    #[serde(default = "default_island_size")]
    pub island_size: usize,
    /// Mean generation at which the search ends.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Generations without a new best before the search ends.
    #[serde(default = "default_max_generations_no_improvement")]
    pub max_generations_no_improvement: usize,
    /// Mean generations between migrations (0 disables migration).
    #[serde(default = "default_migration_period")]
    pub migration_period: usize,
}

impl IslandConfig {
    /// Island population size. Deterministic crowding works on pairs.
    pub fn population_size(&self) -> usize {
        self.island_size.next_multiple_of(2)
    }
}

impl Default for IslandConfig {
    fn default() -> Self {
        Self {
            n_islands: default_n_islands(),
            island_size: default_island_size(),
            max_generations: default_max_generations(),
            max_generations_no_improvement: default_max_generations_no_improvement(),
            migration_period: default_migration_period(),
        }
    }
}

fn default_n_islands() -> usize {
    4
}
fn default_island_size() -> usize {
    100
}
fn default_max_generations() -> usize {
    1000
}
fn default_max_generations_no_improvement() -> usize {
    250
}
fn default_migration_period() -> usize {
    20
}

/// Reproduction operator probabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Probability a parent pair is crossed rather than cloned.
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    /// Probability a label is taken from the first parent during crossover.
    #[serde(default = "default_node_cross_rate")]
    pub node_cross_rate: f64,
    /// Per-node probability of duplication.
    #[serde(default = "default_duplication_rate")]
    pub node_duplication_rate: f64,
    /// Per-node probability of removal (evolved nodes only).
    #[serde(default = "default_removal_rate")]
    pub node_removal_rate: f64,
    /// Per-edge probability of duplication.
    #[serde(default = "default_duplication_rate")]
    pub edge_duplication_rate: f64,
    /// Per-edge probability of removal.
    #[serde(default = "default_removal_rate")]
    pub edge_removal_rate: f64,
    /// Per-parameter probability of re-randomization.
    #[serde(default = "default_param_mutation_rate")]
    pub param_mutation_rate: f64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            crossover_rate: default_crossover_rate(),
            node_cross_rate: default_node_cross_rate(),
            node_duplication_rate: default_duplication_rate(),
            node_removal_rate: default_removal_rate(),
            edge_duplication_rate: default_duplication_rate(),
            edge_removal_rate: default_removal_rate(),
            param_mutation_rate: default_param_mutation_rate(),
        }
    }
}

fn default_crossover_rate() -> f64 {
    0.75
}
fn default_node_cross_rate() -> f64 {
    0.5
}
fn default_duplication_rate() -> f64 {
    0.01
}
fn default_removal_rate() -> f64 {
    0.015
}
fn default_param_mutation_rate() -> f64 {
    0.01
}

/// Evaluation worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvaluationConfig {
    /// Number of worker threads (0 = auto-detect).
    #[serde(default)]
    pub n_workers: usize,
}

impl EvaluationConfig {
    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.n_workers > 0 {
            self.n_workers
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

/// What each checkpoint contains, from least to most.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Nothing is persisted.
    None,
    /// The best individual.
    Best,
    /// The best individual and per-generation statistics.
    Evolution,
    /// Also the current and previous Pareto front members.
    #[default]
    ParetoFront,
    /// Also every individual of the retained generations.
    AllIndividuals,
}

/// Checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub policy: SavePolicy,
    /// Wall-clock seconds between checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            policy: SavePolicy::default(),
            checkpoint_interval_secs: default_checkpoint_interval(),
        }
    }
}

fn default_checkpoint_interval() -> u64 {
    3600
}

// ============================================================================
// Snapshots (for export and checkpoints)
// ============================================================================

/// Read-only copy of an individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualSnapshot {
    pub id: u64,
    /// Parent ids (for genealogy).
    pub parents: Vec<u64>,
    pub genotype: Genotype,
    /// Aggregate error, absent if not evaluated or diverged.
    pub error: Option<f64>,
    /// Complexity of the in-use subgraph.
    pub complexity: usize,
    #[serde(default)]
    pub diverged: bool,
    /// Wall-clock evaluation time in seconds.
    pub sim_time: f64,
}

/// Summary statistics of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationStats {
    pub min_error: Option<f64>,
    pub mean_error: Option<f64>,
    pub min_complexity: usize,
    pub mean_complexity: f64,
    /// Individuals whose simulation diverged.
    pub n_diverged: usize,
}

/// Read-only copy of a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub index: usize,
    /// Seconds since the search started.
    pub time_secs: f64,
    pub stats: GenerationStats,
    /// Empty unless every individual is persisted.
    #[serde(default)]
    pub individuals: Vec<IndividualSnapshot>,
}

/// Read-only copy of an island's retained history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemeSnapshot {
    pub island: usize,
    pub generations: Vec<GenerationSnapshot>,
}

/// Everything a checkpoint hands to the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionSnapshot {
    pub name: String,
    pub policy: SavePolicy,
    pub elapsed_secs: f64,
    pub mean_generation: f64,
    /// Set on the final save.
    pub finished: bool,
    pub best: Option<IndividualSnapshot>,
    #[serde(default)]
    pub pareto_front: Vec<IndividualSnapshot>,
    #[serde(default)]
    pub old_pareto: Vec<IndividualSnapshot>,
    #[serde(default)]
    pub demes: Vec<DemeSnapshot>,
}

impl EvolutionSnapshot {
    /// Fold the history of an earlier checkpoint of the same search into
    /// this one.
    ///
    /// Generations are keyed by (island, index); the newer copy of a
    /// generation wins since migration may have changed it. Old Pareto
    /// members persisted earlier are kept unless they are back on the front.
    pub fn merge_history(&mut self, earlier: EvolutionSnapshot) {
        for old_deme in earlier.demes {
            let slot = match self.demes.iter().position(|d| d.island == old_deme.island) {
                Some(slot) => slot,
                None => {
                    self.demes.push(DemeSnapshot {
                        island: old_deme.island,
                        generations: Vec::new(),
                    });
                    self.demes.len() - 1
                }
            };
            let deme = &mut self.demes[slot];
            let mut by_index: BTreeMap<usize, GenerationSnapshot> = old_deme
                .generations
                .into_iter()
                .map(|g| (g.index, g))
                .collect();
            by_index.extend(deme.generations.drain(..).map(|g| (g.index, g)));
            deme.generations = by_index.into_values().collect();
        }
        self.demes.sort_by_key(|d| d.island);

        let known: HashSet<u64> = self
            .pareto_front
            .iter()
            .chain(&self.old_pareto)
            .map(|ind| ind.id)
            .collect();
        let mut old: Vec<IndividualSnapshot> = earlier
            .old_pareto
            .into_iter()
            .filter(|ind| !known.contains(&ind.id))
            .collect();
        old.append(&mut self.old_pareto);
        self.old_pareto = old;
    }
}

// ============================================================================
// Progress and Result Types
// ============================================================================

/// Phase of the island the progress refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EvolutionPhase {
    /// Building and evaluating the initial population.
    #[default]
    Initializing,
    /// Creating offspring.
    Reproducing,
    /// Waiting for the worker pool.
    AwaitingEvaluation,
    /// Deterministic crowding selection.
    Selecting,
    /// Waiting for, or exchanging with, a migration partner.
    Migrating,
    /// Limits reached, island no longer reproduces.
    Terminating,
    /// All islands finished.
    Complete,
}

/// Progress update emitted after every island generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProgress {
    /// Island that completed a generation.
    pub island: usize,
    /// Generation index of that island.
    pub generation: usize,
    /// Average generation across islands.
    pub mean_generation: f64,
    /// Mean generation at which the search ends.
    pub max_generations: usize,
    pub best_error: Option<f64>,
    pub best_complexity: Option<usize>,
    pub pareto_size: usize,
    /// Islands still evolving.
    pub islands_running: usize,
    pub phase: EvolutionPhase,
}

/// A new global best.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Improvement {
    pub mean_generation: f64,
    pub error: f64,
    pub complexity: usize,
    pub elapsed_secs: f64,
}

/// Evolution history for plotting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvolutionHistory {
    /// Every new global best in order.
    pub improvements: Vec<Improvement>,
    /// Pareto front size after each island generation.
    pub pareto_size: Vec<usize>,
}

/// Fit of a model on held-out experiments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    /// Root-mean-square error over all output observations.
    pub rmse: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
    /// Observations scored.
    pub n_points: usize,
}

/// Pareto front member with its per-experiment errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontEntry {
    pub individual: IndividualSnapshot,
    /// Experiment id to error after the experiment threshold. Diverged
    /// experiments carry the negative divergence sentinel.
    pub error_table: BTreeMap<u32, f64>,
}

/// Final result of a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Lowest-error member of the Pareto front.
    pub best: Option<IndividualSnapshot>,
    /// Pareto front by ascending complexity.
    pub pareto_front: Vec<FrontEntry>,
    /// Fit of the best model on the validation experiments.
    pub validation: Option<ValidationReport>,
    pub stats: SearchStats,
    pub history: EvolutionHistory,
}

/// Statistics from a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    pub mean_generations: f64,
    pub total_evaluations: u64,
    pub elapsed_seconds: f64,
    pub evaluations_per_second: f64,
    pub stop_reason: StopReason,
}

/// Reason a search stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Reached the generation limit.
    MaxGenerations,
    /// No new best for the configured number of generations.
    NoImprovement,
    /// User cancelled.
    Cancelled,
}

// ============================================================================
// Validation
// ============================================================================

/// Search configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum SearchConfigError {
    #[error("At least one island is required")]
    NoIslands,
    #[error("Island size must be at least 2")]
    IslandTooSmall,
    #[error("Maximum generations must be positive")]
    InvalidGenerations,
    #[error("Rate {name} must lie in [0, 1], got {value}")]
    InvalidRate { name: &'static str, value: f64 },
    #[error("Simulation config validation failed: {0}")]
    SimConfigError(#[from] ConfigError),
}

impl SearchConfig {
    /// Validate search configuration.
    pub fn validate(&self) -> Result<(), SearchConfigError> {
        self.sim.validate()?;

        if self.islands.n_islands == 0 {
            return Err(SearchConfigError::NoIslands);
        }
        if self.islands.island_size < 2 {
            return Err(SearchConfigError::IslandTooSmall);
        }
        if self.islands.max_generations == 0 {
            return Err(SearchConfigError::InvalidGenerations);
        }

        let ops = &self.operators;
        for (name, value) in [
            ("crossover_rate", ops.crossover_rate),
            ("node_cross_rate", ops.node_cross_rate),
            ("node_duplication_rate", ops.node_duplication_rate),
            ("node_removal_rate", ops.node_removal_rate),
            ("edge_duplication_rate", ops.edge_duplication_rate),
            ("edge_removal_rate", ops.edge_removal_rate),
            ("param_mutation_rate", ops.param_mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SearchConfigError::InvalidRate { name, value });
            }
        }

        Ok(())
    }
}

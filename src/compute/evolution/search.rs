//! Island-model search coordinator.
//!
//! Each island evolves with deterministic crowding. The coordinator owns
//! every population and the Pareto front; the worker pool only ever sees
//! copies of genotypes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::schema::{
    EvolutionHistory, EvolutionPhase, EvolutionProgress, EvolutionSnapshot, ExperimentError,
    ExperimentSet, FrontEntry, Genotype, Improvement, SavePolicy, SearchConfig,
    SearchConfigError, SearchResult, SearchStats, StopReason,
};

use super::archive::{EvolutionStore, ParetoArchive};
use super::crowding::{DeterministicCrowding, Offspring};
use super::fitness::ExperimentEvaluator;
use super::genome::{GenomeRng, MutationScope};
use super::pool::{CompletedBatch, EvaluationResult, EvaluationService, PoolError};
use super::population::{Deme, Generation, Individual};

/// Search errors.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Invalid search configuration: {0}")]
    Config(#[from] SearchConfigError),
    #[error("Invalid experiments: {0}")]
    Experiments(#[from] ExperimentError),
    #[error("Evaluation pool failed: {0}")]
    Pool(#[from] PoolError),
}

/// Migration state of one island.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Migration {
    None,
    /// Finished a generation and waits for its partner.
    Waiting,
    /// Will exchange with this island once both are ready.
    Partner(usize),
}

/// Individuals handed to the worker pool for one island.
#[derive(Debug)]
enum Brood {
    Founders(Vec<Individual>),
    Offspring(Vec<Offspring>),
}

impl Brood {
    fn batch(&self) -> Vec<(Genotype, f64)> {
        match self {
            Self::Founders(individuals) => individuals
                .iter()
                .map(|ind| (ind.genotype.clone(), ind.bound))
                .collect(),
            Self::Offspring(offspring) => offspring
                .iter()
                .map(|o| (o.child.genotype.clone(), o.child.bound))
                .collect(),
        }
    }

    fn record(&mut self, results: &[EvaluationResult], include_all_features: bool) {
        let individuals: Vec<&mut Individual> = match self {
            Self::Founders(individuals) => individuals.iter_mut().collect(),
            Self::Offspring(offspring) => offspring.iter_mut().map(|o| &mut o.child).collect(),
        };
        for (ind, result) in individuals.into_iter().zip(results) {
            ind.record(result.evaluation, result.sim_time, include_all_features);
        }
    }
}

struct Island {
    deme: Deme,
    brood: Option<Brood>,
    migration: Migration,
    phase: EvolutionPhase,
}

impl Island {
    fn new(index: usize) -> Self {
        Self {
            deme: Deme::new(index),
            brood: None,
            migration: Migration::None,
            phase: EvolutionPhase::Initializing,
        }
    }

    fn population(&self) -> Vec<Arc<Individual>> {
        self.deme
            .current()
            .map(|g| g.individuals.clone())
            .unwrap_or_default()
    }
}

/// Exchange individuals between two populations: both are pooled,
/// shuffled and dealt back with their original sizes.
pub fn migrate_between(
    rng: &mut GenomeRng,
    a: &mut Vec<Arc<Individual>>,
    b: &mut Vec<Arc<Individual>>,
) {
    let n_a = a.len();
    let mut pooled: Vec<Arc<Individual>> = a.drain(..).chain(b.drain(..)).collect();
    rng.shuffle(&mut pooled);
    *b = pooled.split_off(n_a);
    *a = pooled;
}

/// Evolution engine that runs the island search.
pub struct EvolutionEngine {
    config: SearchConfig,
    experiments: Arc<ExperimentSet>,
    rng: GenomeRng,
    crowding: DeterministicCrowding,
    islands: Vec<Island>,
    archive: ParetoArchive,
    store: Option<Box<dyn EvolutionStore>>,
    history: EvolutionHistory,
    /// Island generations completed since the start, over all islands.
    completed_generations: usize,
    n_migrations: usize,
    best_error: f64,
    best_complexity: usize,
    /// Mean generation at which the search gives up without a new best.
    improvement_deadline: f64,
    islands_left: usize,
    total_evaluations: u64,
    next_id: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    started: Instant,
    last_checkpoint: Instant,
}

impl EvolutionEngine {
    /// Create a new evolution engine.
    pub fn new(config: SearchConfig, experiments: ExperimentSet) -> Result<Self, SearchError> {
        config.validate()?;
        experiments.validate()?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        let mut rng = GenomeRng::new(seed);
        rng.reserve_labels(experiments.max_label());

        let crowding = DeterministicCrowding::new(
            config.operators.clone(),
            MutationScope::from_experiments(&experiments),
        );
        let improvement_deadline = config.islands.max_generations_no_improvement as f64;
        let now = Instant::now();

        Ok(Self {
            config,
            experiments: Arc::new(experiments),
            rng,
            crowding,
            islands: Vec::new(),
            archive: ParetoArchive::new(),
            store: None,
            history: EvolutionHistory::default(),
            completed_generations: 0,
            n_migrations: 0,
            best_error: f64::INFINITY,
            best_complexity: usize::MAX,
            improvement_deadline,
            islands_left: 0,
            total_evaluations: 0,
            next_id: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            started: now,
            last_checkpoint: now,
        })
    }

    /// Persist checkpoints through `store`.
    pub fn with_store<S: EvolutionStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Average generation over islands.
    pub fn mean_generation(&self) -> f64 {
        self.completed_generations as f64 / self.config.islands.n_islands as f64
    }

    /// Current Pareto front, by ascending complexity.
    pub fn pareto_front(&self) -> &[Arc<Individual>] {
        self.archive.front()
    }

    /// Lowest-error member of the Pareto front.
    pub fn best(&self) -> Option<&Arc<Individual>> {
        self.archive.best()
    }

    pub fn demes(&self) -> impl Iterator<Item = &Deme> {
        self.islands.iter().map(|island| &island.deme)
    }

    pub fn history(&self) -> &EvolutionHistory {
        &self.history
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Island lifecycle
    // ========================================================================

    /// Build and submit a random population for every island.
    fn initialize(&mut self, pool: &EvaluationService) -> Result<(), SearchError> {
        let n_islands = self.config.islands.n_islands;
        let size = self.config.islands.population_size();
        let products = self.experiments.products();

        self.islands = (0..n_islands).map(Island::new).collect();
        self.islands_left = n_islands;

        for island in 0..n_islands {
            let mut founders = Vec::with_capacity(size);
            for _ in 0..size {
                let genotype = self.rng.random_genotype(&products);
                founders.push(Individual::new(self.next_id(), genotype));
            }
            self.submit(pool, island, Brood::Founders(founders))?;
        }
        Ok(())
    }

    fn submit(
        &mut self,
        pool: &EvaluationService,
        island: usize,
        brood: Brood,
    ) -> Result<(), SearchError> {
        let batch = brood.batch();
        self.total_evaluations += batch.len() as u64;

        let target = &mut self.islands[island];
        if matches!(brood, Brood::Offspring(_)) {
            target.phase = EvolutionPhase::AwaitingEvaluation;
        }
        target.brood = Some(brood);
        pool.submit(island, batch)?;
        Ok(())
    }

    fn reproduce(&mut self, pool: &EvaluationService, island: usize) -> Result<(), SearchError> {
        self.islands[island].phase = EvolutionPhase::Reproducing;
        let population = self.islands[island].population();
        let next_id = Arc::clone(&self.next_id);
        let offspring = self
            .crowding
            .reproduce(&population, &mut self.rng, || next_id.fetch_add(1, Ordering::Relaxed));
        self.submit(pool, island, Brood::Offspring(offspring))
    }

    /// Store the results of a finished batch and select the next generation.
    fn apply_results(&mut self, batch: CompletedBatch) {
        let include_all = self.config.sim.include_all_features;
        let elapsed = self.started.elapsed().as_secs_f64();
        let island = &mut self.islands[batch.island];
        let Some(mut brood) = island.brood.take() else {
            return;
        };
        brood.record(&batch.results, include_all);
        island.phase = EvolutionPhase::Selecting;

        let index = island.deme.next_index();
        let individuals = match brood {
            Brood::Founders(founders) => {
                let founders: Vec<Arc<Individual>> = founders.into_iter().map(Arc::new).collect();
                self.archive.offer(founders.iter().cloned());
                founders
            }
            Brood::Offspring(offspring) => {
                let selection = DeterministicCrowding::select(offspring);
                self.archive.retire(&selection.replaced);
                self.archive.offer(selection.children);
                selection.survivors
            }
        };
        let generation = Generation::new(index, elapsed, individuals);
        debug!(
            "Island {} finished generation {} (min error {:?})",
            batch.island,
            index,
            generation.stats().min_error
        );
        island.deme.push(generation);
        self.archive.recalculate();
        self.history.pareto_size.push(self.archive.len());
    }

    /// Decide what a ready island does next: migrate, wait, or reproduce.
    fn advance(&mut self, pool: &EvaluationService, island: usize) -> Result<(), SearchError> {
        match self.islands[island].migration {
            Migration::Partner(partner) if self.islands[partner].migration == Migration::Waiting => {
                self.exchange(island, partner);
                self.islands[island].migration = Migration::None;
                self.islands[partner].migration = Migration::None;
                self.reproduce(pool, island)?;
                self.reproduce(pool, partner)?;
            }
            Migration::Partner(_) => {
                self.islands[island].migration = Migration::Waiting;
                self.islands[island].phase = EvolutionPhase::Migrating;
            }
            Migration::None | Migration::Waiting => {
                if self.migration_due() {
                    self.n_migrations += 1;
                    self.release_waiting(pool, false)?;
                    self.schedule_migration();
                    if matches!(self.islands[island].migration, Migration::Partner(_)) {
                        self.islands[island].migration = Migration::Waiting;
                        self.islands[island].phase = EvolutionPhase::Migrating;
                    } else {
                        self.reproduce(pool, island)?;
                    }
                } else {
                    self.reproduce(pool, island)?;
                }
            }
        }
        Ok(())
    }

    fn migration_due(&self) -> bool {
        let period = self.config.islands.migration_period;
        let n_islands = self.config.islands.n_islands;
        n_islands > 1
            && period > 0
            && self.completed_generations >= (self.n_migrations + 1) * period * n_islands
    }

    /// Pair islands at random; with an odd count one island sits out.
    fn schedule_migration(&mut self) {
        let mut order: Vec<usize> = (0..self.islands.len()).collect();
        self.rng.shuffle(&mut order);
        for island in &mut self.islands {
            island.migration = Migration::None;
        }
        for pair in order.chunks_exact(2) {
            self.islands[pair[0]].migration = Migration::Partner(pair[1]);
            self.islands[pair[1]].migration = Migration::Partner(pair[0]);
        }
        info!(
            "Migration round {} at generation {:.2}: {} pairs",
            self.n_migrations,
            self.mean_generation(),
            order.len() / 2
        );
    }

    fn exchange(&mut self, a: usize, b: usize) {
        let (low, high) = (a.min(b), a.max(b));
        let (left, right) = self.islands.split_at_mut(high);
        let (Some(first), Some(second)) =
            (left[low].deme.current_mut(), right[0].deme.current_mut())
        else {
            return;
        };
        migrate_between(&mut self.rng, &mut first.individuals, &mut second.individuals);
        debug!("Islands {a} and {b} exchanged individuals");
    }

    /// Let waiting islands go without migrating. When the search is ending
    /// they terminate, otherwise they resume reproduction.
    fn release_waiting(
        &mut self,
        pool: &EvaluationService,
        terminate: bool,
    ) -> Result<(), SearchError> {
        let waiting: Vec<usize> = (0..self.islands.len())
            .filter(|&i| self.islands[i].migration == Migration::Waiting)
            .collect();
        for island in waiting {
            debug!("Releasing waiting island {island}");
            self.islands[island].migration = Migration::None;
            if terminate {
                self.islands[island].phase = EvolutionPhase::Terminating;
                self.islands_left -= 1;
            } else {
                self.reproduce(pool, island)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Termination and best tracking
    // ========================================================================

    /// Check if evolution should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }
        let mean = self.mean_generation();
        if mean >= self.config.islands.max_generations as f64 {
            return Some(StopReason::MaxGenerations);
        }
        if mean >= self.improvement_deadline {
            return Some(StopReason::NoImprovement);
        }
        None
    }

    /// Record a new global best: lower error (to two decimals) or lower
    /// complexity of the lowest-error front member.
    fn check_best(&mut self) {
        let Some(best) = self.archive.best() else {
            return;
        };
        let error = (best.error() * 100.0).round() / 100.0;
        let complexity = best.complexity;
        if error < self.best_error || complexity < self.best_complexity {
            self.best_error = error;
            self.best_complexity = complexity;
            let mean = self.mean_generation();
            self.improvement_deadline =
                mean + self.config.islands.max_generations_no_improvement as f64;
            self.history.improvements.push(Improvement {
                mean_generation: mean,
                error: best.error(),
                complexity,
                elapsed_secs: self.started.elapsed().as_secs_f64(),
            });
            info!(
                "New best: error={:.4}, complexity={}, generation={:.2}",
                best.error(),
                complexity,
                mean
            );
        }
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Snapshot of the search according to the save policy.
    pub fn snapshot(&self, finished: bool) -> EvolutionSnapshot {
        let policy = self.config.persistence.policy;
        let best = if policy >= SavePolicy::Best {
            self.archive.best().map(|ind| ind.snapshot())
        } else {
            None
        };
        let (pareto_front, old_pareto) = if policy >= SavePolicy::ParetoFront {
            (self.archive.front_snapshot(), self.archive.old_snapshot())
        } else {
            (Vec::new(), Vec::new())
        };
        let demes = if policy >= SavePolicy::Evolution {
            let with_individuals = policy >= SavePolicy::AllIndividuals;
            self.islands
                .iter()
                .map(|island| island.deme.snapshot(with_individuals))
                .collect()
        } else {
            Vec::new()
        };

        EvolutionSnapshot {
            name: self.config.name.clone(),
            policy,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            mean_generation: self.mean_generation(),
            finished,
            best,
            pareto_front,
            old_pareto,
            demes,
        }
    }

    fn checkpoint_due(&self) -> bool {
        self.last_checkpoint.elapsed().as_secs() >= self.config.persistence.checkpoint_interval_secs
    }

    /// Hand a snapshot to the store, then drop history it now holds.
    fn checkpoint(&mut self, finished: bool) {
        self.last_checkpoint = Instant::now();
        if self.config.persistence.policy != SavePolicy::None && self.store.is_some() {
            let snapshot = self.snapshot(finished);
            if let Some(store) = self.store.as_mut() {
                match store.submit(&snapshot) {
                    Ok(()) => info!(
                        "Checkpoint '{}' written at generation {:.2}",
                        snapshot.name, snapshot.mean_generation
                    ),
                    Err(e) => warn!("Checkpoint '{}' failed: {e}", snapshot.name),
                }
            }
        }
        self.prune();
    }

    fn prune(&mut self) {
        let mut live = HashSet::new();
        for island in &mut self.islands {
            island.deme.prune();
            if let Some(generation) = island.deme.current() {
                live.extend(generation.individuals.iter().map(|ind| ind.id));
            }
        }
        self.archive.prune_old(&live);
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Progress of the search as seen from `island`.
    pub fn progress(&self, island: usize) -> EvolutionProgress {
        let state = self.islands.get(island);
        let best = self.archive.best();
        EvolutionProgress {
            island,
            generation: state
                .and_then(|s| s.deme.current())
                .map_or(0, |g| g.index),
            mean_generation: self.mean_generation(),
            max_generations: self.config.islands.max_generations,
            best_error: best.map(|ind| ind.error()),
            best_complexity: best.map(|ind| ind.complexity),
            pareto_size: self.archive.len(),
            islands_running: self.islands_left,
            phase: state.map_or(EvolutionPhase::Initializing, |s| s.phase),
        }
    }

    /// Run evolution with progress callback.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<SearchResult, SearchError>
    where
        F: Fn(&EvolutionProgress),
    {
        self.started = Instant::now();
        self.last_checkpoint = self.started;
        info!(
            "Starting search '{}': {} islands of {} individuals",
            self.config.name,
            self.config.islands.n_islands,
            self.config.islands.population_size()
        );

        let experiments = Arc::clone(&self.experiments);
        let params = self.config.sim.clone();
        let mut pool = EvaluationService::spawn(self.config.evaluation.worker_count(), || {
            ExperimentEvaluator::new(Arc::clone(&experiments), params.clone())
        })?;

        self.initialize(&pool)?;
        callback(&self.progress(0));

        let mut stop_reason = None;
        while self.islands_left > 0 {
            let batch = pool.wait_for_any_ready_island()?;
            let island = batch.island;
            self.apply_results(batch);

            match self.should_stop() {
                None => {
                    self.check_best();
                    self.advance(&pool, island)?;
                    self.completed_generations += 1;
                    if self.checkpoint_due() {
                        self.checkpoint(false);
                    }
                }
                Some(reason) => {
                    stop_reason.get_or_insert(reason);
                    self.islands[island].phase = EvolutionPhase::Terminating;
                    self.islands_left -= 1;
                    self.release_waiting(&pool, true)?;
                }
            }
            callback(&self.progress(island));
        }
        pool.shutdown();

        for island in &mut self.islands {
            island.phase = EvolutionPhase::Complete;
        }
        self.checkpoint(true);
        callback(&self.progress(0));

        Ok(self.finish(stop_reason.unwrap_or(StopReason::MaxGenerations)))
    }

    /// Run evolution (blocking).
    pub fn run(&mut self) -> Result<SearchResult, SearchError> {
        self.run_with_callback(|_| {})
    }

    fn finish(&self, stop_reason: StopReason) -> SearchResult {
        let front = self.archive.front();
        let experiments = &self.experiments;
        let params = &self.config.sim;

        let tables: Vec<_> = front
            .par_iter()
            .map_init(
                || ExperimentEvaluator::new(Arc::clone(experiments), params.clone()),
                |evaluator, ind| evaluator.error_table(&ind.genotype),
            )
            .collect();
        let pareto_front: Vec<FrontEntry> = front
            .iter()
            .zip(tables)
            .map(|(ind, error_table)| FrontEntry {
                individual: ind.snapshot(),
                error_table,
            })
            .collect();

        let best = self.archive.best();
        let validation = best.and_then(|ind| {
            let mut evaluator = ExperimentEvaluator::new(Arc::clone(experiments), params.clone());
            match evaluator.validation_report(&ind.genotype) {
                Ok(report) => report,
                Err(divergence) => {
                    debug!("Best model diverged on validation data: {divergence}");
                    None
                }
            }
        });

        let elapsed = self.started.elapsed().as_secs_f64();
        info!(
            "Search '{}' finished after {:.2} generations ({:?}), front size {}",
            self.config.name,
            self.mean_generation(),
            stop_reason,
            front.len()
        );

        SearchResult {
            best: best.map(|ind| ind.snapshot()),
            pareto_front,
            validation,
            stats: SearchStats {
                mean_generations: self.mean_generation(),
                total_evaluations: self.total_evaluations,
                elapsed_seconds: elapsed,
                evaluations_per_second: if elapsed > 0.0 {
                    self.total_evaluations as f64 / elapsed
                } else {
                    0.0
                },
                stop_reason,
            },
            history: self.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evolution::{Evaluation, JsonDirStore};
    use crate::schema::{
        Experiment, IslandConfig, NodeKind, Observation, PersistenceConfig,
    };
    use std::collections::BTreeMap;

    fn experiments() -> ExperimentSet {
        ExperimentSet::new(vec![Experiment::new(
            1,
            "ramp",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(1, NodeKind::ConstantRate, 5.0, 5.0),
                Observation::new(2, NodeKind::Output, 0.0, 0.0),
                Observation::new(2, NodeKind::Output, 2.5, 0.5),
                Observation::new(2, NodeKind::Output, 5.0, 1.0),
            ],
        )])
    }

    fn config(n_islands: usize, size: usize, generations: usize) -> SearchConfig {
        SearchConfig {
            name: "test".to_string(),
            islands: IslandConfig {
                n_islands,
                island_size: size,
                max_generations: generations,
                max_generations_no_improvement: 1000,
                migration_period: 2,
            },
            random_seed: Some(42),
            evaluation: crate::schema::EvaluationConfig { n_workers: 2 },
            ..Default::default()
        }
    }

    fn population(ids: std::ops::Range<u64>) -> Vec<Arc<Individual>> {
        ids.map(|id| {
            let mut ind = Individual::new(id, Genotype::new());
            ind.evaluation = Some(Evaluation::Scored(id as f64));
            Arc::new(ind)
        })
        .collect()
    }

    #[test]
    fn test_migration_conserves_individuals() {
        let mut rng = GenomeRng::new(5);
        let mut a = population(0..6);
        let mut b = population(6..12);
        migrate_between(&mut rng, &mut a, &mut b);

        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 6);
        let mut ids: Vec<u64> = a.iter().chain(&b).map(|i| i.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = SearchConfig {
            islands: IslandConfig {
                n_islands: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            EvolutionEngine::new(bad, experiments()),
            Err(SearchError::Config(SearchConfigError::NoIslands))
        ));
        assert!(matches!(
            EvolutionEngine::new(SearchConfig::default(), ExperimentSet::default()),
            Err(SearchError::Experiments(_))
        ));
    }

    #[test]
    fn test_run_reaches_generation_limit() {
        let mut engine = EvolutionEngine::new(config(3, 6, 4), experiments()).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stats.stop_reason, StopReason::MaxGenerations);
        assert_eq!(engine.mean_generation(), 4.0);
        assert!(result.best.is_some());
        assert!(!result.pareto_front.is_empty());
        for pair in result.pareto_front.windows(2) {
            assert!(pair[0].individual.complexity <= pair[1].individual.complexity);
        }
        for entry in &result.pareto_front {
            assert!(entry.error_table.contains_key(&1));
        }
        assert!(!result.history.improvements.is_empty());
        // Founders plus one generation per completed island step.
        assert_eq!(result.stats.total_evaluations % 6, 0);
    }

    #[test]
    fn test_populations_keep_their_size() {
        let mut engine = EvolutionEngine::new(config(2, 5, 6), experiments()).unwrap();
        engine.run().unwrap();
        for deme in engine.demes() {
            assert_eq!(deme.current().map(|g| g.len()), Some(6));
            assert_eq!(deme.generations().len(), 1);
        }
    }

    #[test]
    fn test_cancel_stops_search() {
        let mut engine = EvolutionEngine::new(config(2, 4, 1_000_000), experiments()).unwrap();
        let cancel = engine.cancel_handle();
        let result = engine
            .run_with_callback(|progress| {
                if progress.mean_generation >= 3.0 {
                    cancel.store(true, Ordering::Relaxed);
                }
            })
            .unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::Cancelled);
        assert!(result.stats.mean_generations < 10.0);
    }

    #[test]
    fn test_final_checkpoint_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path()).unwrap();
        let config = SearchConfig {
            persistence: PersistenceConfig {
                policy: SavePolicy::AllIndividuals,
                checkpoint_interval_secs: 0,
            },
            ..config(2, 4, 3)
        };
        let mut engine = EvolutionEngine::new(config, experiments())
            .unwrap()
            .with_store(store.clone());
        engine.run().unwrap();

        let saved = store.load("test").unwrap().unwrap();
        assert!(saved.finished);
        assert!(saved.best.is_some());
        assert_eq!(saved.demes.len(), 2);
        for generation in &saved.demes[0].generations {
            assert_eq!(generation.individuals.len(), 4);
        }
        assert!(!saved.pareto_front.is_empty());
    }

    #[test]
    fn test_every_generation_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path()).unwrap();
        let config = SearchConfig {
            persistence: PersistenceConfig {
                policy: SavePolicy::Evolution,
                checkpoint_interval_secs: 0,
            },
            ..config(1, 4, 6)
        };
        let mut engine = EvolutionEngine::new(config, experiments())
            .unwrap()
            .with_store(store.clone());
        engine.run().unwrap();
        assert_eq!(engine.demes().next().map(|d| d.generations().len()), Some(1));

        let saved = store.load("test").unwrap().unwrap();
        let indices: Vec<usize> = saved.demes[0].generations.iter().map(|g| g.index).collect();
        assert_eq!(indices, (0..=6).collect::<Vec<_>>());
    }

    /// Islands with a scored random population each, as after initialization.
    fn seeded_islands(engine: &mut EvolutionEngine, n_islands: usize, size: u64) {
        let products = engine.experiments.products();
        engine.islands = (0..n_islands).map(Island::new).collect();
        engine.islands_left = n_islands;
        for island in 0..n_islands {
            let founders = (0..size)
                .map(|k| {
                    let genotype = engine.rng.random_genotype(&products);
                    let mut ind = Individual::new(island as u64 * 100 + k, genotype);
                    ind.evaluation = Some(Evaluation::Scored(1.0 + k as f64));
                    Arc::new(ind)
                })
                .collect();
            engine.islands[island]
                .deme
                .push(Generation::new(0, 0.0, founders));
        }
    }

    fn evaluation_pool(engine: &EvolutionEngine) -> EvaluationService {
        let experiments = Arc::clone(&engine.experiments);
        let params = engine.config.sim.clone();
        EvaluationService::spawn(1, move || {
            ExperimentEvaluator::new(Arc::clone(&experiments), params.clone())
        })
        .unwrap()
    }

    fn live_ids(engine: &EvolutionEngine) -> Vec<u64> {
        let mut ids: Vec<u64> = engine
            .islands
            .iter()
            .flat_map(|island| island.population())
            .map(|ind| ind.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn ready_islands(pool: &EvaluationService, n: usize) -> Vec<usize> {
        let mut ready: Vec<usize> = (0..n)
            .map(|_| pool.wait_for_any_ready_island().unwrap().island)
            .collect();
        ready.sort_unstable();
        ready
    }

    #[test]
    fn test_island_waits_for_migration_partner() {
        let mut engine = EvolutionEngine::new(config(2, 4, 100), experiments()).unwrap();
        seeded_islands(&mut engine, 2, 4);
        let pool = evaluation_pool(&engine);
        engine.islands[0].migration = Migration::Partner(1);
        engine.islands[1].migration = Migration::Partner(0);
        let before = live_ids(&engine);

        engine.advance(&pool, 0).unwrap();
        assert_eq!(engine.islands[0].migration, Migration::Waiting);
        assert_eq!(engine.islands[0].phase, EvolutionPhase::Migrating);
        assert!(engine.islands[0].brood.is_none());
        assert_eq!(pool.pending_islands(), 0);

        // The partner arrives: both exchange and reproduce.
        engine.advance(&pool, 1).unwrap();
        for island in &engine.islands {
            assert_eq!(island.migration, Migration::None);
            assert!(island.brood.is_some());
            assert_eq!(island.population().len(), 4);
        }
        assert_eq!(live_ids(&engine), before);
        assert_eq!(ready_islands(&pool, 2), vec![0, 1]);
    }

    #[test]
    fn test_due_migration_pairs_islands() {
        let mut engine = EvolutionEngine::new(config(2, 4, 100), experiments()).unwrap();
        seeded_islands(&mut engine, 2, 4);
        let pool = evaluation_pool(&engine);
        // Two islands with period 2: due after four island generations.
        engine.completed_generations = 3;
        assert!(!engine.migration_due());
        engine.completed_generations = 4;
        assert!(engine.migration_due());

        engine.advance(&pool, 0).unwrap();
        assert_eq!(engine.n_migrations, 1);
        assert!(!engine.migration_due());
        assert_eq!(engine.islands[0].migration, Migration::Waiting);
        assert_eq!(engine.islands[1].migration, Migration::Partner(0));

        engine.advance(&pool, 1).unwrap();
        assert_eq!(ready_islands(&pool, 2), vec![0, 1]);
    }

    #[test]
    fn test_odd_island_sits_out_migration() {
        let mut engine = EvolutionEngine::new(config(3, 4, 100), experiments()).unwrap();
        seeded_islands(&mut engine, 3, 4);
        engine.schedule_migration();

        let mut unpaired = 0;
        for (index, island) in engine.islands.iter().enumerate() {
            match island.migration {
                Migration::Partner(partner) => {
                    assert_ne!(partner, index);
                    assert_eq!(engine.islands[partner].migration, Migration::Partner(index));
                }
                _ => unpaired += 1,
            }
        }
        assert_eq!(unpaired, 1);
    }

    #[test]
    fn test_waiting_islands_released() {
        let mut engine = EvolutionEngine::new(config(3, 4, 100), experiments()).unwrap();
        seeded_islands(&mut engine, 3, 4);
        let pool = evaluation_pool(&engine);

        // Ending: waiting islands terminate without another batch.
        engine.islands[0].migration = Migration::Waiting;
        engine.islands[2].migration = Migration::Waiting;
        engine.release_waiting(&pool, true).unwrap();
        assert_eq!(engine.islands_left, 1);
        for index in [0, 2] {
            let island = &engine.islands[index];
            assert_eq!(island.migration, Migration::None);
            assert_eq!(island.phase, EvolutionPhase::Terminating);
            assert!(island.brood.is_none());
        }
        assert_eq!(pool.pending_islands(), 0);

        // Otherwise they resume reproduction.
        engine.islands[1].migration = Migration::Waiting;
        engine.release_waiting(&pool, false).unwrap();
        assert_eq!(engine.islands[1].migration, Migration::None);
        assert!(engine.islands[1].brood.is_some());
        assert_eq!(ready_islands(&pool, 1), vec![1]);
    }

    #[test]
    fn test_losing_children_stay_off_front() {
        let mut engine = EvolutionEngine::new(config(1, 2, 100), experiments()).unwrap();
        let one_node: Genotype = "(2 0 1 0 0 0.1 0 2*)".parse().unwrap();
        let parent = |id: u64, error: f64| {
            let mut ind = Individual::new(id, one_node.clone());
            ind.evaluation = Some(Evaluation::Scored(error));
            Arc::new(ind)
        };
        let (p0, p1) = (parent(0, 0.5), parent(1, 3.0));
        assert_eq!(p0.complexity, 1);

        engine.islands = vec![Island::new(0)];
        engine.islands_left = 1;
        engine.islands[0]
            .deme
            .push(Generation::new(0, 0.0, vec![Arc::clone(&p0), Arc::clone(&p1)]));
        engine.archive.offer([Arc::clone(&p0), Arc::clone(&p1)]);
        engine.archive.recalculate();

        // Empty children are simpler than their parents. Child 10 loses with
        // an error cut short at its bound; child 11 wins.
        engine.islands[0].brood = Some(Brood::Offspring(vec![
            Offspring {
                child: Individual::offspring(10, Genotype::new(), (0, 1), p0.error()),
                parent: Arc::clone(&p0),
            },
            Offspring {
                child: Individual::offspring(11, Genotype::new(), (1, 0), p1.error()),
                parent: Arc::clone(&p1),
            },
        ]));
        let scored = |error| EvaluationResult {
            evaluation: Evaluation::Scored(error),
            sim_time: 0.0,
        };
        engine.apply_results(CompletedBatch {
            island: 0,
            results: vec![scored(1.3), scored(2.0)],
        });

        let front: Vec<u64> = engine.pareto_front().iter().map(|i| i.id).collect();
        assert_eq!(front, vec![11, 0]);
        assert_eq!(engine.best().map(|i| i.id), Some(0));
        assert_eq!(live_ids(&engine), vec![0, 11]);
        assert_eq!(
            engine.archive.old().iter().map(|i| i.id).collect::<Vec<_>>(),
            Vec::<u64>::new()
        );
    }

    #[test]
    fn test_seeded_runs_agree() {
        let run = || {
            let mut engine = EvolutionEngine::new(config(1, 6, 5), experiments()).unwrap();
            let result = engine.run().unwrap();
            result
                .pareto_front
                .iter()
                .map(|e| (e.individual.complexity, e.individual.genotype.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        assert_eq!(run(), run());
    }
}

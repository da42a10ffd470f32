//! Individuals, generations and demes.

use std::sync::Arc;

use crate::schema::{
    DemeSnapshot, GenerationSnapshot, GenerationStats, Genotype, IndividualSnapshot,
};

use super::fitness::Evaluation;

/// A genotype together with its evaluation.
#[derive(Debug, Clone)]
pub struct Individual {
    pub id: u64,
    /// Ids of the two parents, for lineage only.
    pub parents: Option<(u64, u64)>,
    pub genotype: Genotype,
    pub evaluation: Option<Evaluation>,
    /// Complexity of the in-use subgraph, cached on evaluation.
    pub complexity: usize,
    /// Wall-clock evaluation time in seconds.
    pub sim_time: f64,
    /// Evaluation may stop once the error exceeds this.
    pub bound: f64,
}

impl Individual {
    pub fn new(id: u64, genotype: Genotype) -> Self {
        Self {
            id,
            parents: None,
            complexity: genotype.complexity(),
            genotype,
            evaluation: None,
            sim_time: 0.0,
            bound: f64::INFINITY,
        }
    }

    /// Offspring of `parents`, evaluated against the first parent's error.
    pub fn offspring(id: u64, genotype: Genotype, parents: (u64, u64), bound: f64) -> Self {
        Self {
            parents: Some(parents),
            bound,
            ..Self::new(id, genotype)
        }
    }

    /// Store the outcome of an evaluation.
    pub fn record(&mut self, evaluation: Evaluation, sim_time: f64, include_all_features: bool) {
        self.evaluation = Some(evaluation);
        self.sim_time = sim_time;
        self.complexity = self.genotype.complexity_in_use(include_all_features);
    }

    /// Error used for selection; unevaluated and diverged individuals rank last.
    pub fn error(&self) -> f64 {
        self.evaluation.map_or(f64::INFINITY, |e| e.error())
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluation.is_some()
    }

    /// Evaluated without divergence.
    pub fn is_viable(&self) -> bool {
        self.evaluation.is_some_and(|e| e.is_viable())
    }

    pub fn snapshot(&self) -> IndividualSnapshot {
        IndividualSnapshot {
            id: self.id,
            parents: self
                .parents
                .map(|(a, b)| vec![a, b])
                .unwrap_or_default(),
            genotype: self.genotype.clone(),
            error: self.is_viable().then(|| self.error()),
            complexity: self.complexity,
            diverged: matches!(self.evaluation, Some(Evaluation::Diverged(_))),
            sim_time: self.sim_time,
        }
    }
}

/// One generation of an island.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub index: usize,
    /// Seconds since the search started.
    pub time_secs: f64,
    pub individuals: Vec<Arc<Individual>>,
}

impl Generation {
    pub fn new(index: usize, time_secs: f64, individuals: Vec<Arc<Individual>>) -> Self {
        Self {
            index,
            time_secs,
            individuals,
        }
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.individuals.iter().any(|ind| ind.id == id)
    }

    pub fn stats(&self) -> GenerationStats {
        let viable: Vec<f64> = self
            .individuals
            .iter()
            .filter(|ind| ind.is_viable())
            .map(|ind| ind.error())
            .collect();
        let n = self.individuals.len();

        GenerationStats {
            min_error: viable.iter().copied().reduce(f64::min),
            mean_error: (!viable.is_empty()).then(|| viable.iter().sum::<f64>() / viable.len() as f64),
            min_complexity: self
                .individuals
                .iter()
                .map(|ind| ind.complexity)
                .min()
                .unwrap_or(0),
            mean_complexity: if n > 0 {
                self.individuals.iter().map(|ind| ind.complexity).sum::<usize>() as f64 / n as f64
            } else {
                0.0
            },
            n_diverged: self
                .individuals
                .iter()
                .filter(|ind| ind.is_evaluated() && !ind.is_viable())
                .count(),
        }
    }

    pub fn snapshot(&self, with_individuals: bool) -> GenerationSnapshot {
        GenerationSnapshot {
            index: self.index,
            time_secs: self.time_secs,
            stats: self.stats(),
            individuals: if with_individuals {
                self.individuals.iter().map(|ind| ind.snapshot()).collect()
            } else {
                Vec::new()
            },
        }
    }
}

/// An island: its retained generations, the last one being the live
/// population.
#[derive(Debug, Clone, Default)]
pub struct Deme {
    pub island: usize,
    generations: Vec<Generation>,
}

impl Deme {
    pub fn new(island: usize) -> Self {
        Self {
            island,
            generations: Vec::new(),
        }
    }

    pub fn push(&mut self, generation: Generation) {
        self.generations.push(generation);
    }

    /// The live population.
    pub fn current(&self) -> Option<&Generation> {
        self.generations.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Generation> {
        self.generations.last_mut()
    }

    /// Index of the next generation.
    pub fn next_index(&self) -> usize {
        self.current().map_or(0, |g| g.index + 1)
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    /// Drop every generation but the live one.
    pub fn prune(&mut self) {
        let keep = self.generations.len().saturating_sub(1);
        self.generations.drain(..keep);
    }

    pub fn snapshot(&self, with_individuals: bool) -> DemeSnapshot {
        DemeSnapshot {
            island: self.island,
            generations: self
                .generations
                .iter()
                .map(|g| g.snapshot(with_individuals))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Divergence;

    fn evaluated(id: u64, evaluation: Evaluation, complexity: usize) -> Arc<Individual> {
        let mut ind = Individual::new(id, Genotype::new());
        ind.evaluation = Some(evaluation);
        ind.complexity = complexity;
        Arc::new(ind)
    }

    #[test]
    fn test_unevaluated_ranks_last() {
        let ind = Individual::new(1, Genotype::new());
        assert_eq!(ind.error(), f64::INFINITY);
        assert!(!ind.is_viable());
        assert_eq!(ind.snapshot().error, None);
    }

    #[test]
    fn test_generation_stats() {
        let generation = Generation::new(
            3,
            1.0,
            vec![
                evaluated(1, Evaluation::Scored(1.0), 4),
                evaluated(2, Evaluation::Scored(3.0), 2),
                evaluated(
                    3,
                    Evaluation::Diverged(Divergence::StepUnderflow {
                        time: 0.5,
                        step: 1e-7,
                    }),
                    6,
                ),
            ],
        );
        let stats = generation.stats();
        assert_eq!(stats.min_error, Some(1.0));
        assert_eq!(stats.mean_error, Some(2.0));
        assert_eq!(stats.min_complexity, 2);
        assert_eq!(stats.mean_complexity, 4.0);
        assert_eq!(stats.n_diverged, 1);

        let snap = generation.snapshot(true);
        assert_eq!(snap.individuals.len(), 3);
        assert!(snap.individuals[2].diverged);
        assert!(generation.snapshot(false).individuals.is_empty());
    }

    #[test]
    fn test_deme_prune_keeps_live_generation() {
        let mut deme = Deme::new(0);
        assert_eq!(deme.next_index(), 0);
        for index in 0..3 {
            deme.push(Generation::new(index, 0.0, vec![]));
        }
        assert_eq!(deme.next_index(), 3);
        deme.prune();
        assert_eq!(deme.generations().len(), 1);
        assert_eq!(deme.current().map(|g| g.index), Some(2));
    }
}

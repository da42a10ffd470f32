//! Deterministic crowding reproduction and replacement.
//!
//! Parents are paired at random. Each pair yields two children, crossed
//! with probability `crossover_rate` and always mutated. Every child is
//! bound to the parent it resembles most and replaces it only if its error
//! is not worse.

use std::sync::Arc;

use crate::schema::OperatorConfig;

use super::genome::{GenomeRng, MutationScope};
use super::population::Individual;

/// A child waiting for evaluation, tied to the parent it competes with.
#[derive(Debug, Clone)]
pub struct Offspring {
    pub parent: Arc<Individual>,
    pub child: Individual,
}

/// Result of one replacement round.
#[derive(Debug, Default)]
pub struct Selection {
    /// Next generation, in offspring order.
    pub survivors: Vec<Arc<Individual>>,
    /// Parents that lost to their child.
    pub replaced: Vec<Arc<Individual>>,
    /// Children that took their parent's place. Losing children are left
    /// out: their evaluation may have stopped early at the parent's error.
    pub children: Vec<Arc<Individual>>,
}

#[derive(Debug, Clone)]
pub struct DeterministicCrowding {
    operators: OperatorConfig,
    scope: MutationScope,
}

impl DeterministicCrowding {
    pub fn new(operators: OperatorConfig, scope: MutationScope) -> Self {
        Self { operators, scope }
    }

    pub fn scope(&self) -> &MutationScope {
        &self.scope
    }

    /// One child per member of `population`.
    pub fn reproduce(
        &self,
        population: &[Arc<Individual>],
        rng: &mut GenomeRng,
        mut next_id: impl FnMut() -> u64,
    ) -> Vec<Offspring> {
        let mut order: Vec<usize> = (0..population.len()).collect();
        rng.shuffle(&mut order);

        let mut offspring = Vec::with_capacity(population.len());
        for pair in order.chunks(2) {
            match *pair {
                [a, b] => {
                    let (p1, p2) = (&population[a], &population[b]);
                    let (mut g1, mut g2) = if rng.chance(self.operators.crossover_rate) {
                        rng.crossover(&p1.genotype, &p2.genotype, self.operators.node_cross_rate)
                    } else {
                        (p1.genotype.clone(), p2.genotype.clone())
                    };
                    rng.mutate(&mut g1, &self.scope, &self.operators);
                    rng.mutate(&mut g2, &self.scope, &self.operators);

                    offspring.push(Offspring {
                        child: Individual::offspring(next_id(), g1, (p1.id, p2.id), p1.error()),
                        parent: Arc::clone(p1),
                    });
                    offspring.push(Offspring {
                        child: Individual::offspring(next_id(), g2, (p2.id, p1.id), p2.error()),
                        parent: Arc::clone(p2),
                    });
                }
                [a] => {
                    let parent = &population[a];
                    let mut genotype = parent.genotype.clone();
                    rng.mutate(&mut genotype, &self.scope, &self.operators);
                    offspring.push(Offspring {
                        child: Individual::offspring(
                            next_id(),
                            genotype,
                            (parent.id, parent.id),
                            parent.error(),
                        ),
                        parent: Arc::clone(parent),
                    });
                }
                _ => {}
            }
        }
        offspring
    }

    /// Replace each parent by its child if the child's error is not worse.
    pub fn select(offspring: Vec<Offspring>) -> Selection {
        let mut selection = Selection::default();
        for Offspring { parent, child } in offspring {
            let child = Arc::new(child);
            if child.error() <= parent.error() {
                selection.survivors.push(Arc::clone(&child));
                selection.children.push(child);
                selection.replaced.push(parent);
            } else {
                selection.survivors.push(parent);
            }
        }
        selection
    }
}

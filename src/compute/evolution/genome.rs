//! Genotype manipulation utilities for evolutionary search.
//!
//! Provides random generation, crossover, and mutation operations.

use std::collections::{BTreeMap, BTreeSet};

use rand::prelude::*;

use crate::schema::{Edge, ExperimentSet, Genotype, Label, Node, NodeKind, OperatorConfig};

/// First label handed out to nodes created by evolution.
pub const FIRST_EVOLVED_LABEL: Label = 200;

/// Labels the structural operators need to respect.
#[derive(Debug, Clone, Default)]
pub struct MutationScope {
    /// Input nodes never receive regulation.
    pub inputs: BTreeSet<Label>,
    /// Output nodes are never removed.
    pub outputs: BTreeSet<Label>,
    /// Nodes above this label were added by evolution and may be removed.
    pub max_label: Label,
}

impl MutationScope {
    pub fn from_experiments(experiments: &ExperimentSet) -> Self {
        Self {
            inputs: experiments.input_labels().into_iter().collect(),
            outputs: experiments.output_labels().into_iter().collect(),
            max_label: experiments.max_label(),
        }
    }

    fn is_removable(&self, label: Label) -> bool {
        label > self.max_label && !self.outputs.contains(&label)
    }

    /// Labels that may be the target of a new edge.
    fn regulatable(&self, genotype: &Genotype) -> Vec<Label> {
        genotype
            .labels()
            .filter(|label| !self.inputs.contains(label))
            .collect()
    }
}

/// Random number generator wrapper for genotype operations.
pub struct GenomeRng {
    rng: StdRng,
    next_label: Label,
}

impl GenomeRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            next_label: FIRST_EVOLVED_LABEL,
        }
    }

    /// Make sure fresh labels never collide with experiment labels.
    pub fn reserve_labels(&mut self, max_label: Label) {
        self.next_label = self.next_label.max(max_label.saturating_add(1));
    }

    /// Bernoulli trial, `p` clamped to [0, 1].
    pub fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0))
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    fn pick(&mut self, labels: &[Label]) -> Option<Label> {
        labels.choose(&mut self.rng).copied()
    }

    fn unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    /// Next unused label not present in `genotype`.
    pub fn fresh_label(&mut self, genotype: &Genotype) -> Label {
        loop {
            let label = self.next_label;
            self.next_label = self.next_label.wrapping_add(1);
            if !genotype.contains(label) {
                return label;
            }
        }
    }

    // ========================================================================
    // Random generation
    // ========================================================================

    pub fn random_node(&mut self, label: Label, kind: NodeKind) -> Node {
        let mut node = Node {
            label,
            init: 0.0,
            limit: 0.0,
            pos_limit: 0.0,
            neg_limit: 0.0,
            degradation: 0.0,
            intrinsic_growth: 0.0,
            kind,
        };
        self.randomize_node(&mut node, 1.0);
        node
    }

    pub fn random_edge(&mut self, regulator: Label, regulated: Label) -> Edge {
        let mut edge = Edge {
            regulator,
            regulated,
            dis_const: 0.0,
            hill: 1.0,
            is_and: false,
            is_positive: true,
        };
        self.randomize_edge(&mut edge, 1.0);
        edge.is_and = self.rng.gen_bool(0.5);
        edge.is_positive = self.rng.gen_bool(0.5);
        edge
    }

    /// One node per product, each regulating up to half as many random
    /// outputs as there are products.
    pub fn random_genotype(&mut self, products: &BTreeMap<Label, NodeKind>) -> Genotype {
        let mut genotype = Genotype::new();
        for (&label, &kind) in products {
            genotype.insert_node(self.random_node(label, kind));
        }

        let outputs: Vec<Label> = products
            .iter()
            .filter(|(_, kind)| **kind == NodeKind::Output)
            .map(|(&label, _)| label)
            .collect();
        let fallback = products.keys().next_back().copied();
        let max_links = products.len() / 2;

        for &regulator in products.keys() {
            let n_links = self.rng.gen_range(0..=max_links);
            for _ in 0..n_links {
                let Some(regulated) = self.pick(&outputs).or(fallback) else {
                    break;
                };
                let edge = self.random_edge(regulator, regulated);
                genotype.try_connect(edge);
            }
        }

        genotype
    }

    // ========================================================================
    // Crossover
    // ========================================================================

    /// Label-based crossover producing two children.
    ///
    /// Common labels are either copied (each child keeps its own parent's
    /// node) or swapped; exclusive labels either stay with their parent's
    /// child or move to the other. Edges follow the regulated node and are
    /// rewired to a random node of the other parent's share when their
    /// regulator did not make it into the child. The first child is the one
    /// holding more of `parent1`.
    pub fn crossover(
        &mut self,
        parent1: &Genotype,
        parent2: &Genotype,
        node_cross_rate: f64,
    ) -> (Genotype, Genotype) {
        let labels1: BTreeSet<Label> = parent1.labels().collect();
        let labels2: BTreeSet<Label> = parent2.labels().collect();

        let common: Vec<Label> = labels1.intersection(&labels2).copied().collect();
        let only1: Vec<Label> = labels1.difference(&labels2).copied().collect();
        let only2: Vec<Label> = labels2.difference(&labels1).copied().collect();

        let (copied, swapped) = self.distribute(&common, node_cross_rate);
        let (one_to_one, one_to_two) = self.distribute(&only1, node_cross_rate);
        let (two_to_two, two_to_one) = self.distribute(&only2, node_cross_rate);

        let child1_from1: BTreeSet<Label> = copied.union(&one_to_one).copied().collect();
        let child1_from2: BTreeSet<Label> = swapped.union(&two_to_one).copied().collect();
        let child2_from2: BTreeSet<Label> = copied.union(&two_to_two).copied().collect();
        let child2_from1: BTreeSet<Label> = swapped.union(&one_to_two).copied().collect();

        let child1 = self.assemble(parent1, &child1_from1, parent2, &child1_from2);
        let child2 = self.assemble(parent2, &child2_from2, parent1, &child2_from1);

        if child1_from1.len() < child2_from1.len() {
            (child2, child1)
        } else {
            (child1, child2)
        }
    }

    fn distribute(&mut self, labels: &[Label], rate: f64) -> (BTreeSet<Label>, BTreeSet<Label>) {
        let mut first = BTreeSet::new();
        let mut second = BTreeSet::new();
        for &label in labels {
            if self.chance(rate) {
                first.insert(label);
            } else {
                second.insert(label);
            }
        }
        (first, second)
    }

    fn assemble(
        &mut self,
        a: &Genotype,
        from_a: &BTreeSet<Label>,
        b: &Genotype,
        from_b: &BTreeSet<Label>,
    ) -> Genotype {
        let mut child = Genotype::new();
        for node in from_a.iter().filter_map(|&label| a.node(label)) {
            child.insert_node(node.clone());
        }
        for node in from_b.iter().filter_map(|&label| b.node(label)) {
            child.insert_node(node.clone());
        }
        self.inherit_edges(&mut child, a, from_a, from_b);
        self.inherit_edges(&mut child, b, from_b, from_a);
        child
    }

    fn inherit_edges(
        &mut self,
        child: &mut Genotype,
        source: &Genotype,
        own: &BTreeSet<Label>,
        other: &BTreeSet<Label>,
    ) {
        let other: Vec<Label> = other.iter().copied().collect();
        for edge in source.edges().filter(|e| own.contains(&e.regulated)) {
            if child.contains(edge.regulator) {
                child.try_connect(edge.clone());
            } else if let Some(regulator) = self.pick(&other) {
                if !source.has_edge(regulator, edge.regulated)
                    && !child.has_edge(regulator, edge.regulated)
                {
                    child.try_connect(Edge {
                        regulator,
                        ..edge.clone()
                    });
                }
            }
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Structural and parameter mutation in a single pass over nodes, then
    /// edges. Both passes iterate over snapshots taken before the pass, so
    /// nodes and edges created on the way are not mutated again.
    pub fn mutate(&mut self, genotype: &mut Genotype, scope: &MutationScope, rates: &OperatorConfig) {
        let labels: Vec<Label> = genotype.labels().collect();
        for &label in labels.iter().rev() {
            if !genotype.contains(label) {
                continue;
            }
            if self.chance(rates.node_duplication_rate) {
                self.duplicate_node(genotype, label, scope);
            }
            if scope.is_removable(label) && self.chance(rates.node_removal_rate) {
                genotype.remove_node(label);
                continue;
            }
            if let Some(node) = genotype.node_mut(label) {
                self.randomize_node(node, rates.param_mutation_rate);
            }
        }

        let pairs: Vec<(Label, Label)> = genotype
            .edges()
            .map(|e| (e.regulator, e.regulated))
            .collect();
        for &(regulator, regulated) in pairs.iter().rev() {
            let Some(edge) = genotype.edge(regulator, regulated).cloned() else {
                continue;
            };
            if self.chance(rates.edge_duplication_rate) {
                self.duplicate_edge(genotype, &edge, scope, rates.param_mutation_rate);
            }
            if self.chance(rates.edge_removal_rate) {
                genotype.remove_edge(regulator, regulated);
            } else if let Some(edge) = genotype.edge_mut(regulator, regulated) {
                self.randomize_edge(edge, rates.param_mutation_rate);
            }
        }
    }

    /// Copy a node under a fresh label and wire it in with one random
    /// incoming and one random outgoing edge.
    fn duplicate_node(&mut self, genotype: &mut Genotype, label: Label, scope: &MutationScope) {
        let Some(source) = genotype.node(label).cloned() else {
            return;
        };
        let existing: Vec<Label> = genotype.labels().collect();
        let copy = self.fresh_label(genotype);
        genotype.insert_node(Node {
            label: copy,
            kind: NodeKind::Intermediate,
            ..source
        });

        if let Some(regulator) = self.pick(&existing) {
            let edge = self.random_edge(regulator, copy);
            genotype.try_connect(edge);
        }
        let targets = scope.regulatable(genotype);
        if let Some(regulated) = self.pick(&targets) {
            let edge = self.random_edge(copy, regulated);
            genotype.try_connect(edge);
        }
    }

    /// Copy an edge between a random regulator and a random regulatable
    /// node, replacing whatever edge was there, then perturb the copy.
    fn duplicate_edge(
        &mut self,
        genotype: &mut Genotype,
        edge: &Edge,
        scope: &MutationScope,
        rate: f64,
    ) {
        let labels: Vec<Label> = genotype.labels().collect();
        let targets = scope.regulatable(genotype);
        let (Some(regulator), Some(regulated)) = (self.pick(&labels), self.pick(&targets)) else {
            return;
        };
        let mut copy = Edge {
            regulator,
            regulated,
            ..edge.clone()
        };
        self.randomize_edge(&mut copy, rate);
        genotype.try_connect(copy);
    }

    /// Re-draw each parameter group with probability `rate`.
    fn randomize_node(&mut self, node: &mut Node, rate: f64) {
        if self.chance(rate) {
            node.limit = 100.0 * self.unit();
        }
        if self.chance(rate) {
            node.pos_limit = 0.1 * self.unit();
        }
        if self.chance(rate) {
            node.neg_limit = 0.1 * self.unit();
        }
        if self.chance(rate) {
            node.degradation = 0.1 + 0.9 * self.unit();
            node.intrinsic_growth = 0.01 * self.unit();
        }
    }

    fn randomize_edge(&mut self, edge: &mut Edge, rate: f64) {
        if self.chance(rate) {
            edge.dis_const = 0.01 + 99.99 * self.unit();
        }
        if self.chance(rate) {
            let magnitude = self.rng.gen_range(1.0..=10.0);
            edge.hill = if self.rng.gen_bool(0.5) {
                magnitude
            } else {
                -magnitude
            };
        }
        if self.chance(rate) {
            edge.is_and = !edge.is_and;
        }
        if self.chance(rate) {
            edge.is_positive = !edge.is_positive;
        }
    }
}

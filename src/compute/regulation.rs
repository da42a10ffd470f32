//! Regulation expressions compiled from a genotype's incoming edges.
//!
//! Each regulated node gets a short program of [`RegulationOp`]s that
//! writes its regulation factor. With `x = (c / K)^n` for a regulator at
//! concentration `c`, dissociation constant `K` and Hill coefficient `n`:
//!
//! - OR activators accumulate `r = r + x + r·x`, i.e. `(1 + r)(1 + x) - 1`
//! - AND activators multiply `r = r·x`
//! - every edge then divides `r = r / (1 + x)` with `n = |hill|`
//!
//! A single activator therefore yields the Hill function `x / (1 + x)`
//! and a lone repressor `1 / (1 + x)`.

use std::collections::BTreeMap;

use crate::schema::{Genotype, Label};

/// One step of a regulation program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegulationOp {
    /// `r = 0`.
    Zero { to: usize },
    /// `r = 1`.
    One { to: usize },
    /// `r = r + x + r·x`.
    Or {
        from: usize,
        to: usize,
        dis_const: f64,
        hill: f64,
    },
    /// `r = r·x`.
    And {
        from: usize,
        to: usize,
        dis_const: f64,
        hill: f64,
    },
    /// `r = r / (1 + x)`.
    Div {
        from: usize,
        to: usize,
        dis_const: f64,
        hill: f64,
    },
}

#[inline]
fn occupancy(concentration: f64, dis_const: f64, hill: f64) -> f64 {
    (concentration / dis_const).powf(hill)
}

impl RegulationOp {
    /// Apply the op, reading regulator concentrations from `concs`.
    #[inline]
    pub fn apply(&self, concs: &[f64], regulation: &mut [f64]) {
        match *self {
            Self::Zero { to } => regulation[to] = 0.0,
            Self::One { to } => regulation[to] = 1.0,
            Self::Or {
                from,
                to,
                dis_const,
                hill,
            } => {
                let x = occupancy(concs[from], dis_const, hill);
                let r = regulation[to];
                regulation[to] = r + x + r * x;
            }
            Self::And {
                from,
                to,
                dis_const,
                hill,
            } => {
                regulation[to] *= occupancy(concs[from], dis_const, hill);
            }
            Self::Div {
                from,
                to,
                dis_const,
                hill,
            } => {
                regulation[to] /= 1.0 + occupancy(concs[from], dis_const, hill);
            }
        }
    }
}

/// Compiled regulation of every simulated node.
#[derive(Debug, Clone, Default)]
pub struct RegulationProgram {
    ops: Vec<RegulationOp>,
}

impl RegulationProgram {
    /// Compile the program for the nodes in `index` (label to state slot).
    ///
    /// Only edges whose regulator is also simulated are considered. Within
    /// a node, OR activators come first, then AND activators, then the
    /// AND divisions, then the OR divisions.
    pub fn compile(genotype: &Genotype, index: &BTreeMap<Label, usize>) -> Self {
        let mut slots: Vec<(usize, Label)> = index.iter().map(|(&l, &i)| (i, l)).collect();
        slots.sort_unstable();

        let mut ops = Vec::new();
        for (to, label) in slots {
            let (and_edges, or_edges): (Vec<_>, Vec<_>) = genotype
                .incoming(label)
                .filter_map(|edge| index.get(&edge.regulator).map(|&from| (from, edge)))
                .partition(|(_, edge)| edge.is_and);

            if or_edges.is_empty() && and_edges.is_empty() {
                ops.push(RegulationOp::Zero { to });
                continue;
            }

            let mut started = false;
            for &(from, edge) in or_edges.iter().filter(|(_, e)| e.is_activator()) {
                if !started {
                    ops.push(RegulationOp::Zero { to });
                    started = true;
                }
                ops.push(RegulationOp::Or {
                    from,
                    to,
                    dis_const: edge.dis_const,
                    hill: edge.hill,
                });
            }
            for &(from, edge) in and_edges.iter().filter(|(_, e)| e.is_activator()) {
                if !started {
                    ops.push(RegulationOp::One { to });
                    started = true;
                }
                ops.push(RegulationOp::And {
                    from,
                    to,
                    dis_const: edge.dis_const,
                    hill: edge.hill,
                });
            }
            // No activator: full derepression before dividing.
            if !started {
                ops.push(RegulationOp::One { to });
            }

            for &(from, edge) in and_edges.iter().chain(or_edges.iter()) {
                ops.push(RegulationOp::Div {
                    from,
                    to,
                    dis_const: edge.dis_const,
                    hill: edge.hill.abs(),
                });
            }
        }

        Self { ops }
    }

    /// Recompute all regulation factors from the given concentrations.
    #[inline]
    pub fn evaluate(&self, concs: &[f64], regulation: &mut [f64]) {
        for op in &self.ops {
            op.apply(concs, regulation);
        }
    }

    pub fn ops(&self) -> &[RegulationOp] {
        &self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Edge, Node, NodeKind};

    fn node(label: Label) -> Node {
        Node {
            label,
            init: 0.0,
            limit: 1.0,
            pos_limit: 0.0,
            neg_limit: 0.0,
            degradation: 0.1,
            intrinsic_growth: 0.0,
            kind: NodeKind::Intermediate,
        }
    }

    fn edge(regulator: Label, regulated: Label, hill: f64, is_and: bool) -> Edge {
        Edge {
            regulator,
            regulated,
            dis_const: 2.0,
            hill,
            is_and,
            is_positive: hill >= 0.0,
        }
    }

    /// Node 3 regulated by nodes 1 and 2, evaluated at c1 = 2, c2 = 4.
    fn regulate(edges: &[Edge]) -> f64 {
        let mut g = Genotype::new();
        for label in 1..=3 {
            g.insert_node(node(label));
        }
        for e in edges {
            g.insert_edge(e.clone()).unwrap();
        }
        let index: BTreeMap<Label, usize> = [(1, 0), (2, 1), (3, 2)].into_iter().collect();
        let program = RegulationProgram::compile(&g, &index);
        let concs = [2.0, 4.0, 0.0];
        let mut regulation = [f64::NAN; 3];
        program.evaluate(&concs, &mut regulation);
        regulation[2]
    }

    // x1 = (2/2)^1 = 1, x2 = (4/2)^1 = 2 in all cases below.

    #[test]
    fn test_no_edges_is_zero() {
        assert_eq!(regulate(&[]), 0.0);
    }

    #[test]
    fn test_single_activator_is_hill() {
        let r = regulate(&[edge(2, 3, 1.0, false)]);
        assert!((r - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_repressor() {
        let r = regulate(&[edge(2, 3, -1.0, false)]);
        assert!((r - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_or_activators() {
        // (x1 + x2 + x1 x2) / ((1 + x1)(1 + x2)) = 5 / 6
        let r = regulate(&[edge(1, 3, 1.0, false), edge(2, 3, 1.0, false)]);
        assert!((r - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_and_activators() {
        // x1 x2 / ((1 + x1)(1 + x2)) = 2 / 6
        let r = regulate(&[edge(1, 3, 1.0, true), edge(2, 3, 1.0, true)]);
        assert!((r - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_or_then_and() {
        // OR starts at 0: r = x1 = 1, AND: r = 1 * x2 = 2, divisions by 2 * 3.
        let r = regulate(&[edge(1, 3, 1.0, false), edge(2, 3, 1.0, true)]);
        assert!((r - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_and_repressors_only() {
        // No activator: r = 1, then 1 / ((1 + x1)(1 + x2)) = 1 / 6
        let r = regulate(&[edge(1, 3, -1.0, true), edge(2, 3, -1.0, true)]);
        assert!((r - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_and_activator_with_or_repressor() {
        // r = 1 * x1 = 1, divided by (1 + x1)(1 + x2) = 6
        let r = regulate(&[edge(1, 3, 1.0, true), edge(2, 3, -1.0, false)]);
        assert!((r - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_unsimulated_regulator_ignored() {
        let mut g = Genotype::new();
        g.insert_node(node(1));
        g.insert_node(node(2));
        g.insert_edge(edge(1, 2, 1.0, false)).unwrap();
        let index: BTreeMap<Label, usize> = [(2, 0)].into_iter().collect();
        let program = RegulationProgram::compile(&g, &index);
        assert_eq!(program.ops(), &[RegulationOp::Zero { to: 0 }]);
    }
}

//! Gene regulatory network genotype.
//!
//! A [`Genotype`] owns its nodes ("products") and edges ("links") in
//! label-indexed maps. Edges refer to nodes by label only, and every edge
//! endpoint is guaranteed to exist as a node of the same genotype.
//!
//! The textual form is `(node|node|...*edge|edge|...)` where a node is
//! `label init limit pos_limit neg_limit degradation intrinsic_growth kind`
//! and an edge is `regulator regulated dis_const hill is_and is_positive`
//! with the flags written as `0`/`1`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Node identifier, unique within one genotype.
pub type Label = u32;

/// Role of a node in the network and in the experiments.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Input whose production rate is imposed by the experiment.
    ConstantRate,
    /// Input whose concentration is imposed by the experiment.
    FixedConcentration,
    /// Measured output the model must reproduce.
    Output,
    /// Hidden node introduced by evolution.
    #[default]
    Intermediate,
}

impl NodeKind {
    /// Integer code used by the text format.
    pub fn code(self) -> u8 {
        match self {
            Self::ConstantRate => 0,
            Self::FixedConcentration => 1,
            Self::Output => 2,
            Self::Intermediate => 3,
        }
    }

    /// Inverse of [`NodeKind::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ConstantRate),
            1 => Some(Self::FixedConcentration),
            2 => Some(Self::Output),
            3 => Some(Self::Intermediate),
            _ => None,
        }
    }

    /// Inputs are driven by the experiment rather than by regulation.
    pub fn is_input(self) -> bool {
        matches!(self, Self::ConstantRate | Self::FixedConcentration)
    }

    /// Features are the nodes that appear in experiments.
    pub fn is_feature(self) -> bool {
        self != Self::Intermediate
    }
}

/// A modeled molecular species.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub label: Label,
    /// Initial concentration.
    pub init: f64,
    /// Maximum synthesis rate.
    pub limit: f64,
    pub pos_limit: f64,
    pub neg_limit: f64,
    /// Degradation rate.
    pub degradation: f64,
    pub intrinsic_growth: f64,
    pub kind: NodeKind,
}

/// A Hill-kinetics regulatory relationship between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub regulator: Label,
    pub regulated: Label,
    /// Dissociation constant, always positive.
    pub dis_const: f64,
    /// Signed Hill coefficient; negative values repress.
    pub hill: f64,
    /// Combined with the other AND edges of the regulated node.
    pub is_and: bool,
    /// Display sign, independent of the Hill coefficient.
    pub is_positive: bool,
}

impl Edge {
    /// Non-negative Hill coefficients activate.
    pub fn is_activator(&self) -> bool {
        self.hill >= 0.0
    }
}

/// Genotype construction and parsing errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenotypeError {
    #[error("Genotype text must be enclosed in parentheses with a '*' separator")]
    MissingDelimiters,
    #[error("Expected {expected} fields for a {item}, found {found}")]
    FieldCount {
        item: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Invalid value '{value}' for {field}")]
    InvalidField { field: &'static str, value: String },
    #[error("Unknown node kind code {0}")]
    UnknownKind(u8),
    #[error("Node {0} appears more than once")]
    DuplicateNode(Label),
    #[error("Edge {regulator} -> {regulated} references a missing node")]
    DanglingEdge { regulator: Label, regulated: Label },
}

/// Nodes and edges of one network model.
///
/// Edges are keyed by `(regulated, regulator)` so the incoming edges of a
/// node are contiguous.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Genotype {
    nodes: BTreeMap<Label, Node>,
    edges: BTreeMap<(Label, Label), Edge>,
}

impl Genotype {
    /// Empty genotype.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, label: Label) -> Option<&Node> {
        self.nodes.get(&label)
    }

    pub fn node_mut(&mut self, label: Label) -> Option<&mut Node> {
        self.nodes.get_mut(&label)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.nodes.contains_key(&label)
    }

    /// Nodes in label order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Labels in ascending order.
    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.nodes.keys().copied()
    }

    /// Edges grouped by regulated node.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn edge(&self, regulator: Label, regulated: Label) -> Option<&Edge> {
        self.edges.get(&(regulated, regulator))
    }

    pub fn edge_mut(&mut self, regulator: Label, regulated: Label) -> Option<&mut Edge> {
        self.edges.get_mut(&(regulated, regulator))
    }

    pub fn has_edge(&self, regulator: Label, regulated: Label) -> bool {
        self.edges.contains_key(&(regulated, regulator))
    }

    /// Edges whose regulated node is `label`, ordered by regulator.
    pub fn incoming(&self, label: Label) -> impl Iterator<Item = &Edge> {
        self.edges
            .range((label, Label::MIN)..=(label, Label::MAX))
            .map(|(_, edge)| edge)
    }

    /// Insert or replace a node. Existing edges are untouched.
    pub fn insert_node(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.label, node)
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, label: Label) -> Option<Node> {
        let node = self.nodes.remove(&label)?;
        self.edges
            .retain(|&(regulated, regulator), _| regulated != label && regulator != label);
        Some(node)
    }

    /// Insert an edge, replacing the one between the same pair if present.
    pub fn insert_edge(&mut self, edge: Edge) -> Result<Option<Edge>, GenotypeError> {
        if !self.contains(edge.regulator) || !self.contains(edge.regulated) {
            return Err(GenotypeError::DanglingEdge {
                regulator: edge.regulator,
                regulated: edge.regulated,
            });
        }
        Ok(self.edges.insert((edge.regulated, edge.regulator), edge))
    }

    /// Insert the edge only if both endpoints exist.
    pub fn try_connect(&mut self, edge: Edge) -> bool {
        if self.contains(edge.regulator) && self.contains(edge.regulated) {
            self.edges.insert((edge.regulated, edge.regulator), edge);
            true
        } else {
            false
        }
    }

    pub fn remove_edge(&mut self, regulator: Label, regulated: Label) -> Option<Edge> {
        self.edges.remove(&(regulated, regulator))
    }

    /// Labels an output depends on, following edges from regulated to
    /// regulator until nothing new is found.
    ///
    /// With `include_all_features` every input and output node seeds the
    /// search as well.
    pub fn labels_in_use(&self, include_all_features: bool) -> BTreeSet<Label> {
        let mut in_use: BTreeSet<Label> = self
            .nodes
            .values()
            .filter(|node| {
                node.kind == NodeKind::Output || (include_all_features && node.kind.is_feature())
            })
            .map(|node| node.label)
            .collect();

        let mut pending: VecDeque<Label> = in_use.iter().copied().collect();
        while let Some(label) = pending.pop_front() {
            for edge in self.incoming(label) {
                if in_use.insert(edge.regulator) {
                    pending.push_back(edge.regulator);
                }
            }
        }

        in_use
    }

    /// One unit per node and per edge.
    pub fn complexity(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// Complexity of the subgraph an output depends on.
    pub fn complexity_in_use(&self, include_all_features: bool) -> usize {
        let in_use = self.labels_in_use(include_all_features);
        let n_edges = self
            .edges
            .values()
            .filter(|edge| in_use.contains(&edge.regulator) && in_use.contains(&edge.regulated))
            .count();
        in_use.len() + n_edges
    }

    /// Verify that every edge endpoint exists.
    pub fn check_integrity(&self) -> Result<(), GenotypeError> {
        match self
            .edges
            .values()
            .find(|edge| !self.contains(edge.regulator) || !self.contains(edge.regulated))
        {
            Some(edge) => Err(GenotypeError::DanglingEdge {
                regulator: edge.regulator,
                regulated: edge.regulated,
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Text Format
// ============================================================================

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {}",
            self.label,
            self.init,
            self.limit,
            self.pos_limit,
            self.neg_limit,
            self.degradation,
            self.intrinsic_growth,
            self.kind.code()
        )
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.regulator,
            self.regulated,
            self.dis_const,
            self.hill,
            u8::from(self.is_and),
            u8::from(self.is_positive)
        )
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, node) in self.nodes.values().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{node}")?;
        }
        f.write_str("*")?;
        for (i, edge) in self.edges.values().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{edge}")?;
        }
        f.write_str(")")
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, GenotypeError> {
    value.parse().map_err(|_| GenotypeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, GenotypeError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(GenotypeError::InvalidField {
            field,
            value: value.to_string(),
        }),
    }
}

impl FromStr for Node {
    type Err = GenotypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 8 {
            return Err(GenotypeError::FieldCount {
                item: "node",
                expected: 8,
                found: fields.len(),
            });
        }
        let code: u8 = parse_field("kind", fields[7])?;
        Ok(Self {
            label: parse_field("label", fields[0])?,
            init: parse_field("init", fields[1])?,
            limit: parse_field("limit", fields[2])?,
            pos_limit: parse_field("pos_limit", fields[3])?,
            neg_limit: parse_field("neg_limit", fields[4])?,
            degradation: parse_field("degradation", fields[5])?,
            intrinsic_growth: parse_field("intrinsic_growth", fields[6])?,
            kind: NodeKind::from_code(code).ok_or(GenotypeError::UnknownKind(code))?,
        })
    }
}

impl FromStr for Edge {
    type Err = GenotypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(GenotypeError::FieldCount {
                item: "edge",
                expected: 6,
                found: fields.len(),
            });
        }
        Ok(Self {
            regulator: parse_field("regulator", fields[0])?,
            regulated: parse_field("regulated", fields[1])?,
            dis_const: parse_field("dis_const", fields[2])?,
            hill: parse_field("hill", fields[3])?,
            is_and: parse_flag("is_and", fields[4])?,
            is_positive: parse_flag("is_positive", fields[5])?,
        })
    }
}

impl FromStr for Genotype {
    type Err = GenotypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or(GenotypeError::MissingDelimiters)?;
        let (nodes, edges) = body
            .split_once('*')
            .ok_or(GenotypeError::MissingDelimiters)?;

        let mut genotype = Genotype::new();
        for item in nodes.split('|').filter(|item| !item.trim().is_empty()) {
            let node: Node = item.parse()?;
            let label = node.label;
            if genotype.insert_node(node).is_some() {
                return Err(GenotypeError::DuplicateNode(label));
            }
        }
        for item in edges.split('|').filter(|item| !item.trim().is_empty()) {
            genotype.insert_edge(item.parse()?)?;
        }
        Ok(genotype)
    }
}

impl From<Genotype> for String {
    fn from(genotype: Genotype) -> Self {
        genotype.to_string()
    }
}

impl TryFrom<String> for Genotype {
    type Error = GenotypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

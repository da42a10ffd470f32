//! Experimental time series the models are fitted to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Label, NodeKind};

/// One measured (or imposed) concentration of a node at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observed node.
    pub label: Label,
    /// Role of the node in this experiment.
    pub kind: NodeKind,
    pub time: f64,
    pub concentration: f64,
    /// Linear production rate until the next observation of the same node.
    /// Derived on load for constant-rate and output nodes.
    #[serde(skip)]
    pub const_rate: f64,
}

impl Observation {
    pub fn new(label: Label, kind: NodeKind, time: f64, concentration: f64) -> Self {
        Self {
            label,
            kind,
            time,
            concentration,
            const_rate: 0.0,
        }
    }

    fn has_rate(&self) -> bool {
        matches!(self.kind, NodeKind::ConstantRate | NodeKind::Output)
    }
}

#[derive(Deserialize)]
struct ExperimentRepr {
    id: u32,
    #[serde(default)]
    name: String,
    observations: Vec<Observation>,
}

/// Time-ordered observations of one experimental condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ExperimentRepr")]
pub struct Experiment {
    pub id: u32,
    pub name: String,
    observations: Vec<Observation>,
}

impl From<ExperimentRepr> for Experiment {
    fn from(repr: ExperimentRepr) -> Self {
        Self::new(repr.id, repr.name, repr.observations)
    }
}

impl Experiment {
    /// Order observations by time and derive the per-node linear rates.
    pub fn new(id: u32, name: impl Into<String>, mut observations: Vec<Observation>) -> Self {
        observations.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut by_label: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
        for (i, obs) in observations.iter().enumerate() {
            if obs.has_rate() {
                by_label.entry(obs.label).or_default().push(i);
            }
        }

        for indices in by_label.values() {
            let mut previous = 0.0;
            for (k, &i) in indices.iter().enumerate() {
                let rate = match indices.get(k + 1) {
                    Some(&next) => {
                        let span = observations[next].time - observations[i].time;
                        if span > 0.0 {
                            (observations[next].concentration - observations[i].concentration)
                                / span
                        } else {
                            0.0
                        }
                    }
                    None => previous,
                };
                observations[i].const_rate = rate;
                previous = rate;
            }
        }

        Self {
            id,
            name: name.into(),
            observations,
        }
    }

    /// Observations in time order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Time of the first observation.
    pub fn start_time(&self) -> f64 {
        self.observations.first().map_or(0.0, |obs| obs.time)
    }

    /// Span between the first and last observation.
    pub fn time_period(&self) -> f64 {
        self.observations
            .last()
            .map_or(0.0, |obs| obs.time - self.start_time())
    }

    /// Distinct labels observed, ascending.
    pub fn labels(&self) -> BTreeSet<Label> {
        self.observations.iter().map(|obs| obs.label).collect()
    }

    /// Distinct labels observed, with the kind each plays.
    pub fn products(&self) -> BTreeMap<Label, NodeKind> {
        self.observations
            .iter()
            .map(|obs| (obs.label, obs.kind))
            .collect()
    }

    /// Largest observed concentration of a node.
    pub fn max_concentration(&self, label: Label) -> Option<f64> {
        self.observations
            .iter()
            .filter(|obs| obs.label == label)
            .map(|obs| obs.concentration)
            .reduce(f64::max)
    }
}

/// Experiment set errors.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("At least one training experiment is required")]
    NoExperiments,
    #[error("Training experiments observe no output node")]
    NoOutputs,
    #[error("Node {label} is observed as both {first:?} and {second:?}")]
    ConflictingKind {
        label: Label,
        first: NodeKind,
        second: NodeKind,
    },
    #[error("Duplicate experiment id {0}")]
    DuplicateId(u32),
}

/// Training experiments scored during the search, plus held-out
/// validation experiments used only for reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSet {
    pub training: Vec<Experiment>,
    #[serde(default)]
    pub validation: Vec<Experiment>,
}

impl ExperimentSet {
    pub fn new(training: Vec<Experiment>) -> Self {
        Self {
            training,
            validation: Vec::new(),
        }
    }

    pub fn with_validation(mut self, validation: Vec<Experiment>) -> Self {
        self.validation = validation;
        self
    }

    /// Check kinds are consistent and that something can be scored.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.training.is_empty() {
            return Err(ExperimentError::NoExperiments);
        }
        let mut ids = BTreeSet::new();
        for exp in self.training.iter().chain(&self.validation) {
            if !ids.insert(exp.id) {
                return Err(ExperimentError::DuplicateId(exp.id));
            }
        }
        let mut kinds: BTreeMap<Label, NodeKind> = BTreeMap::new();
        for obs in self
            .training
            .iter()
            .chain(&self.validation)
            .flat_map(|exp| exp.observations())
        {
            match kinds.get(&obs.label) {
                Some(&first) if first != obs.kind => {
                    return Err(ExperimentError::ConflictingKind {
                        label: obs.label,
                        first,
                        second: obs.kind,
                    });
                }
                _ => {
                    kinds.insert(obs.label, obs.kind);
                }
            }
        }
        if self.output_labels().is_empty() {
            return Err(ExperimentError::NoOutputs);
        }
        Ok(())
    }

    /// Every node observed in the training experiments.
    pub fn products(&self) -> BTreeMap<Label, NodeKind> {
        self.training
            .iter()
            .flat_map(|exp| exp.products())
            .collect()
    }

    /// Labels of input nodes (constant-rate or fixed-concentration).
    pub fn input_labels(&self) -> Vec<Label> {
        self.products()
            .into_iter()
            .filter(|(_, kind)| kind.is_input())
            .map(|(label, _)| label)
            .collect()
    }

    pub fn output_labels(&self) -> Vec<Label> {
        self.products()
            .into_iter()
            .filter(|(_, kind)| *kind == NodeKind::Output)
            .map(|(label, _)| label)
            .collect()
    }

    /// Largest label observed. Nodes above it were added by evolution.
    pub fn max_label(&self) -> Label {
        self.products().keys().next_back().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observations_sorted() {
        let exp = Experiment::new(
            1,
            "sorted",
            vec![
                Observation::new(2, NodeKind::Output, 5.0, 1.0),
                Observation::new(2, NodeKind::Output, 0.0, 0.0),
            ],
        );
        assert_eq!(exp.observations()[0].time, 0.0);
        assert_eq!(exp.time_period(), 5.0);
        assert_eq!(exp.labels().into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_linear_rates() {
        let exp = Experiment::new(
            1,
            "rates",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(1, NodeKind::ConstantRate, 2.0, 4.0),
                Observation::new(1, NodeKind::ConstantRate, 4.0, 5.0),
                Observation::new(3, NodeKind::FixedConcentration, 0.0, 9.0),
                Observation::new(3, NodeKind::FixedConcentration, 4.0, 1.0),
            ],
        );
        let rates: Vec<(Label, f64)> = exp
            .observations()
            .iter()
            .map(|o| (o.label, o.const_rate))
            .collect();
        assert_eq!(
            rates,
            vec![(1, 2.0), (3, 0.0), (1, 0.5), (1, 0.5), (3, 0.0)]
        );
    }

    #[test]
    fn test_single_observation_rate_is_zero() {
        let exp = Experiment::new(
            1,
            "single",
            vec![Observation::new(1, NodeKind::ConstantRate, 1.0, 3.0)],
        );
        assert_eq!(exp.observations()[0].const_rate, 0.0);
    }

    #[test]
    fn test_rates_recomputed_on_deserialize() {
        let json = r#"{"id": 4, "observations": [
            {"label": 1, "kind": "output", "time": 0.0, "concentration": 1.0},
            {"label": 1, "kind": "output", "time": 2.0, "concentration": 3.0}
        ]}"#;
        let exp: Experiment = serde_json::from_str(json).unwrap();
        assert_eq!(exp.observations()[0].const_rate, 1.0);
        assert_eq!(exp.observations()[1].const_rate, 1.0);
    }

    #[test]
    fn test_set_labels() {
        let set = ExperimentSet::new(vec![Experiment::new(
            1,
            "labels",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(2, NodeKind::FixedConcentration, 0.0, 1.0),
                Observation::new(3, NodeKind::Output, 0.0, 0.0),
            ],
        )]);
        assert!(set.validate().is_ok());
        assert_eq!(set.input_labels(), vec![1, 2]);
        assert_eq!(set.output_labels(), vec![3]);
        assert_eq!(set.max_label(), 3);
    }

    #[test]
    fn test_set_rejects_conflicting_kinds() {
        let set = ExperimentSet::new(vec![
            Experiment::new(1, "a", vec![Observation::new(1, NodeKind::Output, 0.0, 0.0)]),
            Experiment::new(
                2,
                "b",
                vec![Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0)],
            ),
        ]);
        assert!(matches!(
            set.validate(),
            Err(ExperimentError::ConflictingKind { label: 1, .. })
        ));
    }
}

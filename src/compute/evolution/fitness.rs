//! Error evaluation of genotypes against experiments.
//!
//! The error of one experiment is the root-mean-square deviation over its
//! output observations, each deviation first reduced by the local
//! threshold. Experiment errors are reduced by the experiment threshold
//! and averaged; the global threshold is subtracted from the average.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compute::{Divergence, ExperimentSimulator};
use crate::schema::{
    Experiment, ExperimentSet, Genotype, NodeKind, Observation, SimParams, ValidationReport,
};

/// Penalty for an observed output the model does not simulate.
const MISSING_OUTPUT_DISTANCE: f64 = 10.0;

/// Outcome of evaluating one genotype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// Aggregate error, lower is better.
    Scored(f64),
    /// The simulation diverged; the genotype is not viable.
    Diverged(Divergence),
}

impl Evaluation {
    /// Error used for selection. Diverged genotypes rank last.
    pub fn error(&self) -> f64 {
        match self {
            Self::Scored(error) => *error,
            Self::Diverged(_) => f64::INFINITY,
        }
    }

    pub fn is_viable(&self) -> bool {
        matches!(self, Self::Scored(_))
    }
}

impl From<Result<f64, Divergence>> for Evaluation {
    fn from(result: Result<f64, Divergence>) -> Self {
        match result {
            Ok(error) => Self::Scored(error),
            Err(divergence) => Self::Diverged(divergence),
        }
    }
}

/// Anything the evaluation workers can score genotypes with.
pub trait Evaluate: Send + 'static {
    /// Score a genotype. Evaluation may stop early once the error is known
    /// to exceed `max_error`.
    fn evaluate(&mut self, genotype: &Genotype, max_error: f64) -> Evaluation;
}

/// Scores genotypes against the training experiments.
///
/// Owns its simulator; create one per worker thread.
pub struct ExperimentEvaluator {
    experiments: Arc<ExperimentSet>,
    params: SimParams,
    simulator: ExperimentSimulator,
}

impl ExperimentEvaluator {
    /// Create a new evaluator.
    pub fn new(experiments: Arc<ExperimentSet>, params: SimParams) -> Self {
        let simulator = ExperimentSimulator::new(params.integrator.clone());
        Self {
            experiments,
            params,
            simulator,
        }
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    fn load(&mut self, genotype: &Genotype) {
        self.simulator
            .load(genotype, self.params.include_all_features);
    }

    /// Aggregate error over the training experiments.
    ///
    /// Stops as soon as the running error exceeds `max_error`; the partial
    /// error returned then is already larger than the bound.
    pub fn aggregate_error(
        &mut self,
        genotype: &Genotype,
        max_error: f64,
    ) -> Result<f64, Divergence> {
        self.load(genotype);
        let experiments = Arc::clone(&self.experiments);
        let n = experiments.training.len() as f64;

        let mut error = 0.0;
        for exp in &experiments.training {
            if error - self.params.global_threshold > max_error {
                break;
            }
            let exp_error = self.experiment_error(exp)?;
            error += (exp_error - self.params.experiment_threshold).max(0.0) / n;
        }
        Ok((error - self.params.global_threshold).max(0.0))
    }

    /// Root-mean-square distance over the output observations of one
    /// experiment, for the currently loaded genotype.
    fn experiment_error(&mut self, exp: &Experiment) -> Result<f64, Divergence> {
        let mut sum = 0.0;
        let mut n = 0usize;
        let local = self.params.local_threshold;
        self.trace_outputs(exp, |obs, simulated| {
            sum += match simulated {
                Some(c) => ((c - obs.concentration).abs() - local).max(0.0).powi(2),
                None => MISSING_OUTPUT_DISTANCE,
            };
            n += 1;
        })?;
        Ok(if n > 0 { (sum / n as f64).sqrt() } else { 0.0 })
    }

    /// Replay an experiment and report the simulated concentration at every
    /// output observation with positive time.
    fn trace_outputs<F>(&mut self, exp: &Experiment, mut visit: F) -> Result<(), Divergence>
    where
        F: FnMut(&Observation, Option<f64>),
    {
        self.simulator.initialize(exp);
        let mut t = self.simulator.time();
        for obs in exp.observations() {
            if obs.kind != NodeKind::Output || obs.time <= 0.0 {
                continue;
            }
            let gap = obs.time - t;
            if gap > 0.0 {
                self.simulator.simulate(exp, gap)?;
                t = obs.time;
            }
            visit(obs, self.simulator.state().concentration(obs.label));
        }
        Ok(())
    }

    /// Per-experiment error of a genotype keyed by experiment id, after the
    /// experiment threshold. Diverged experiments carry the sentinel.
    pub fn error_table(&mut self, genotype: &Genotype) -> BTreeMap<u32, f64> {
        self.load(genotype);
        let experiments = Arc::clone(&self.experiments);
        experiments
            .training
            .iter()
            .map(|exp| {
                let error = match self.experiment_error(exp) {
                    Ok(e) => (e - self.params.experiment_threshold).max(0.0),
                    Err(divergence) => divergence.sentinel(),
                };
                (exp.id, error)
            })
            .collect()
    }

    /// Fit on the validation experiments, `None` if there is nothing to score.
    pub fn validation_report(
        &mut self,
        genotype: &Genotype,
    ) -> Result<Option<ValidationReport>, Divergence> {
        self.load(genotype);
        let experiments = Arc::clone(&self.experiments);

        let mut pairs: Vec<(f64, f64)> = Vec::new();
        for exp in &experiments.validation {
            self.trace_outputs(exp, |obs, simulated| {
                pairs.push((obs.concentration, simulated.unwrap_or(0.0)));
            })?;
        }
        if pairs.is_empty() {
            return Ok(None);
        }

        let n = pairs.len() as f64;
        let ss_res: f64 = pairs.iter().map(|(o, s)| (s - o).powi(2)).sum();
        let mean = pairs.iter().map(|(o, _)| o).sum::<f64>() / n;
        let ss_tot: f64 = pairs.iter().map(|(o, _)| (o - mean).powi(2)).sum();
        let r_squared = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Ok(Some(ValidationReport {
            rmse: (ss_res / n).sqrt(),
            r_squared,
            n_points: pairs.len(),
        }))
    }
}

impl Evaluate for ExperimentEvaluator {
    fn evaluate(&mut self, genotype: &Genotype, max_error: f64) -> Evaluation {
        let evaluation = Evaluation::from(self.aggregate_error(genotype, max_error));
        if let Evaluation::Diverged(divergence) = &evaluation {
            log::debug!("Genotype diverged: {divergence}");
        }
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Edge, Node};

    /// Input 1 (constant rate 0) activates output 2 with degradation 0.1.
    fn two_node() -> Genotype {
        let mut g = Genotype::new();
        g.insert_node(Node {
            label: 1,
            init: 0.0,
            limit: 1.0,
            pos_limit: 0.0,
            neg_limit: 0.0,
            degradation: 0.1,
            intrinsic_growth: 0.0,
            kind: NodeKind::ConstantRate,
        });
        g.insert_node(Node {
            label: 2,
            init: 0.0,
            limit: 1.0,
            pos_limit: 0.0,
            neg_limit: 0.0,
            degradation: 0.1,
            intrinsic_growth: 0.0,
            kind: NodeKind::Output,
        });
        g.insert_edge(Edge {
            regulator: 1,
            regulated: 2,
            dis_const: 5.0,
            hill: 2.0,
            is_and: false,
            is_positive: true,
        })
        .unwrap();
        g
    }

    fn experiment(id: u32, final_conc: f64) -> Experiment {
        Experiment::new(
            id,
            "two-node",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(2, NodeKind::Output, 0.0, 0.0),
                Observation::new(2, NodeKind::Output, 10.0, final_conc),
            ],
        )
    }

    fn evaluator(experiments: Vec<Experiment>, params: SimParams) -> ExperimentEvaluator {
        ExperimentEvaluator::new(Arc::new(ExperimentSet::new(experiments)), params)
    }

    #[test]
    fn test_matching_data_scores_zero() {
        let mut eval = evaluator(vec![experiment(1, 0.0)], SimParams::default());
        assert_eq!(eval.evaluate(&two_node(), f64::INFINITY), Evaluation::Scored(0.0));
    }

    #[test]
    fn test_deviation_scores_positive() {
        let mut eval = evaluator(vec![experiment(1, 3.0)], SimParams::default());
        let error = eval.evaluate(&two_node(), f64::INFINITY).error();
        assert!((error - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_local_threshold_absorbs_small_deviation() {
        let params = SimParams {
            local_threshold: 0.5,
            ..Default::default()
        };
        let mut eval = evaluator(vec![experiment(1, 0.4)], params.clone());
        assert_eq!(eval.evaluate(&two_node(), f64::INFINITY).error(), 0.0);

        let mut eval = evaluator(vec![experiment(1, 2.0)], params);
        let error = eval.evaluate(&two_node(), f64::INFINITY).error();
        assert!((error - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_experiment_and_global_thresholds() {
        let params = SimParams {
            experiment_threshold: 1.0,
            global_threshold: 0.5,
            ..Default::default()
        };
        // Experiment errors 3 and 5 -> (2 + 4) / 2 = 3 -> 2.5
        let mut eval = evaluator(vec![experiment(1, 3.0), experiment(2, 5.0)], params);
        let error = eval.evaluate(&two_node(), f64::INFINITY).error();
        assert!((error - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_bound_short_circuits() {
        let mut eval = evaluator(
            vec![experiment(1, 4.0), experiment(2, 0.0), experiment(3, 0.0)],
            SimParams::default(),
        );
        let full = eval.evaluate(&two_node(), f64::INFINITY).error();
        assert!((full - 4.0 / 3.0).abs() < 1e-9);
        // The first experiment alone already exceeds the bound.
        let partial = eval.evaluate(&two_node(), 1.0).error();
        assert!((partial - 4.0 / 3.0).abs() < 1e-9);
        assert!(partial > 1.0);
    }

    #[test]
    fn test_missing_output_penalized() {
        let mut g = two_node();
        g.remove_node(2);
        let mut eval = evaluator(vec![experiment(1, 0.0)], SimParams::default());
        let error = eval.evaluate(&g, f64::INFINITY).error();
        assert!((error - MISSING_OUTPUT_DISTANCE.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_divergence_is_not_viable() {
        // The input is driven so fast that it overflows.
        let exp = Experiment::new(
            1,
            "overflow",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(1, NodeKind::ConstantRate, 1.0, 1e12),
                Observation::new(2, NodeKind::Output, 10.0, 1.0),
            ],
        );
        let mut eval = evaluator(vec![exp], SimParams::default());
        let evaluation = eval.evaluate(&two_node(), f64::INFINITY);
        assert!(matches!(
            evaluation,
            Evaluation::Diverged(Divergence::ConcentrationOverflow { label: 1, .. })
        ));
        assert!(!evaluation.is_viable());
        assert_eq!(evaluation.error(), f64::INFINITY);
        assert_eq!(eval.error_table(&two_node()).get(&1), Some(&-2.0));
    }

    #[test]
    fn test_error_table() {
        let mut eval = evaluator(
            vec![experiment(7, 0.0), experiment(9, 2.0)],
            SimParams::default(),
        );
        let table = eval.error_table(&two_node());
        let ids: Vec<u32> = table.keys().copied().collect();
        assert_eq!(ids, vec![7, 9]);
        assert_eq!(table[&7], 0.0);
        assert!((table[&9] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_validation_report() {
        let set = ExperimentSet::new(vec![experiment(1, 0.0)])
            .with_validation(vec![experiment(2, 0.0), experiment(3, 2.0)]);
        let mut eval = ExperimentEvaluator::new(Arc::new(set), SimParams::default());
        let report = eval.validation_report(&two_node()).unwrap().unwrap();
        assert_eq!(report.n_points, 2);
        // Simulated 0 against observed 0 and 2.
        assert!((report.rmse - 2f64.sqrt()).abs() < 1e-9);
        assert!((report.r_squared + 1.0).abs() < 1e-9);

        let mut none = evaluator(vec![experiment(1, 0.0)], SimParams::default());
        assert_eq!(none.validation_report(&two_node()).unwrap(), None);
    }
}

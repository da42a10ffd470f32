//! Experiment-driven time stepping.
//!
//! Replays an experiment's observations against a network simulator:
//! integrate up to each observation, then apply it as an intervention.

use crate::schema::{Experiment, Genotype, IntegratorConfig, NodeKind, Observation};

use super::integrator::{Divergence, NetworkSimulator};
use super::state::TrajectoryState;

/// Runs one genotype through experiments.
#[derive(Debug, Clone)]
pub struct ExperimentSimulator {
    network: NetworkSimulator,
    state: TrajectoryState,
    next_observation: usize,
}

impl ExperimentSimulator {
    pub fn new(config: IntegratorConfig) -> Self {
        let network = NetworkSimulator::new(config);
        let state = network.initial_state();
        Self {
            network,
            state,
            next_observation: 0,
        }
    }

    /// Compile a genotype for simulation.
    pub fn load(&mut self, genotype: &Genotype, include_all_features: bool) {
        self.network.load(genotype, include_all_features);
        self.state = self.network.initial_state();
        self.next_observation = 0;
    }

    /// Start an experiment: default initial concentrations, overridden by
    /// the observations made at the experiment's first time point.
    pub fn initialize(&mut self, experiment: &Experiment) {
        self.network.reset_interventions();
        self.network.reset_step_control();
        self.state = self.network.initial_state();

        let start = experiment.start_time();
        for obs in experiment
            .observations()
            .iter()
            .take_while(|obs| obs.time <= start)
        {
            self.state.set_concentration(obs.label, obs.concentration);
        }
        self.state.set_time(start);
        self.next_observation = 0;
    }

    /// Advance by `period`, applying every observation reached on the way.
    ///
    /// Returns the accumulated rate magnitude of the integration calls.
    pub fn simulate(&mut self, experiment: &Experiment, period: f64) -> Result<f64, Divergence> {
        let end = self.state.time() + period;
        let mut change = 0.0;

        while let Some(obs) = experiment.observations().get(self.next_observation) {
            if obs.time > end {
                break;
            }
            let gap = obs.time - self.state.time();
            if gap > 0.0 {
                change += self.network.simulate(&mut self.state, gap)?;
            }
            self.apply(obs);
            self.next_observation += 1;
        }

        let rest = end - self.state.time();
        if rest > 0.0 {
            change += self.network.simulate(&mut self.state, rest)?;
        }
        Ok(change)
    }

    fn apply(&mut self, obs: &Observation) {
        match obs.kind {
            NodeKind::ConstantRate | NodeKind::Output => {
                self.network.set_production_rate(obs.label, obs.const_rate);
            }
            NodeKind::FixedConcentration => {
                self.state.set_concentration(obs.label, obs.concentration);
            }
            NodeKind::Intermediate => {}
        }
    }

    pub fn state(&self) -> &TrajectoryState {
        &self.state
    }

    pub fn time(&self) -> f64 {
        self.state.time()
    }

    pub fn network(&self) -> &NetworkSimulator {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut NetworkSimulator {
        &mut self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Edge, Label, Node};

    fn node(label: Label, kind: NodeKind, init: f64) -> Node {
        Node {
            label,
            init,
            limit: 1.0,
            pos_limit: 0.0,
            neg_limit: 0.0,
            degradation: 0.1,
            intrinsic_growth: 0.0,
            kind,
        }
    }

    /// Constant-rate input 1 and fixed input 2 both activate output 3.
    fn network() -> Genotype {
        let mut g = Genotype::new();
        g.insert_node(node(1, NodeKind::ConstantRate, 7.0));
        g.insert_node(node(2, NodeKind::FixedConcentration, 0.0));
        g.insert_node(node(3, NodeKind::Output, 0.0));
        for regulator in [1, 2] {
            g.insert_edge(Edge {
                regulator,
                regulated: 3,
                dis_const: 1.0,
                hill: 1.0,
                is_and: false,
                is_positive: true,
            })
            .unwrap();
        }
        g
    }

    fn experiment() -> Experiment {
        Experiment::new(
            1,
            "steps",
            vec![
                Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
                Observation::new(1, NodeKind::ConstantRate, 2.0, 4.0),
                Observation::new(2, NodeKind::FixedConcentration, 0.0, 0.5),
                Observation::new(2, NodeKind::FixedConcentration, 3.0, 9.0),
                Observation::new(3, NodeKind::Output, 4.0, 1.0),
            ],
        )
    }

    #[test]
    fn test_initialize_overrides_first_time_point() {
        let mut sim = ExperimentSimulator::new(Default::default());
        sim.load(&network(), false);
        sim.initialize(&experiment());
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.state().concentration(1), Some(0.0));
        assert_eq!(sim.state().concentration(2), Some(0.5));
    }

    #[test]
    fn test_observations_become_interventions() {
        let exp = experiment();
        let mut sim = ExperimentSimulator::new(Default::default());
        sim.load(&network(), false);
        sim.initialize(&exp);

        sim.simulate(&exp, 1.0).unwrap();
        // Input 1 follows its fitted slope of 2 per time unit.
        assert!((sim.state().concentration(1).unwrap() - 2.0).abs() < 1e-9);
        // Input 2 has no dynamics of its own until it is overwritten.
        assert_eq!(sim.state().concentration(2), Some(0.5));

        sim.simulate(&exp, 2.5).unwrap();
        assert!((sim.time() - 3.5).abs() < 1e-12);
        // Input 1 keeps the slope of its last segment.
        assert!((sim.state().concentration(1).unwrap() - 7.0).abs() < 1e-9);
        // Overwritten at t = 3 and held there.
        assert_eq!(sim.state().concentration(2), Some(9.0));
        assert!(sim.state().concentration(3).unwrap() > 0.0);
    }

    #[test]
    fn test_reinitialize_resets_rates() {
        let exp = experiment();
        let mut sim = ExperimentSimulator::new(Default::default());
        sim.load(&network(), false);
        sim.initialize(&exp);
        sim.simulate(&exp, 4.0).unwrap();
        let first = sim.state().clone();

        sim.initialize(&exp);
        assert_eq!(sim.network().production_rate(1), Some(0.0));
        sim.simulate(&exp, 4.0).unwrap();
        assert_eq!(sim.state(), &first);
    }
}

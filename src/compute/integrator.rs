//! Network simulator.
//!
//! Compiles the in-use subgraph of a genotype into an ODE system and
//! integrates it with an explicit 8th-order Runge-Kutta scheme
//! (Dormand-Prince 8(5,3) coefficients) with adaptive step size.
//!
//! State slots are ordered by node kind and then by label, so constant-rate
//! and fixed-concentration inputs occupy a prefix of the state vector. The
//! rates of that prefix are imposed from outside; every other node follows
//!
//! ```text
//! dc/dt = production * limit * regulation + (degradation_offset - degradation) * c
//! ```

use std::collections::BTreeMap;

use crate::schema::{Genotype, IntegratorConfig, Label, NodeKind};

use super::regulation::RegulationProgram;
use super::state::TrajectoryState;

// ============================================================================
// Butcher Tableau
// ============================================================================

const N_STAGES: usize = 12;

/// Rows of the tableau for stages 2..=12 as `(stage, coefficient)` pairs
/// over earlier stage derivatives (0-based).
#[allow(clippy::excessive_precision)]
const STAGES: [&[(usize, f64)]; N_STAGES - 1] = [
    &[(0, 5.26001519587677318785587544488e-2)],
    &[
        (0, 1.97250569845378994544595329183e-2),
        (1, 5.91751709536136983633785987549e-2),
    ],
    &[
        (0, 2.95875854768068491816892993775e-2),
        (2, 8.87627564304205475450678981324e-2),
    ],
    &[
        (0, 2.41365134159266685502369798665e-1),
        (2, -8.84549479328286085344864962717e-1),
        (3, 9.24834003261792003115737966543e-1),
    ],
    &[
        (0, 3.7037037037037037037037037037e-2),
        (3, 1.70828608729473871279604482173e-1),
        (4, 1.25467687566822425016691814123e-1),
    ],
    &[
        (0, 3.7109375e-2),
        (3, 1.70252211019544039314978060272e-1),
        (4, 6.02165389804559606850219397283e-2),
        (5, -1.7578125e-2),
    ],
    &[
        (0, 3.70920001185047927108779319836e-2),
        (3, 1.70383925712239993810214054705e-1),
        (4, 1.07262030446373284651809199168e-1),
        (5, -1.53194377486244017527936158236e-2),
        (6, 8.27378916381402288758473766002e-3),
    ],
    &[
        (0, 6.24110958716075717114429577812e-1),
        (3, -3.36089262944694129406857109825e0),
        (4, -8.68219346841726006818189891453e-1),
        (5, 2.75920996994467083049415600797e1),
        (6, 2.01540675504778934086186788979e1),
        (7, -4.34898841810699588477366255144e1),
    ],
    &[
        (0, 4.77662536438264365890433908527e-1),
        (3, -2.48811461997166764192642586468e0),
        (4, -5.90290826836842996371446475743e-1),
        (5, 2.12300514481811942347288949897e1),
        (6, 1.52792336328824235832596922938e1),
        (7, -3.32882109689848629194453265587e1),
        (8, -2.03312017085086261358222928593e-2),
    ],
    &[
        (0, -9.3714243008598732571704021658e-1),
        (3, 5.18637242884406370830023853209e0),
        (4, 1.09143734899672957818500254654e0),
        (5, -8.14978701074692612513997267357e0),
        (6, -1.85200656599969598641566180701e1),
        (7, 2.27394870993505042818970056734e1),
        (8, 2.49360555267965238987089396762e0),
        (9, -3.0467644718982195003823669022e0),
    ],
    &[
        (0, 2.27331014751653820792359768449e0),
        (3, -1.05344954667372501984066689879e1),
        (4, -2.00087205822486249909675718444e0),
        (5, -1.79589318631187989172765950534e1),
        (6, 2.79488845294199600508499808837e1),
        (7, -2.85899827713502369474065508674e0),
        (8, -8.87285693353062954433549289258e0),
        (9, 1.23605671757943030647266201528e1),
        (10, 6.43392746015763530355970484046e-1),
    ],
];

/// 8th-order solution weights.
#[allow(clippy::excessive_precision)]
const WEIGHTS: [(usize, f64); 8] = [
    (0, 5.42937341165687622380535766363e-2),
    (5, 4.45031289275240888144113950566e0),
    (6, 1.89151789931450038304281599044e0),
    (7, -5.8012039600105847814672114227e0),
    (8, 3.1116436695781989440891606237e-1),
    (9, -1.52160949662516078556178806805e-1),
    (10, 2.01365400804030348374776537501e-1),
    (11, 4.47106157277725905176885569043e-2),
];

/// 3rd-order embedded weights.
#[allow(clippy::excessive_precision)]
const WEIGHTS_3RD: [(usize, f64); 3] = [
    (0, 0.244094488188976377952755905512e+00),
    (8, 0.733846688281611857341361741547e+00),
    (11, 0.220588235294117647058823529412e-01),
];

/// 5th-order error estimator weights.
#[allow(clippy::excessive_precision)]
const ERROR_WEIGHTS: [(usize, f64); 8] = [
    (0, 0.1312004499419488073250102996e-01),
    (5, -0.1225156446376204440720569753e+01),
    (6, -0.4957589496572501915214079952e+00),
    (7, 0.1664377182454986536961530415e+01),
    (8, -0.3503288487499736816886487290e+00),
    (9, 0.3341791187130174790297318841e+00),
    (10, 0.8192320648511571246570742613e-01),
    (11, -0.2235530786388629525884427845e-01),
];

#[inline]
fn combine(k: &[Vec<f64>], weights: &[(usize, f64)], i: usize) -> f64 {
    weights.iter().map(|&(j, w)| w * k[j][i]).sum()
}

// ============================================================================
// Divergence
// ============================================================================

/// Fatal integration failure for the current genotype.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Divergence {
    #[error("step size fell to {step:e} at t = {time}")]
    StepUnderflow { time: f64, step: f64 },
    #[error("concentration of node {label} overflowed at t = {time}")]
    ConcentrationOverflow { label: Label, time: f64 },
}

impl Divergence {
    /// Negative sentinel identifying the failure kind.
    pub fn sentinel(&self) -> f64 {
        match self {
            Self::StepUnderflow { .. } => -1.0,
            Self::ConcentrationOverflow { .. } => -2.0,
        }
    }
}

// ============================================================================
// Simulator
// ============================================================================

/// Compiled kinetics of the simulated nodes.
#[derive(Debug, Clone, Default)]
struct Kinetics {
    labels: Vec<Label>,
    kinds: Vec<NodeKind>,
    index: BTreeMap<Label, usize>,
    n_rate_driven: usize,
    init: Vec<f64>,
    limit: Vec<f64>,
    degradation: Vec<f64>,
    production: Vec<f64>,
    const_rate: Vec<f64>,
    degradation_offset: Vec<f64>,
    program: RegulationProgram,
}

impl Kinetics {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn rates(&self, concs: &[f64], regulation: &mut [f64], out: &mut [f64]) {
        self.program.evaluate(concs, regulation);
        let n = self.n_rate_driven;
        out[..n].copy_from_slice(&self.const_rate[..n]);
        for i in n..self.len() {
            out[i] = self.production[i] * (self.limit[i] * regulation[i])
                + (self.degradation_offset[i] - self.degradation[i]) * concs[i];
        }
    }
}

/// Per-step scratch buffers.
#[derive(Debug, Clone, Default)]
struct Workspace {
    stage: Vec<f64>,
    regulation: Vec<f64>,
    k: Vec<Vec<f64>>,
    rates: Vec<f64>,
}

impl Workspace {
    fn resize(&mut self, n: usize) {
        self.stage = vec![0.0; n];
        self.regulation = vec![0.0; n];
        self.k = vec![vec![0.0; n]; N_STAGES];
        self.rates = vec![0.0; n];
    }
}

#[derive(Debug, Clone)]
struct StepControl {
    step: f64,
    err_old: f64,
    accepted_last: bool,
}

impl StepControl {
    fn new(config: &IntegratorConfig) -> Self {
        Self {
            step: config.initial_step,
            err_old: config.min_error_memory,
            accepted_last: true,
        }
    }

    /// Next step size, and whether the trial step is accepted.
    fn propose(&mut self, config: &IntegratorConfig, err_ratio: f64) -> (f64, bool) {
        if err_ratio <= 1.0 {
            let scale = if err_ratio == 0.0 {
                config.max_scale
            } else {
                (config.safety * err_ratio.powf(-config.alpha) * self.err_old.powf(config.beta))
                    .clamp(config.min_scale, config.max_scale)
            };
            let next = if self.accepted_last {
                self.step * scale
            } else {
                self.step * scale.min(1.0)
            };
            self.err_old = err_ratio.max(config.min_error_memory);
            self.accepted_last = true;
            (next, true)
        } else {
            let scale = (config.safety * err_ratio.powf(-config.alpha)).max(config.min_scale);
            self.accepted_last = false;
            (self.step * scale, false)
        }
    }
}

/// ODE simulator for one genotype.
///
/// Each evaluation worker owns one simulator; [`NetworkSimulator::load`]
/// recompiles it for the next genotype.
#[derive(Debug, Clone)]
pub struct NetworkSimulator {
    config: IntegratorConfig,
    kinetics: Kinetics,
    work: Workspace,
    control: StepControl,
}

impl NetworkSimulator {
    /// Create an empty simulator.
    pub fn new(config: IntegratorConfig) -> Self {
        let control = StepControl::new(&config);
        Self {
            config,
            kinetics: Kinetics::default(),
            work: Workspace::default(),
            control,
        }
    }

    /// Create and load a genotype.
    pub fn from_genotype(
        genotype: &Genotype,
        include_all_features: bool,
        config: IntegratorConfig,
    ) -> Self {
        let mut simulator = Self::new(config);
        simulator.load(genotype, include_all_features);
        simulator
    }

    /// Compile the in-use subgraph of a genotype, discarding the previous
    /// model and any interventions.
    pub fn load(&mut self, genotype: &Genotype, include_all_features: bool) {
        let mut nodes: Vec<_> = genotype
            .labels_in_use(include_all_features)
            .into_iter()
            .filter_map(|label| genotype.node(label))
            .collect();
        nodes.sort_by_key(|node| (node.kind, node.label));

        let n = nodes.len();
        let labels: Vec<Label> = nodes.iter().map(|node| node.label).collect();
        let index: BTreeMap<Label, usize> =
            labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();

        self.kinetics = Kinetics {
            n_rate_driven: nodes.iter().filter(|node| node.kind.is_input()).count(),
            kinds: nodes.iter().map(|node| node.kind).collect(),
            init: nodes.iter().map(|node| node.init).collect(),
            limit: nodes.iter().map(|node| node.limit).collect(),
            degradation: nodes.iter().map(|node| node.degradation).collect(),
            production: vec![1.0; n],
            const_rate: vec![0.0; n],
            degradation_offset: vec![0.0; n],
            program: RegulationProgram::compile(genotype, &index),
            labels,
            index,
        };
        self.work.resize(n);
        self.reset_step_control();
    }

    /// Forget the adaptive step history.
    pub fn reset_step_control(&mut self) {
        self.control = StepControl::new(&self.config);
    }

    /// Fresh state holding the genotype's initial concentrations.
    pub fn initial_state(&self) -> TrajectoryState {
        let outputs = self
            .kinetics
            .labels
            .iter()
            .zip(&self.kinetics.kinds)
            .filter(|&(_, &kind)| kind == NodeKind::Output)
            .map(|(&label, _)| label)
            .collect();
        TrajectoryState::new(
            self.kinetics.labels.clone(),
            self.kinetics.init.clone(),
            outputs,
        )
    }

    /// Simulated labels in state-slot order.
    pub fn labels(&self) -> &[Label] {
        &self.kinetics.labels
    }

    /// Number of leading slots whose rates are imposed from outside.
    pub fn n_rate_driven(&self) -> usize {
        self.kinetics.n_rate_driven
    }

    pub fn slot(&self, label: Label) -> Option<usize> {
        self.kinetics.index.get(&label).copied()
    }

    /// Step size the next integration will start with.
    pub fn step_size(&self) -> f64 {
        self.control.step
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    // ========================================================================
    // Interventions
    // ========================================================================

    /// Impose a constant production rate. Only input and output nodes accept
    /// a rate; for outputs it is recorded but does not drive the dynamics.
    pub fn set_production_rate(&mut self, label: Label, rate: f64) -> bool {
        match self.slot(label) {
            Some(i)
                if i < self.kinetics.n_rate_driven
                    || self.kinetics.kinds[i] == NodeKind::Output =>
            {
                self.kinetics.const_rate[i] = rate;
                true
            }
            _ => false,
        }
    }

    /// Imposed rate of a node, if simulated.
    pub fn production_rate(&self, label: Label) -> Option<f64> {
        self.slot(label).map(|i| self.kinetics.const_rate[i])
    }

    /// Stop all synthesis of a node.
    pub fn block_production(&mut self, label: Label) -> bool {
        match self.slot(label) {
            Some(i) => {
                self.kinetics.production[i] = 0.0;
                true
            }
            None => false,
        }
    }

    /// Add to the degradation offset of a node.
    pub fn apply_degradation_offset(&mut self, label: Label, offset: f64) -> bool {
        match self.slot(label) {
            Some(i) => {
                self.kinetics.degradation_offset[i] += offset;
                true
            }
            None => false,
        }
    }

    /// Clear every override.
    pub fn reset_interventions(&mut self) {
        self.kinetics.const_rate.fill(0.0);
        self.kinetics.production.fill(1.0);
        self.kinetics.degradation_offset.fill(0.0);
    }

    // ========================================================================
    // Integration
    // ========================================================================

    /// Current derivatives of a state.
    pub fn rates(&mut self, state: &TrajectoryState) -> Vec<f64> {
        let mut out = vec![0.0; self.kinetics.len()];
        self.kinetics
            .rates(state.concentrations(), &mut self.work.regulation, &mut out);
        out
    }

    /// Advance `state` by `span` time units.
    ///
    /// Returns the accumulated per-step maximum absolute rate.
    pub fn simulate(&mut self, state: &mut TrajectoryState, span: f64) -> Result<f64, Divergence> {
        let start = state.time();
        if self.kinetics.len() == 0 || span <= 0.0 {
            state.set_time(start + span.max(0.0));
            return Ok(0.0);
        }

        let config = self.config.clone();
        let mut t = 0.0;
        let mut overshot = 0.0;
        let mut total_change = 0.0;

        while t < span {
            if t + self.control.step * 1.0001 > span {
                overshot = self.control.step;
                self.control.step = span - t;
            }

            self.work.stage.copy_from_slice(state.concentrations());
            self.kinetics.rates(
                &self.work.stage,
                &mut self.work.regulation,
                &mut self.work.k[0],
            );

            let next = loop {
                let err_ratio = self.trial_step(state.concentrations());
                let (next, accepted) = self.control.propose(&config, err_ratio);
                if accepted {
                    break next;
                }
                overshot = 0.0;
                if next < config.min_step {
                    return Err(Divergence::StepUnderflow {
                        time: start + t,
                        step: next,
                    });
                }
                self.control.step = next;
            };

            let h = self.control.step;
            let mut step_change = 0.0f64;
            for (i, (c, &rate)) in state
                .concentrations_mut()
                .iter_mut()
                .zip(&self.work.rates)
                .enumerate()
            {
                step_change = step_change.max(rate.abs());
                let updated = *c + h * rate;
                if updated > config.max_concentration {
                    return Err(Divergence::ConcentrationOverflow {
                        label: self.kinetics.labels[i],
                        time: start + t,
                    });
                }
                *c = if updated < config.min_concentration {
                    0.0
                } else {
                    updated
                };
            }

            total_change += step_change;
            t += h;
            self.control.step = next.min(config.max_step);
        }

        if self.control.step < overshot {
            self.control.step = overshot;
        }
        state.set_time(start + span);
        Ok(total_change)
    }

    /// Evaluate all stages for the current step size, leave the 8th-order
    /// derivative in `work.rates` and return the scaled error ratio.
    fn trial_step(&mut self, y: &[f64]) -> f64 {
        let h = self.control.step;
        let n = y.len();
        let Workspace {
            stage,
            regulation,
            k,
            rates,
        } = &mut self.work;

        for (s, row) in STAGES.iter().enumerate() {
            for i in 0..n {
                let slope: f64 = row.iter().map(|&(j, a)| a * k[j][i]).sum();
                stage[i] = (y[i] + h * slope).max(0.0);
            }
            self.kinetics.rates(stage, regulation, &mut k[s + 1]);
        }

        let mut err = 0.0;
        let mut err2 = 0.0;
        for i in 0..n {
            let rate = combine(k, &WEIGHTS, i);
            rates[i] = rate;
            let e1 = rate - combine(k, &WEIGHTS_3RD, i);
            let e2 = combine(k, &ERROR_WEIGHTS, i);
            let sk = self.config.abs_tolerance + self.config.rel_tolerance * y[i];
            err2 += (e1 / sk).powi(2);
            err += (e2 / sk).powi(2);
        }

        let mut deno = err + 0.01 * err2;
        if deno <= 0.0 {
            deno = 1.0;
        }
        h * err * (1.0 / (n as f64 * deno)).sqrt()
    }
}

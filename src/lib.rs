//! GRN Search - Evolutionary discovery of gene regulatory network models.
//!
//! This crate searches for regulatory networks (products linked by
//! Hill-kinetics activation and repression) whose simulated dynamics
//! reproduce measured time-series concentrations.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Genotypes, experiment data, and configuration types
//! - `compute`: Network simulation, error evaluation, and the island search
//!
//! # Example
//!
//! ```rust,no_run
//! use grn_search::{
//!     schema::{Experiment, Genotype, IntegratorConfig, NodeKind, Observation},
//!     compute::ExperimentSimulator,
//! };
//!
//! // A constant-rate input activating one output
//! let genotype: Genotype =
//!     "(1 0 1 0 0 0.1 0 0|2 0 10 0 0 0.5 0 2*1 2 5 2 0 1)".parse().unwrap();
//!
//! let experiment = Experiment::new(
//!     1,
//!     "ramp",
//!     vec![
//!         Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
//!         Observation::new(1, NodeKind::ConstantRate, 10.0, 10.0),
//!         Observation::new(2, NodeKind::Output, 10.0, 4.0),
//!     ],
//! );
//!
//! let mut simulator = ExperimentSimulator::new(IntegratorConfig::default());
//! simulator.load(&genotype, false);
//! simulator.initialize(&experiment);
//! simulator.simulate(&experiment, 10.0).unwrap();
//!
//! println!("Output after 10 time units: {:?}", simulator.state().concentration(2));
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::evolution::{EvolutionEngine, ExperimentEvaluator, SearchError};
pub use compute::{ExperimentSimulator, NetworkSimulator, TrajectoryState};
pub use schema::{ExperimentSet, Genotype, SearchConfig};

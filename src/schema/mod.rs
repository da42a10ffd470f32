//! Schema module - Genotype, experiment, and configuration types.

mod config;
mod evolution;
mod experiment;
mod genotype;

pub use config::*;
pub use evolution::*;
pub use experiment::*;
pub use genotype::*;

//! Compute module - Network simulation and evolutionary search.

mod integrator;
mod regulation;
mod simulator;
mod state;

pub mod evolution;

pub use integrator::*;
pub use regulation::*;
pub use simulator::*;
pub use state::*;

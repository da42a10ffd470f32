//! Evolutionary search for network models fitted to experiment data.
//!
//! # Overview
//!
//! The search runs several islands, each evolving its own population with
//! deterministic crowding:
//!
//! - **Genotype Operations** (`genome`): Random generation, crossover, and mutation
//! - **Fitness** (`fitness`): Error of a genotype against the training experiments
//! - **Populations** (`population`): Individuals, generations and demes
//! - **Selection** (`crowding`): Parent pairing and child-versus-parent replacement
//! - **Pareto Archive** (`archive`): Error/complexity front and checkpoint storage
//! - **Worker Pool** (`pool`): Batched evaluation on background threads
//! - **Coordinator** (`search`): Islands, migration, termination
//!
//! # Example
//!
//! ```rust,no_run
//! use grn_search::schema::{ExperimentSet, SearchConfig};
//! use grn_search::compute::evolution::{EvolutionEngine, JsonDirStore};
//!
//! let experiments: ExperimentSet =
//!     serde_json::from_str(&std::fs::read_to_string("experiments.json").unwrap()).unwrap();
//!
//! let mut engine = EvolutionEngine::new(SearchConfig::default(), experiments)
//!     .unwrap()
//!     .with_store(JsonDirStore::new("checkpoints").unwrap());
//! let result = engine
//!     .run_with_callback(|progress| {
//!         println!("Generation {:.2}: best error = {:?}",
//!             progress.mean_generation, progress.best_error);
//!     })
//!     .unwrap();
//!
//! for entry in &result.pareto_front {
//!     println!("complexity {} error {:?}",
//!         entry.individual.complexity, entry.individual.error);
//! }
//! ```
//!
//! # Termination
//!
//! A search ends once the mean generation over islands reaches
//! `max_generations`, once `max_generations_no_improvement` generations
//! pass without a new best, or when cancelled through
//! [`EvolutionEngine::cancel_handle`]. Evaluations in flight always run to
//! completion.

mod archive;
mod crowding;
mod fitness;
mod genome;
mod pool;
mod population;
mod search;

pub use archive::{EvolutionStore, JsonDirStore, ParetoArchive, StoreError};
pub use crowding::{DeterministicCrowding, Offspring, Selection};
pub use fitness::{Evaluate, Evaluation, ExperimentEvaluator};
pub use genome::{FIRST_EVOLVED_LABEL, GenomeRng, MutationScope};
pub use pool::{CompletedBatch, EvaluationResult, EvaluationService, PoolError};
pub use population::{Deme, Generation, Individual};
pub use search::{EvolutionEngine, SearchError, migrate_between};

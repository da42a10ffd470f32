//! GRN Search CLI - Run a network model search from JSON files.

use std::fs;
use std::path::PathBuf;

use grn_search::{
    compute::evolution::{EvolutionEngine, JsonDirStore},
    schema::{Experiment, ExperimentSet, NodeKind, Observation, SearchConfig},
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--example" {
        print_example_config();
        return;
    }

    if args.len() < 3 {
        eprintln!("Usage: {} <config.json> <experiments.json> [out_dir]", args[0]);
        eprintln!();
        eprintln!("Search for network models reproducing experiment data.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json       Search configuration");
        eprintln!("  experiments.json  Training and validation experiments");
        eprintln!("  out_dir           Directory for checkpoints and the final result");
        eprintln!();
        eprintln!("Example files are printed with the --example flag.");
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let experiments_path = PathBuf::from(&args[2]);
    let out_dir = args.get(3).map(PathBuf::from);

    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });
    let config: SearchConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    let experiments_str = fs::read_to_string(&experiments_path).unwrap_or_else(|e| {
        eprintln!("Error reading experiments file: {}", e);
        std::process::exit(1);
    });
    let experiments: ExperimentSet = serde_json::from_str(&experiments_str).unwrap_or_else(|e| {
        eprintln!("Error parsing experiments: {}", e);
        std::process::exit(1);
    });

    println!("GRN Search");
    println!("==========");
    println!(
        "Islands: {} x {} individuals",
        config.islands.n_islands,
        config.islands.population_size()
    );
    println!("Max generations: {}", config.islands.max_generations);
    println!(
        "Experiments: {} training, {} validation",
        experiments.training.len(),
        experiments.validation.len()
    );
    println!();

    let name = config.name.clone();
    let mut engine = EvolutionEngine::new(config, experiments).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    if let Some(dir) = &out_dir {
        let store = JsonDirStore::new(dir).unwrap_or_else(|e| {
            eprintln!("Error creating output directory: {}", e);
            std::process::exit(1);
        });
        engine = engine.with_store(store);
    }

    println!("Running search...");
    let result = engine
        .run_with_callback(|progress| {
            if progress.island == 0 && progress.generation % 10 == 0 {
                println!(
                    "  Generation {:.1}/{}: best error={}, complexity={}, front={}",
                    progress.mean_generation,
                    progress.max_generations,
                    progress
                        .best_error
                        .map_or_else(|| "-".to_string(), |e| format!("{:.4}", e)),
                    progress
                        .best_complexity
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                    progress.pareto_size
                );
            }
        })
        .unwrap_or_else(|e| {
            eprintln!("Search failed: {}", e);
            std::process::exit(1);
        });

    println!();
    println!("Pareto front:");
    for entry in &result.pareto_front {
        let ind = &entry.individual;
        println!(
            "  complexity {:>4}  error {:>10}  {}",
            ind.complexity,
            ind.error.map_or_else(|| "-".to_string(), |e| format!("{:.4}", e)),
            ind.genotype
        );
    }

    if let Some(report) = &result.validation {
        println!();
        println!(
            "Validation: RMSE {:.4}, R² {:.4} over {} points",
            report.rmse, report.r_squared, report.n_points
        );
    }

    println!();
    println!(
        "Stopped: {:?} after {:.2} generations, {} evaluations in {:.2}s ({:.1}/s)",
        result.stats.stop_reason,
        result.stats.mean_generations,
        result.stats.total_evaluations,
        result.stats.elapsed_seconds,
        result.stats.evaluations_per_second
    );

    if let Some(dir) = out_dir {
        let path = dir.join(format!("{}.result.json", name));
        let written = serde_json::to_string_pretty(&result)
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(&path, json).map_err(|e| e.to_string()));
        match written {
            Ok(()) => println!("Result written to {}", path.display()),
            Err(e) => {
                eprintln!("Error writing result: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn print_example_config() {
    let config = SearchConfig::default();
    let experiments = ExperimentSet::new(vec![Experiment::new(
        1,
        "induction",
        vec![
            Observation::new(1, NodeKind::ConstantRate, 0.0, 0.0),
            Observation::new(1, NodeKind::ConstantRate, 10.0, 5.0),
            Observation::new(2, NodeKind::Output, 0.0, 0.0),
            Observation::new(2, NodeKind::Output, 5.0, 1.2),
            Observation::new(2, NodeKind::Output, 10.0, 3.1),
        ],
    )]);

    println!("Example configuration (config.json):");
    println!("{}", serde_json::to_string_pretty(&config).unwrap());
    println!();
    println!("Example experiments (experiments.json):");
    println!("{}", serde_json::to_string_pretty(&experiments).unwrap());
}

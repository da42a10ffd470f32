//! Worker pool evaluating genotypes in island-sized batches.
//!
//! Work items go through one channel shared by all workers. A batch is
//! reported on the completion channel only once every one of its items
//! has been evaluated, so the coordinator always sees whole generations.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use log::debug;

use crate::schema::Genotype;

use super::fitness::{Evaluate, Evaluation};

/// Outcome of one work item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub evaluation: Evaluation,
    /// Wall-clock evaluation time in seconds.
    pub sim_time: f64,
}

/// All results of one island's batch, in submission order.
#[derive(Debug, Clone)]
pub struct CompletedBatch {
    pub island: usize,
    pub results: Vec<EvaluationResult>,
}

/// Pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn evaluation worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("Island {0} already has a batch in flight")]
    BatchAlreadyPending(usize),
    #[error("Evaluation worker panicked on a genotype of island {0}")]
    WorkerPanicked(usize),
    #[error("Evaluation workers are gone")]
    Disconnected,
}

struct Task {
    island: usize,
    index: usize,
    genotype: Genotype,
    bound: f64,
}

struct Batch {
    pending: usize,
    results: Vec<Option<EvaluationResult>>,
}

type Ledger = Arc<Mutex<HashMap<usize, Batch>>>;
type Completion = Result<CompletedBatch, PoolError>;

/// Fixed-size pool of evaluation threads, each owning its own evaluator.
pub struct EvaluationService {
    tasks: Option<Sender<Task>>,
    completed_tx: Sender<Completion>,
    completed: Receiver<Completion>,
    ledger: Ledger,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl EvaluationService {
    /// Start `n_workers` threads (at least one), building one evaluator per
    /// thread with `factory`.
    pub fn spawn<E, F>(n_workers: usize, mut factory: F) -> Result<Self, PoolError>
    where
        E: Evaluate,
        F: FnMut() -> E,
    {
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (completed_tx, completed) = channel::unbounded();

        let mut service = Self {
            tasks: Some(task_tx),
            completed_tx,
            completed,
            ledger: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        };

        for worker in 0..n_workers.max(1) {
            let evaluator = factory();
            let rx = task_rx.clone();
            let done = service.completed_tx.clone();
            let ledger = Arc::clone(&service.ledger);
            let shutdown = Arc::clone(&service.shutdown);

            let handle = thread::Builder::new()
                .name(format!("grn-eval-{worker}"))
                .spawn(move || run_worker(worker, evaluator, rx, done, ledger, shutdown))
                .map_err(PoolError::Spawn)?;
            service.workers.push(handle);
        }

        Ok(service)
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue one island's batch of (genotype, error bound) pairs.
    pub fn submit(&self, island: usize, batch: Vec<(Genotype, f64)>) -> Result<(), PoolError> {
        let tasks = self.tasks.as_ref().ok_or(PoolError::Disconnected)?;

        {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            if ledger.contains_key(&island) {
                return Err(PoolError::BatchAlreadyPending(island));
            }
            if batch.is_empty() {
                return self
                    .completed_tx
                    .send(Ok(CompletedBatch {
                        island,
                        results: Vec::new(),
                    }))
                    .map_err(|_| PoolError::Disconnected);
            }
            ledger.insert(
                island,
                Batch {
                    pending: batch.len(),
                    results: vec![None; batch.len()],
                },
            );
        }

        for (index, (genotype, bound)) in batch.into_iter().enumerate() {
            tasks
                .send(Task {
                    island,
                    index,
                    genotype,
                    bound,
                })
                .map_err(|_| PoolError::Disconnected)?;
        }
        Ok(())
    }

    /// Block until some island's batch is complete, or a worker died on
    /// one of its genotypes.
    pub fn wait_for_any_ready_island(&self) -> Result<CompletedBatch, PoolError> {
        self.completed.recv().map_err(|_| PoolError::Disconnected)?
    }

    /// Islands with a batch in flight.
    pub fn pending_islands(&self) -> usize {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop the workers and wait for them. Queued work is abandoned.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.tasks.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                debug!("Evaluation worker panicked");
            }
        }
    }
}

impl Drop for EvaluationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reports the island of the task being evaluated if the worker unwinds.
struct InFlight<'a> {
    island: Option<usize>,
    done: &'a Sender<Completion>,
    ledger: &'a Ledger,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(island) = self.island else {
            return;
        };
        if thread::panicking() {
            self.ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&island);
            let _ = self.done.send(Err(PoolError::WorkerPanicked(island)));
        }
    }
}

fn run_worker<E: Evaluate>(
    worker: usize,
    mut evaluator: E,
    tasks: Receiver<Task>,
    done: Sender<Completion>,
    ledger: Ledger,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Evaluation worker {worker} started");

    while let Ok(task) = tasks.recv() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let start = Instant::now();
        let mut in_flight = InFlight {
            island: Some(task.island),
            done: &done,
            ledger: &ledger,
        };
        let evaluation = evaluator.evaluate(&task.genotype, task.bound);
        in_flight.island = None;
        let result = EvaluationResult {
            evaluation,
            sim_time: start.elapsed().as_secs_f64(),
        };

        let finished = {
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            let complete = match ledger.get_mut(&task.island) {
                Some(batch) => {
                    batch.results[task.index] = Some(result);
                    batch.pending -= 1;
                    batch.pending == 0
                }
                None => false,
            };
            if complete {
                ledger.remove(&task.island)
            } else {
                None
            }
        };

        if let Some(batch) = finished {
            let completed = CompletedBatch {
                island: task.island,
                results: batch.results.into_iter().flatten().collect(),
            };
            if done.send(Ok(completed)).is_err() {
                break;
            }
        }
    }

    debug!("Evaluation worker {worker} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Node, NodeKind};
    use std::time::Duration;

    /// Scores a genotype by its node count, capped by the bound.
    struct CountNodes {
        delay: Duration,
    }

    impl Evaluate for CountNodes {
        fn evaluate(&mut self, genotype: &Genotype, max_error: f64) -> Evaluation {
            thread::sleep(self.delay);
            Evaluation::Scored((genotype.n_nodes() as f64).min(max_error))
        }
    }

    fn genotype(n: u32) -> Genotype {
        let mut g = Genotype::new();
        for label in 1..=n {
            g.insert_node(Node {
                label,
                init: 0.0,
                limit: 1.0,
                pos_limit: 0.0,
                neg_limit: 0.0,
                degradation: 0.1,
                intrinsic_growth: 0.0,
                kind: NodeKind::Output,
            });
        }
        g
    }

    fn pool(n_workers: usize) -> EvaluationService {
        EvaluationService::spawn(n_workers, || CountNodes {
            delay: Duration::from_millis(1),
        })
        .unwrap()
    }

    #[test]
    fn test_batch_results_in_submission_order() {
        let pool = pool(3);
        assert_eq!(pool.n_workers(), 3);

        let batch: Vec<(Genotype, f64)> = (0..10).map(|n| (genotype(n), f64::INFINITY)).collect();
        pool.submit(0, batch).unwrap();

        let done = pool.wait_for_any_ready_island().unwrap();
        assert_eq!(done.island, 0);
        let scores: Vec<f64> = done.results.iter().map(|r| r.evaluation.error()).collect();
        assert_eq!(scores, (0..10u32).map(f64::from).collect::<Vec<_>>());
        assert!(done.results.iter().all(|r| r.sim_time >= 0.0));
        assert_eq!(pool.pending_islands(), 0);
    }

    #[test]
    fn test_every_island_reported_once() {
        let pool = pool(4);
        for island in 0..5 {
            let batch = (0..=island as u32).map(|n| (genotype(n), 2.0)).collect();
            pool.submit(island, batch).unwrap();
        }

        let mut seen: Vec<usize> = (0..5)
            .map(|_| {
                let done = pool.wait_for_any_ready_island().unwrap();
                assert_eq!(done.results.len(), done.island + 1);
                assert!(done.results.iter().all(|r| r.evaluation.error() <= 2.0));
                done.island
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_batch_ready_immediately() {
        let pool = pool(1);
        pool.submit(7, Vec::new()).unwrap();
        let done = pool.wait_for_any_ready_island().unwrap();
        assert_eq!(done.island, 7);
        assert!(done.results.is_empty());
    }

    #[test]
    fn test_second_batch_for_busy_island_rejected() {
        let pool = EvaluationService::spawn(1, || CountNodes {
            delay: Duration::from_millis(50),
        })
        .unwrap();
        pool.submit(1, vec![(genotype(1), 1.0), (genotype(2), 1.0)])
            .unwrap();
        assert!(matches!(
            pool.submit(1, vec![(genotype(1), 1.0)]),
            Err(PoolError::BatchAlreadyPending(1))
        ));
        pool.wait_for_any_ready_island().unwrap();
        pool.submit(1, vec![(genotype(1), 1.0)]).unwrap();
        pool.wait_for_any_ready_island().unwrap();
    }

    /// Panics on genotypes with exactly three nodes.
    struct FailOnThree;

    impl Evaluate for FailOnThree {
        fn evaluate(&mut self, genotype: &Genotype, _max_error: f64) -> Evaluation {
            assert_ne!(genotype.n_nodes(), 3, "three nodes");
            Evaluation::Scored(genotype.n_nodes() as f64)
        }
    }

    #[test]
    fn test_worker_panic_reports_island() {
        let pool = EvaluationService::spawn(2, || FailOnThree).unwrap();
        pool.submit(4, vec![(genotype(1), 1.0), (genotype(3), 1.0)])
            .unwrap();
        assert!(matches!(
            pool.wait_for_any_ready_island(),
            Err(PoolError::WorkerPanicked(4))
        ));
        assert_eq!(pool.pending_islands(), 0);

        // The surviving worker keeps serving other islands.
        pool.submit(5, vec![(genotype(2), 1.0)]).unwrap();
        let done = pool.wait_for_any_ready_island().unwrap();
        assert_eq!(done.island, 5);
        assert_eq!(done.results[0].evaluation.error(), 2.0);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let mut pool = pool(2);
        pool.submit(0, vec![(genotype(3), 10.0)]).unwrap();
        pool.wait_for_any_ready_island().unwrap();
        pool.shutdown();
        assert_eq!(pool.n_workers(), 0);
        assert!(matches!(
            pool.submit(0, vec![(genotype(1), 1.0)]),
            Err(PoolError::Disconnected)
        ));
    }
}

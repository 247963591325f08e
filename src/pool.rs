//! Table Worker Pool (C6) — fixed-size set of workers consuming tables
//! from a queue (spec §4.4).
//!
//! Grounded on `original_source/include/sync/TableProcessorThreadPool.h`
//! and `TableProcessorThreadPool.cpp`: a blocking queue of tasks, N
//! persistent worker threads, atomic counters, idempotent shutdown. The
//! tokio translation swaps OS threads for tasks and the blocking queue
//! for a bounded `mpsc` channel, keeping the same submit/drain/shutdown
//! shape.
//!
//! Per spec §9 ("cyclic reference between thread pool and orchestrator"),
//! the pool is a pure task consumer parameterised by a processor closure
//! passed at submit time; it never knows about orchestrator or catalog
//! types.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// A unit of work: an opaque async closure producing nothing but side
/// effects (it writes its own outcome to the catalog before returning).
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    active_workers: AtomicUsize,
    pending: AtomicUsize,
}

/// Snapshot of the pool's counters, safe to read concurrently with
/// writers (spec §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub active_workers: usize,
    pub pending_tasks: usize,
}

/// Fixed-size table worker pool.
pub struct TableWorkerPool {
    sender: mpsc::Sender<Task>,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
}

impl TableWorkerPool {
    /// Spawn `num_workers` persistent workers (falls back to hardware
    /// concurrency if 0, matching the C++ pool's constructor).
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_workers
        };

        // Queue depth bounds how many submitted-but-not-yet-picked-up
        // tasks can accumulate; this is the pool's own backpressure
        // against the scheduler (spec §4.4 `Submit` blocks when full).
        let (sender, receiver) = mpsc::channel::<Task>(num_workers * 4);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let receiver = receiver.clone();
            let counters = counters.clone();
            workers.push(tokio::spawn(worker_loop(id, receiver, counters)));
        }

        Self {
            sender,
            counters,
            workers,
        }
    }

    /// Submit a task. Blocks the caller (backpressure) while the queue is
    /// full, per spec §4.4.
    pub async fn submit(&self, task: Task) {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).await.is_err() {
            warn!("submit called after pool shutdown, dropping task");
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Close the queue and join every worker, returning only after every
    /// accepted task has terminated (spec §4.4 `WaitForCompletion`).
    pub async fn wait_for_completion(mut self) -> PoolStats {
        drop(self.sender);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task panicked");
            }
        }
        self.stats()
    }

    /// Idempotent shutdown: same drain+join as `wait_for_completion`, but
    /// safe to call more than once (spec §4.4 `Shutdown`).
    pub async fn shutdown(&mut self) {
        if !self.workers.is_empty() {
            // Dropping the sender closes the channel; a fresh, empty
            // sender keeps `submit` callable (and futile) without
            // panicking if shutdown races a late submit.
            let (noop_sender, _keep_alive) = mpsc::channel::<Task>(1);
            self.sender = noop_sender;
            for worker in self.workers.drain(..) {
                let _ = worker.await;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            completed_tasks: self.counters.completed.load(Ordering::SeqCst),
            failed_tasks: self.counters.failed.load(Ordering::SeqCst),
            active_workers: self.counters.active_workers.load(Ordering::SeqCst),
            pending_tasks: self.counters.pending.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop(_id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>, counters: Arc<Counters>) {
    loop {
        let task = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };

        let Some(task) = task else {
            break;
        };

        counters.pending.fetch_sub(1, Ordering::SeqCst);
        counters.active_workers.fetch_add(1, Ordering::SeqCst);

        // Tasks report their own success/failure via the catalog; a
        // panic here still counts as a failed task rather than taking
        // the whole worker down (spec §7: "never let one table's error
        // stop the pool").
        let outcome = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(task)).await;

        counters.active_workers.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!("table task panicked");
            }
        }
    }
}

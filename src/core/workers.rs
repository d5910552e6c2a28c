//! Background thread pool for image decoding.
//!
//! Uses work-stealing deques:
//! - Jobs go into a global injector
//! - Each worker drains its own deque, then the injector, then steals
//!
//! Workers never touch registry state. Decode jobs only send their result
//! back over a channel, the registry applies it on its own thread.

use crossbeam::deque::{Injector, Stealer, Worker};
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default pool size: 3/4 of the cores, leaving room for the UI thread
pub fn default_thread_count() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

/// Decode worker pool with work-stealing
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawn `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(worker_id, local)| {
                let injector = Arc::clone(&injector);
                let shutdown = Arc::clone(&shutdown);
                let stealers = stealers.clone();

                thread::Builder::new()
                    .name(format!("imgcache-decoder-{}", worker_id))
                    .spawn(move || run_worker(worker_id, local, &injector, &stealers, &shutdown))
                    .expect("Failed to spawn decoder thread")
            })
            .collect();

        trace!("Decoder pool initialized: {} threads", num_threads);

        Self {
            injector,
            handles,
            shutdown,
        }
    }

    /// Run closure on a worker thread
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }
}

fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    })
}

fn run_worker(
    worker_id: usize,
    local: Worker<Job>,
    injector: &Injector<Job>,
    stealers: &[Stealer<Job>],
    shutdown: &AtomicBool,
) {
    trace!("Decoder {} started", worker_id);
    loop {
        if let Some(job) = find_job(&local, injector, stealers) {
            job();
            continue;
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        // Idle: short sleep instead of spinning
        thread::sleep(Duration::from_millis(1));
    }
    trace!("Decoder {} stopped", worker_id);
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Decoder pool shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Decodes can be slow; don't hold up process exit on them
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining decoders");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} decoders stopped", num_threads);
    }
}

//! WorkDispatcher - fixed worker pool for per-block job fan-out
//!
//! A deliberately small pool tuned for the audio callback rather than a
//! general-purpose scheduler:
//!
//! - Jobs are plain indices `0..job_count`, claimed with `fetch_add` on one
//!   shared counter. Workers *and* the calling audio thread race to drain
//!   it, which balances load no matter how uneven per-track cost is.
//! - Workers sleep on their own `crossbeam` [`Parker`]. A dispatch bumps a
//!   generation counter and unparks every worker; a worker only joins a
//!   generation it has not seen, so spurious or stale wakeups never run a
//!   job twice.
//! - A finished dispatch is marked closed and the caller waits until no
//!   worker is inside the drain loop before the borrowed job closure goes
//!   out of scope. Late-waking workers see the closed marker and go back
//!   to sleep.
//!
//! `job_count <= 1` or an empty pool runs inline on the caller, which
//! avoids paying wake latency for work that cannot be shared.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::Backoff;

/// Maximum number of worker threads
pub const MAX_WORKERS: usize = 8;

type JobFn<'a> = dyn Fn(usize) + Sync + 'a;

/// State shared between the dispatching thread and the workers
struct Shared {
    /// Incremented once per parallel dispatch
    generation: AtomicU64,
    /// Last generation whose jobs have all completed
    closed: AtomicU64,
    /// Next job index to claim
    next_index: AtomicUsize,
    /// Number of jobs in the current generation
    job_count: AtomicUsize,
    /// Jobs finished in the current generation
    completed: AtomicUsize,
    /// Workers currently inside `drain`
    active: AtomicUsize,
    /// Tells parked workers to exit
    shutdown: AtomicBool,
    /// Job closure for the current generation (lifetime erased, see `run`)
    job: UnsafeCell<Option<*const JobFn<'static>>>,
}

// SAFETY: `job` is written only by the dispatching thread while no worker can
// read it (before the generation is published, or after the generation is
// closed and `active` has dropped to zero). All other fields are atomics.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

impl Shared {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            next_index: AtomicUsize::new(0),
            job_count: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            job: UnsafeCell::new(None),
        }
    }

    /// Claim and run jobs until the counter is exhausted
    fn drain(&self) {
        // SAFETY: callers either own the dispatch (the audio thread) or have
        // registered in `active` for a generation that is not yet closed, so
        // the pointer is live and points at the borrowed closure in `run`.
        let job = match unsafe { *self.job.get() } {
            Some(ptr) => unsafe { &*ptr },
            None => return,
        };
        let count = self.job_count.load(Ordering::Acquire);

        loop {
            let index = self.next_index.fetch_add(1, Ordering::AcqRel);
            if index >= count {
                break;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| job(index))).is_err() {
                log::error!("[DISPATCH] job {} panicked; counted as complete", index);
            }
            self.completed.fetch_add(1, Ordering::Release);
        }
    }

    fn reset_counters(&self) {
        self.next_index.store(0, Ordering::Relaxed);
        self.job_count.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.active.store(0, Ordering::Relaxed);
    }
}

/// Worker thread body
fn worker_loop(shared: Arc<Shared>, parker: Parker, mut seen: u64) {
    loop {
        parker.park();

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let generation = shared.generation.load(Ordering::Acquire);
        if generation == seen {
            continue;
        }
        seen = generation;

        // Register before checking `closed`; the dispatcher closes before it
        // waits on `active`, so one of the two sides always sees the other.
        shared.active.fetch_add(1, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) < generation {
            shared.drain();
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    unparker: Unparker,
    handle: JoinHandle<()>,
}

/// Fixed-size pool that fans independent jobs out across worker threads
pub struct WorkDispatcher {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl WorkDispatcher {
    /// Create a dispatcher with `workers` threads (clamped to [`MAX_WORKERS`])
    pub fn new(workers: usize) -> Self {
        let mut dispatcher = Self {
            shared: Arc::new(Shared::new()),
            workers: Vec::with_capacity(MAX_WORKERS),
        };
        dispatcher.set_worker_count(workers);
        dispatcher
    }

    /// Number of running worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tear down the pool and rebuild it with `count` workers (0-8)
    ///
    /// Never call from the audio thread: joining and spawning threads
    /// blocks and allocates.
    pub fn set_worker_count(&mut self, count: usize) {
        let count = count.min(MAX_WORKERS);
        self.shutdown();
        self.shared.shutdown.store(false, Ordering::Release);

        let seen = self.shared.generation.load(Ordering::Acquire);
        for index in 0..count {
            let parker = Parker::new();
            let unparker = parker.unparker().clone();
            let shared = Arc::clone(&self.shared);

            let spawned = thread::Builder::new()
                .name(format!("strata-worker-{}", index))
                .spawn(move || worker_loop(shared, parker, seen));

            match spawned {
                Ok(handle) => self.workers.push(Worker { unparker, handle }),
                Err(e) => log::error!("[DISPATCH] Failed to spawn worker {}: {}", index, e),
            }
        }

        log::debug!("[DISPATCH] Worker pool rebuilt with {} threads", self.workers.len());
    }

    /// Invoke `job(i)` exactly once for every `i` in `0..job_count`
    ///
    /// Returns only after every index has been consumed and completed. The
    /// calling thread participates in draining, so the only idle wait is
    /// for jobs already running on workers. Jobs must not block on each
    /// other; there is no per-job error channel.
    pub fn run(&mut self, job_count: usize, job: &(dyn Fn(usize) + Sync)) {
        if job_count == 0 {
            return;
        }
        if job_count == 1 || self.workers.is_empty() {
            for index in 0..job_count {
                job(index);
            }
            return;
        }

        let shared = &*self.shared;

        // SAFETY: only the lifetime is erased. The pointer is cleared below
        // after the generation is closed and every worker has left `drain`,
        // so no thread can observe it once `job` goes out of scope.
        let ptr = unsafe {
            std::mem::transmute::<*const JobFn<'_>, *const JobFn<'static>>(job as *const JobFn<'_>)
        };
        unsafe {
            *shared.job.get() = Some(ptr);
        }
        shared.job_count.store(job_count, Ordering::Relaxed);
        shared.next_index.store(0, Ordering::Relaxed);
        shared.completed.store(0, Ordering::Relaxed);

        let generation = shared.generation.fetch_add(1, Ordering::Release) + 1;
        for worker in &self.workers {
            worker.unparker.unpark();
        }

        shared.drain();

        let backoff = Backoff::new();
        while shared.completed.load(Ordering::Acquire) < job_count {
            backoff.snooze();
        }

        shared.closed.store(generation, Ordering::SeqCst);
        let backoff = Backoff::new();
        while shared.active.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        unsafe {
            *shared.job.get() = None;
        }
    }

    /// Join all workers and reset counters (idempotent)
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.unparker.unpark();
        }
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                log::warn!("[DISPATCH] Worker thread exited with a panic");
            }
        }
        self.shared.reset_counters();
    }
}

impl Default for WorkDispatcher {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for WorkDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn counters(n: usize) -> Vec<AtomicUsize> {
        (0..n).map(|_| AtomicUsize::new(0)).collect()
    }

    fn assert_exactly_once(hits: &[AtomicUsize]) {
        for (i, hit) in hits.iter().enumerate() {
            assert_eq!(hit.load(Ordering::Relaxed), 1, "job {} ran wrong number of times", i);
        }
    }

    #[test]
    fn test_every_index_exactly_once() {
        for workers in 0..=MAX_WORKERS {
            let mut dispatcher = WorkDispatcher::new(workers);
            for jobs in [0, 1, 2, 3, 7, 16, 64, 128] {
                let hits = counters(jobs);
                dispatcher.run(jobs, &|i| {
                    hits[i].fetch_add(1, Ordering::Relaxed);
                });
                assert_exactly_once(&hits);
            }
        }
    }

    #[test]
    fn test_repeated_runs_with_changing_pool() {
        let mut dispatcher = WorkDispatcher::new(1);
        for round in 0..200 {
            if round % 25 == 0 {
                dispatcher.set_worker_count((round / 25) % (MAX_WORKERS + 1));
            }
            let jobs = 1 + (round * 7) % 40;
            let hits = counters(jobs);
            dispatcher.run(jobs, &|i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            });
            assert_exactly_once(&hits);
        }
    }

    #[test]
    fn test_inline_when_no_workers() {
        let mut dispatcher = WorkDispatcher::new(0);
        let caller = thread::current().id();
        let threads = Mutex::new(Vec::new());
        dispatcher.run(8, &|_| {
            threads.lock().unwrap().push(thread::current().id());
        });
        let threads = threads.into_inner().unwrap();
        assert_eq!(threads.len(), 8);
        assert!(threads.iter().all(|id| *id == caller));
    }

    #[test]
    fn test_uneven_jobs_are_shared() {
        let mut dispatcher = WorkDispatcher::new(3);
        let hits = counters(32);
        dispatcher.run(32, &|i| {
            if i % 4 == 0 {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert_exactly_once(&hits);
    }

    #[test]
    fn test_panicking_job_does_not_hang() {
        let mut dispatcher = WorkDispatcher::new(2);
        let hits = counters(16);
        dispatcher.run(16, &|i| {
            if i == 5 {
                panic!("job failure");
            }
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        for (i, hit) in hits.iter().enumerate() {
            let expected = if i == 5 { 0 } else { 1 };
            assert_eq!(hit.load(Ordering::Relaxed), expected);
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut dispatcher = WorkDispatcher::new(4);
        assert_eq!(dispatcher.worker_count(), 4);
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert_eq!(dispatcher.worker_count(), 0);

        let hits = counters(5);
        dispatcher.run(5, &|i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert_exactly_once(&hits);
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let dispatcher = WorkDispatcher::new(100);
        assert_eq!(dispatcher.worker_count(), MAX_WORKERS);
    }
}

//! Thread pools used to run layers.
//!
//! Kernels parallelize their per-channel or per-row loops with
//! [`parallel_for`], which runs on a fixed-size pool of worker threads shared
//! by the whole process. The pool is created on first use and its size is
//! global, but every call chooses how many of its threads to use, so two
//! concurrent callers with different thread budgets do not interfere.
//!
//! Pipeline creation for independent layers runs on a separate Rayon pool,
//! see [`thread_pool`].

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use crate::env::env_number;

/// A wrapper around the Rayon thread pool used for graph-level work, such
/// as creating the pipelines of many layers concurrently.
///
/// On platforms where threads are not supported this runs operations directly
/// on the calling thread.
pub struct ThreadPool {
    /// The wrapped thread pool, or None if we failed to construct one.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// This corresponds to [`rayon::ThreadPool::install`], except where the
    /// pool could not be created, in which case it just runs `op` directly.
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("packnn-rayon-{}", index))
            .build();

        ThreadPool { pool: pool.ok() }
    }
}

/// Return the Rayon thread pool used for graph-level concurrency.
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| ThreadPool::with_num_threads(default_num_threads()))
}

/// Return the optimal number of cores to use for maximum performance.
///
/// This counts physical rather than logical cores, as the kernels are
/// compute bound.
fn optimal_core_count() -> usize {
    num_cpus::get_physical().max(1)
}

/// Return the default thread count for kernels and the size of the worker
/// pool.
///
/// This can be overridden at the process level by setting the
/// `PACKNN_NUM_THREADS` environment variable, whose value must be a number
/// between 1 and the logical core count.
pub fn default_num_threads() -> usize {
    static NUM_THREADS: OnceLock<usize> = OnceLock::new();
    *NUM_THREADS.get_or_init(|| match env_number::<usize>("PACKNN_NUM_THREADS") {
        Some(n) => n.clamp(1, num_cpus::get().max(1)),
        None => optimal_core_count(),
    })
}

/// Latch which the submitter of a team waits on until every task finishes.
struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,

    /// Payload of the first panic raised by a task.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Latch {
    fn new(count: usize) -> Latch {
        Latch {
            remaining: Mutex::new(count),
            done: Condvar::new(),
            panic: Mutex::new(None),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.done.wait(remaining).unwrap();
        }
    }
}

/// One member's share of a team's work.
struct Task {
    /// Type-erased pointer to the team body.
    body: *const (),

    /// Invokes the body at `body` with `(team_size, thread_num)`.
    call: unsafe fn(*const (), usize, usize),

    team_size: usize,
    thread_num: usize,
    latch: Arc<Latch>,
}

// Safety: The body is `Sync` and the submitter keeps it alive until the
// latch has been released by every task.
unsafe impl Send for Task {}

impl Task {
    fn run(self) {
        let Task {
            body,
            call,
            team_size,
            thread_num,
            latch,
        } = self;
        let result = catch_unwind(AssertUnwindSafe(|| {
            with_region(team_size, thread_num, || {
                // Safety: See `unsafe impl Send for Task`.
                unsafe { call(body, team_size, thread_num) }
            })
        }));
        if let Err(payload) = result {
            latch.panic.lock().unwrap().get_or_insert(payload);
        }
        latch.count_down();
    }
}

unsafe fn call_body<F: Fn(usize, usize) + Sync>(body: *const (), team_size: usize, thread_num: usize) {
    let body = &*(body as *const F);
    body(team_size, thread_num)
}

enum Job {
    Run(Task),
    Stop,
}

/// Bounded blocking FIFO of jobs for the worker threads.
///
/// Producers block when the queue is full rather than growing it, which caps
/// the number of tasks in flight.
struct TaskQueue {
    jobs: Mutex<VecDeque<Job>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    fn new(capacity: usize) -> TaskQueue {
        TaskQueue {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Add a job, blocking while the queue is full.
    fn put(&self, job: Job) {
        let mut jobs = self.jobs.lock().unwrap();
        while jobs.len() >= self.capacity {
            jobs = self.not_full.wait(jobs).unwrap();
        }
        jobs.push_back(job);
        self.not_empty.notify_one();
    }

    /// Add a batch of jobs.
    ///
    /// The batch is enqueued in one step if there is space for all of it,
    /// otherwise jobs are added one at a time as space becomes available.
    fn dispatch(&self, batch: Vec<Job>) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if self.capacity - jobs.len() >= batch.len() {
                jobs.extend(batch);
                self.not_empty.notify_all();
                return;
            }
        }
        for job in batch {
            self.put(job);
        }
    }

    /// Remove the oldest job, blocking while the queue is empty.
    fn get(&self) -> Job {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop_front() {
                self.not_full.notify_one();
                return job;
            }
            jobs = self.not_empty.wait(jobs).unwrap();
        }
    }
}

/// Process-wide pool of worker threads for kernel parallel loops.
///
/// The thread which submits work also runs one share of it, so a pool sized
/// for N threads has N - 1 workers.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Maximum team size, including the submitting thread.
    num_threads: usize,

    /// True while the pool accepts work. Each parallel region holds a read
    /// lock for its duration, so shutdown waits for regions in flight.
    running: RwLock<bool>,
}

impl WorkerPool {
    fn new(num_threads: usize) -> WorkerPool {
        let queue = Arc::new(TaskQueue::new((4 * num_threads).max(16)));
        let mut workers = Vec::with_capacity(num_threads.saturating_sub(1));

        for index in 1..num_threads {
            let worker_queue = queue.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("packnn-{}", index))
                .spawn(move || worker_main(worker_queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    tracing::warn!(%err, index, "failed to spawn worker thread");
                    break;
                }
            }
        }

        let num_threads = workers.len() + 1;
        tracing::info!(num_threads, "started worker pool");

        WorkerPool {
            queue,
            workers: Mutex::new(workers),
            num_threads,
            running: RwLock::new(true),
        }
    }

    /// Return the maximum number of threads that can work on one region,
    /// including the submitting thread.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Stop and join all worker threads.
    ///
    /// Blocks until parallel regions in flight have finished. Regions
    /// started afterwards run on the calling thread.
    pub fn shutdown(&self) {
        let mut running = self.running.write().unwrap();
        if !*running {
            return;
        }
        *running = false;

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        self.queue
            .dispatch(workers.iter().map(|_| Job::Stop).collect());
        for worker in workers {
            let _ = worker.join();
        }
        tracing::debug!("worker pool shut down");
    }

    /// Run `body(team_size, thread_num)` once for each member of a team of
    /// up to `team_size` threads and wait for all of them to finish.
    ///
    /// The team is smaller than requested when the pool has fewer threads,
    /// and has a single member when called from inside another team.
    pub fn run_team<F: Fn(usize, usize) + Sync>(&self, team_size: usize, body: F) {
        let team_size = team_size.min(self.num_threads);
        if team_size <= 1 || in_parallel_region() {
            return with_region(1, 0, || body(1, 0));
        }

        let running = self.running.read().unwrap();
        if !*running {
            return with_region(1, 0, || body(1, 0));
        }

        let latch = Arc::new(Latch::new(team_size - 1));
        let jobs = (1..team_size)
            .map(|thread_num| {
                Job::Run(Task {
                    body: &body as *const F as *const (),
                    call: call_body::<F>,
                    team_size,
                    thread_num,
                    latch: latch.clone(),
                })
            })
            .collect();
        self.queue.dispatch(jobs);

        let result = catch_unwind(AssertUnwindSafe(|| {
            with_region(team_size, 0, || body(team_size, 0))
        }));

        // `body` must outlive every task, so wait even if our share panicked.
        latch.wait();
        std::mem::drop(running);

        if let Some(payload) = latch.panic.lock().unwrap().take() {
            resume_unwind(payload);
        }
        if let Err(payload) = result {
            resume_unwind(payload);
        }
    }
}

fn worker_main(queue: Arc<TaskQueue>) {
    loop {
        match queue.get() {
            Job::Run(task) => task.run(),
            Job::Stop => break,
        }
    }
}

static WORKER_POOL: OnceLock<WorkerPool> = OnceLock::new();

/// Return the process-wide worker pool, creating it on first use.
pub fn worker_pool() -> &'static WorkerPool {
    WORKER_POOL.get_or_init(|| WorkerPool::new(default_num_threads()))
}

/// Shut down the worker pool, if it was created.
///
/// Subsequent parallel loops run on the calling thread.
pub fn shutdown() {
    if let Some(pool) = WORKER_POOL.get() {
        pool.shutdown();
    }
}

thread_local! {
    /// Team size and thread number of the parallel region the current
    /// thread is executing, if any.
    static REGION: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Restores the previous region when dropped, including on unwind.
struct RegionGuard(Option<(usize, usize)>);

impl Drop for RegionGuard {
    fn drop(&mut self) {
        REGION.with(|region| region.set(self.0));
    }
}

fn with_region<R>(team_size: usize, thread_num: usize, f: impl FnOnce() -> R) -> R {
    let prev = REGION.with(|region| region.replace(Some((team_size, thread_num))));
    let _guard = RegionGuard(prev);
    f()
}

/// Return true if the current thread is executing a parallel region.
///
/// Parallel loops started inside a region run on the current thread only.
pub fn in_parallel_region() -> bool {
    REGION.with(|region| region.get().is_some())
}

/// Return the index of the current thread within its team, or 0 outside of a
/// parallel region.
pub fn current_thread_num() -> usize {
    REGION.with(|region| region.get().map(|(_, num)| num).unwrap_or(0))
}

/// Return the size of the current thread's team, or 1 outside of a parallel
/// region.
pub fn current_team_size() -> usize {
    REGION.with(|region| region.get().map(|(size, _)| size).unwrap_or(1))
}

/// Return the range of `0..n` handled by member `thread_num` of a team.
///
/// Ranges are contiguous and their sizes differ by at most one.
fn chunk_range(n: usize, team_size: usize, thread_num: usize) -> std::ops::Range<usize> {
    let base = n / team_size;
    let rem = n % team_size;
    let start = thread_num * base + thread_num.min(rem);
    let len = base + usize::from(thread_num < rem);
    start..start + len
}

/// Run `body(i)` for each `i` in `0..n`, using up to `num_threads` threads.
///
/// The range is split into `min(n, num_threads)` contiguous chunks, each run
/// by a different thread. The call returns once every iteration has
/// finished. If an iteration panics, the panic is propagated to the caller
/// after all chunks have finished.
///
/// Iterations must be independent. When called from inside another parallel
/// loop, all iterations run on the current thread.
pub fn parallel_for<F: Fn(usize) + Sync>(n: usize, num_threads: usize, body: F) {
    if n == 0 {
        return;
    }
    let team_size = n.min(num_threads.max(1));
    if team_size == 1 {
        return (0..n).for_each(body);
    }
    worker_pool().run_team(team_size, |team_size, thread_num| {
        for i in chunk_range(n, team_size, thread_num) {
            body(i);
        }
    });
}

/// Raw pointer that can be shared with the threads of a parallel loop.
struct SendPtr<T>(*mut T);

impl<T> SendPtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

// Safety: Used only to hand out disjoint sub-slices of a `&mut [T]` to
// different threads.
unsafe impl<T: Send> Send for SendPtr<T> {}
unsafe impl<T: Send> Sync for SendPtr<T> {}

/// Split `data` into chunks of `chunk_len` elements (the last may be shorter)
/// and run `body(index, chunk)` for each chunk in parallel.
pub fn parallel_for_each_mut<T: Send, F: Fn(usize, &mut [T]) + Sync>(
    data: &mut [T],
    chunk_len: usize,
    num_threads: usize,
    body: F,
) {
    if chunk_len == 0 || data.is_empty() {
        return;
    }
    let len = data.len();
    let n_chunks = len.div_ceil(chunk_len);
    let base = SendPtr(data.as_mut_ptr());
    parallel_for(n_chunks, num_threads, |i| {
        let start = i * chunk_len;
        let end = (start + chunk_len).min(len);

        // Safety: Each chunk index is visited exactly once, so the chunks
        // handed out are disjoint and within `data`.
        let chunk = unsafe { std::slice::from_raw_parts_mut(base.get().add(start), end - start) };
        body(i, chunk);
    });
}

/// Return the number of scratch slots that
/// [`parallel_for_each_mut_with_scratch`] needs to process `n_chunks` chunks
/// with up to `num_threads` threads.
pub fn scratch_slots(n_chunks: usize, num_threads: usize) -> usize {
    n_chunks.min(num_threads.max(1)).max(1)
}

/// Variant of [`parallel_for_each_mut`] which also gives each thread its own
/// slot of `slot_len` elements from `scratch`.
///
/// `scratch` must hold at least [`scratch_slots`] slots for the number of
/// chunks in `data`. Slots are reused between the chunks a thread handles
/// and are not cleared in between.
pub fn parallel_for_each_mut_with_scratch<T, U, F>(
    data: &mut [T],
    chunk_len: usize,
    scratch: &mut [U],
    slot_len: usize,
    num_threads: usize,
    body: F,
) where
    T: Send,
    U: Send,
    F: Fn(usize, &mut [T], &mut [U]) + Sync,
{
    if chunk_len == 0 || data.is_empty() {
        return;
    }
    let len = data.len();
    let n_chunks = len.div_ceil(chunk_len);
    let team_size = scratch_slots(n_chunks, num_threads);
    assert!(
        scratch.len() >= team_size * slot_len,
        "scratch holds fewer than {} slots",
        team_size
    );

    if team_size == 1 {
        let slot = &mut scratch[..slot_len];
        for (i, chunk) in data.chunks_mut(chunk_len).enumerate() {
            body(i, chunk, slot);
        }
        return;
    }

    let base = SendPtr(data.as_mut_ptr());
    let scratch_base = SendPtr(scratch.as_mut_ptr());
    worker_pool().run_team(team_size, |team_size, thread_num| {
        // Safety: Team members have distinct thread numbers below the
        // requested team size, so each gets a different slot.
        let slot = unsafe {
            std::slice::from_raw_parts_mut(scratch_base.get().add(thread_num * slot_len), slot_len)
        };
        for i in chunk_range(n_chunks, team_size, thread_num) {
            let start = i * chunk_len;
            let end = (start + chunk_len).min(len);

            // Safety: Chunk ranges of team members are disjoint.
            let chunk =
                unsafe { std::slice::from_raw_parts_mut(base.get().add(start), end - start) };
            body(i, chunk, slot);
        }
    });
}

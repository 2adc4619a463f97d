//! Fixed-capacity worker pools.
//!
//! A pool owns a fixed array of worker slots. Idle workers park on their
//! slot condvar; the dispatcher pops an index off the idle queue, stores
//! the work item in the slot and signals it. A regulator thread keeps the
//! number of spare workers between `min_spare` and `max_spare`, spawning
//! into never-used slots and marking excess idle workers dying. The queues
//! and slot locks are short-lived internals and sit outside the leveled
//! lock classes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

/// How long shutdown waits for busy workers before abandoning them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A condvar-backed queue that can be told the pool is exiting.
pub struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
    non_empty: Condvar,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    exiting: bool,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                exiting: false,
            }),
            non_empty: Condvar::new(),
        }
    }

    pub fn put(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        self.non_empty.notify_one();
    }

    /// Blocking pop; `None` once the queue is told to exit.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.exiting {
                return None;
            }
            self.non_empty.wait(&mut inner);
        }
    }

    /// Non-blocking pop.
    pub fn try_get(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake all waiters; subsequent gets drain the queue then return `None`.
    pub fn set_exiting(&self) {
        self.inner.lock().exiting = true;
        self.non_empty.notify_all();
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Busy,
    Dying,
    Dead,
}

struct SlotInner<W> {
    state: WorkerState,
    work: Option<W>,
}

struct WorkerSlot<W> {
    inner: Mutex<SlotInner<W>>,
    cond: Condvar,
}

/// Pool sizing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Spawn new workers when fewer than this many are idle.
    pub min_spare: usize,
    /// Retire idle workers beyond this many.
    pub max_spare: usize,
    /// Slot capacity of the pool.
    pub max_threads: usize,
    /// Regulator wake-up period.
    pub regulator_period: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits {
            min_spare: 2,
            max_spare: 8,
            max_threads: 16,
            regulator_period: Duration::from_millis(250),
        }
    }
}

struct PoolShared<W> {
    name: &'static str,
    limits: PoolLimits,
    slots: Vec<WorkerSlot<W>>,
    /// Indices of idle workers.
    idle: Queue<usize>,
    /// Indices of slots with no live thread.
    empty: Queue<usize>,
    running: AtomicBool,
    busy: AtomicUsize,
    handler: Box<dyn Fn(W) + Send + Sync>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of worker threads handling items of type `W`.
pub struct WorkerPool<W: Send + 'static> {
    shared: Arc<PoolShared<W>>,
    regulator: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Send + 'static> WorkerPool<W> {
    /// Create the pool and spawn `min_spare` initial workers plus the
    /// regulator thread.
    pub fn new(
        name: &'static str,
        limits: PoolLimits,
        handler: impl Fn(W) + Send + Sync + 'static,
    ) -> Arc<WorkerPool<W>> {
        assert!(limits.max_threads >= 1);
        assert!(limits.min_spare >= 1);
        let mut slots = Vec::with_capacity(limits.max_threads);
        for _ in 0..limits.max_threads {
            slots.push(WorkerSlot {
                inner: Mutex::new(SlotInner {
                    state: WorkerState::Dead,
                    work: None,
                }),
                cond: Condvar::new(),
            });
        }
        let shared = Arc::new(PoolShared {
            name,
            limits,
            slots,
            idle: Queue::new(),
            empty: Queue::new(),
            running: AtomicBool::new(true),
            busy: AtomicUsize::new(0),
            handler: Box::new(handler),
            threads: Mutex::new(Vec::new()),
        });
        for index in 0..limits.max_threads {
            shared.empty.put(index);
        }
        for _ in 0..limits.min_spare {
            spawn_worker(&shared);
        }
        let pool = Arc::new(WorkerPool {
            shared: shared.clone(),
            regulator: Mutex::new(None),
        });
        let regulator = std::thread::Builder::new()
            .name(format!("{name}-regulator"))
            .spawn(move || regulator_main(shared))
            .expect("spawning the regulator");
        *pool.regulator.lock() = Some(regulator);
        pool
    }

    /// Hand `work` to an idle worker, spawning one if the pool still has
    /// capacity. Fails with the work item once the pool is shutting down.
    pub fn dispatch(&self, work: W) -> Result<(), W> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(work);
        }
        let mut work = Some(work);
        loop {
            let index = match shared.idle.try_get() {
                Some(index) => index,
                None => {
                    spawn_worker(shared);
                    match shared.idle.get() {
                        Some(index) => index,
                        None => return Err(work.take().expect("work not yet handed off")),
                    }
                }
            };
            let slot = &shared.slots[index];
            let mut inner = slot.inner.lock();
            // A worker that died during shutdown may leave its index behind.
            if inner.state != WorkerState::Idle {
                continue;
            }
            inner.state = WorkerState::Busy;
            inner.work = work.take();
            slot.cond.notify_one();
            return Ok(());
        }
    }

    /// Number of workers currently handling an item.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Number of idle workers.
    pub fn idle(&self) -> usize {
        self.shared.idle.len()
    }

    /// Stop accepting work, retire idle workers and wait up to `grace` for
    /// the busy ones. Returns whether the pool drained completely.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let shared = &self.shared;
        if shared.running.swap(false, Ordering::AcqRel) {
            shared.idle.set_exiting();
            shared.empty.set_exiting();
            for slot in &shared.slots {
                let _inner = slot.inner.lock();
                slot.cond.notify_all();
            }
        }
        if let Some(regulator) = self.regulator.lock().take() {
            let _ = regulator.join();
        }

        let deadline = Instant::now() + grace;
        while shared.busy.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "{}: {} workers still busy past the shutdown grace",
                    shared.name,
                    shared.busy.load(Ordering::Acquire)
                );
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let threads = std::mem::take(&mut *shared.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
        true
    }
}

impl<W: Send + 'static> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.shutdown(SHUTDOWN_GRACE);
    }
}

impl<W: Send + 'static> std::fmt::Debug for WorkerPool<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("idle", &self.shared.idle.len())
            .field("busy", &self.shared.busy.load(Ordering::Relaxed))
            .finish()
    }
}

/// Spawn a worker into a never-used (or reaped) slot, if one is free.
fn spawn_worker<W: Send + 'static>(shared: &Arc<PoolShared<W>>) {
    if !shared.running.load(Ordering::Acquire) {
        return;
    }
    let Some(index) = shared.empty.try_get() else {
        return;
    };
    {
        let mut inner = shared.slots[index].inner.lock();
        inner.state = WorkerState::Idle;
        inner.work = None;
    }
    let worker_shared = shared.clone();
    let result = std::thread::Builder::new()
        .name(format!("{}-worker-{index}", shared.name))
        .spawn(move || worker_main(worker_shared, index));
    match result {
        Ok(handle) => {
            shared.threads.lock().push(handle);
            shared.idle.put(index);
            debug!("{}: worker {index} spawned", shared.name);
        }
        Err(err) => {
            warn!("{}: cannot spawn worker: {err}", shared.name);
            shared.slots[index].inner.lock().state = WorkerState::Dead;
            shared.empty.put(index);
        }
    }
}

fn worker_main<W: Send + 'static>(shared: Arc<PoolShared<W>>, index: usize) {
    let slot = &shared.slots[index];
    loop {
        let work = {
            let mut inner = slot.inner.lock();
            loop {
                if inner.state == WorkerState::Dying || !shared.running.load(Ordering::Acquire) {
                    if inner.work.is_none() {
                        inner.state = WorkerState::Dead;
                        drop(inner);
                        shared.empty.put(index);
                        debug!("{}: worker {index} exiting", shared.name);
                        return;
                    }
                }
                if let Some(work) = inner.work.take() {
                    break work;
                }
                slot.cond.wait(&mut inner);
            }
        };

        shared.busy.fetch_add(1, Ordering::AcqRel);
        (shared.handler)(work);
        shared.busy.fetch_sub(1, Ordering::AcqRel);

        // Back to the idle queue, unless asked to die or shutting down.
        let mut inner = slot.inner.lock();
        if inner.state == WorkerState::Dying || !shared.running.load(Ordering::Acquire) {
            inner.state = WorkerState::Dead;
            drop(inner);
            shared.empty.put(index);
            debug!("{}: worker {index} exiting after work", shared.name);
            return;
        }
        inner.state = WorkerState::Idle;
        drop(inner);
        shared.idle.put(index);
    }
}

fn regulator_main<W: Send + 'static>(shared: Arc<PoolShared<W>>) {
    while shared.running.load(Ordering::Acquire) {
        std::thread::sleep(shared.limits.regulator_period);
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let idle = shared.idle.len();
        if idle < shared.limits.min_spare {
            for _ in idle..shared.limits.min_spare {
                spawn_worker(&shared);
            }
        } else if idle > shared.limits.max_spare {
            for _ in shared.limits.max_spare..idle {
                let Some(index) = shared.idle.try_get() else {
                    break;
                };
                let mut inner = shared.slots[index].inner.lock();
                inner.state = WorkerState::Dying;
                shared.slots[index].cond.notify_one();
            }
        }
    }
}

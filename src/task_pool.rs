// Sparse clockwork hierarchy - task pool
//
// Fixed-size worker pool driving all per-column work.
//
// Workers block until a task is handed to them. `TaskPool::submit` gives a
// task straight to an idle worker, or queues it (FIFO) when every worker is
// busy; a worker that finishes pulls the next queued task before going idle.
// `TaskPool::wait` is a full barrier.
//
// There is no work stealing, no priority and no ordering between tasks.
// Callers must partition memory so that tasks of one pass never write the
// same address. `TaskPool::scope` makes that structural: tasks may borrow
// caller data (typically disjoint `&mut` chunks) and the scope does not
// return until all of them have finished.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SlotState {
    task: Option<Task>,
    /// Set to wake the worker (new task or shutdown).
    proceed: bool,
    /// True from hand-off until the worker finds the queue empty.
    busy: bool,
    shutdown: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    signal: Condvar,
}

impl Slot {
    fn wait_while<'a>(
        &self,
        mut state: MutexGuard<'a, SlotState>,
        condition: impl Fn(&SlotState) -> bool,
    ) -> MutexGuard<'a, SlotState> {
        while condition(&state) {
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    idle: VecDeque<usize>,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    panicked: AtomicBool,
}

struct Worker {
    slot: Arc<Slot>,
    handle: Option<JoinHandle<()>>,
}

pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

fn run_worker(index: usize, slot: Arc<Slot>, shared: Arc<Shared>) {
    loop {
        let task = {
            let state = lock(&slot.state);
            let mut state = slot.wait_while(state, |s| !s.proceed);
            state.proceed = false;

            if state.shutdown {
                break;
            }

            state.task.take()
        };

        if let Some(task) = task {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::warn!("task panicked on pool worker {index}");
                shared.panicked.store(true, Ordering::SeqCst);
            }
        }

        // Lock order: queue, then slot (same as submit)
        let mut queue = lock(&shared.queue);
        let mut state = lock(&slot.state);

        match queue.tasks.pop_front() {
            Some(next) => {
                state.task = Some(next);
                state.proceed = true;
            }
            None => {
                state.busy = false;
                queue.idle.push_back(index);
            }
        }

        drop(state);
        drop(queue);
        slot.signal.notify_all();
    }
}

impl TaskPool {
    /// Spawn `num_workers` blocked workers. Zero is clamped to one.
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            log::warn!("task pool requested with zero workers, using one");
            1
        } else {
            num_workers
        };

        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let slot = Arc::new(Slot::default());

            lock(&shared.queue).idle.push_back(index);

            let worker_slot = Arc::clone(&slot);
            let worker_shared = Arc::clone(&shared);

            let handle = thread::Builder::new()
                .name(format!("task-pool-{index}"))
                .spawn(move || run_worker(index, worker_slot, worker_shared))
                .unwrap_or_else(|e| panic!("failed to spawn pool worker {index}: {e}"));

            workers.push(Worker {
                slot,
                handle: Some(handle),
            });
        }

        Self { shared, workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Hand a task to an idle worker, or queue it.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Box::new(task));
    }

    fn submit_task(&self, task: Task) {
        let mut queue = lock(&self.shared.queue);

        match queue.idle.pop_front() {
            Some(index) => {
                let slot = &self.workers[index].slot;
                let mut state = lock(&slot.state);
                state.task = Some(task);
                state.busy = true;
                state.proceed = true;
                drop(state);
                slot.signal.notify_all();
            }
            None => queue.tasks.push_back(task),
        }
    }

    /// Block until every worker is idle and the queue is empty.
    ///
    /// # Panics
    /// Re-raises on the calling thread if any task panicked since the last barrier.
    pub fn wait(&self) {
        self.barrier();
        self.raise_task_panics();
    }

    // The queue can be refilled between the two checks, hence the loop.
    fn barrier(&self) {
        loop {
            for worker in &self.workers {
                let state = lock(&worker.slot.state);
                drop(worker.slot.wait_while(state, |s| s.busy));
            }

            let queue = lock(&self.shared.queue);

            if queue.tasks.is_empty() {
                break;
            }
        }
    }

    fn raise_task_panics(&self) {
        if self.shared.panicked.swap(false, Ordering::SeqCst) {
            panic!("a task submitted to the pool panicked");
        }
    }

    /// Run `f` with a [`Scope`] whose tasks may borrow from the caller.
    /// Returns only after all tasks submitted through the scope are done,
    /// including when `f` unwinds.
    pub fn scope<'scope, R>(&'scope self, f: impl FnOnce(&Scope<'scope>) -> R) -> R {
        struct BarrierGuard<'a>(&'a TaskPool);

        impl Drop for BarrierGuard<'_> {
            fn drop(&mut self) {
                self.0.barrier();
            }
        }

        let guard = BarrierGuard(self);
        let scope = Scope {
            pool: self,
            _invariant: PhantomData,
        };

        let result = f(&scope);

        drop(guard);
        self.raise_task_panics();

        result
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        lock(&self.shared.queue).tasks.clear();

        for worker in &self.workers {
            let mut state = lock(&worker.slot.state);
            state.shutdown = true;
            state.proceed = true;
            drop(state);
            worker.slot.signal.notify_all();
        }

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Submission handle for tasks borrowing data that outlives the scope.
pub struct Scope<'scope> {
    pool: &'scope TaskPool,
    _invariant: PhantomData<fn(&'scope ()) -> &'scope ()>,
}

impl<'scope> Scope<'scope> {
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        let task: Box<dyn FnOnce() + Send + 'scope> = Box::new(task);

        // SAFETY: `TaskPool::scope` runs the pool barrier before returning or
        // unwinding, so the task finishes before anything it borrows can be
        // dropped. Only the lifetime bound is erased.
        let task: Task = unsafe {
            std::mem::transmute::<Box<dyn FnOnce() + Send + 'scope>, Task>(task)
        };

        self.pool.submit_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn counter_reaches_exact_total() {
        for &num_workers in &[1usize, 2, 8] {
            let pool = TaskPool::new(num_workers);
            let counter = Arc::new(AtomicUsize::new(0));

            for _ in 0..1000 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }

            pool.wait();

            assert_eq!(counter.load(Ordering::SeqCst), 1000, "workers={num_workers}");
        }
    }

    #[test]
    fn scoped_tasks_write_disjoint_chunks() {
        let pool = TaskPool::new(4);
        let mut data = vec![0usize; 64 * 16];

        pool.scope(|s| {
            for (i, chunk) in data.chunks_mut(16).enumerate() {
                s.submit(move || {
                    for (j, v) in chunk.iter_mut().enumerate() {
                        *v = i * 16 + j;
                    }
                });
            }
        });

        assert!(data.iter().enumerate().all(|(i, &v)| i == v));
    }

    #[test]
    fn pool_is_reusable_across_barriers() {
        let pool = TaskPool::new(3);
        let counter = AtomicUsize::new(0);

        for round in 1..=5 {
            pool.scope(|s| {
                for _ in 0..50 {
                    let counter = &counter;
                    s.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });

            assert_eq!(counter.load(Ordering::SeqCst), round * 50);
        }
    }

    #[test]
    fn zero_workers_is_clamped() {
        let pool = TaskPool::new(0);
        assert_eq!(pool.num_workers(), 1);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_panic_surfaces_at_barrier() {
        let pool = TaskPool::new(2);
        pool.submit(|| panic!("boom"));

        let result = panic::catch_unwind(AssertUnwindSafe(|| pool.wait()));
        assert!(result.is_err());

        // The pool keeps working afterwards
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

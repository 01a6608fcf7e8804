//! Runs callables on a [`WorkerPool`] under one of four ordering policies.

use super::{
    config::PoolOptions,
    errors::{panic_message, DispatchError, PoolError, TaskError},
    handle::{AsyncState, TaskHandle, TaskResult},
    model::{OrderingKey, OrderingMode},
    pool::{Work, WorkerPool},
};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};


pub const SHARED_POOL_NAME: &str = "task-dispatcher";

static SHARED_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

type TaskFn<A, R> = Box<dyn FnOnce(&A) -> R + Send + 'static>;
type CompletionFn<A, R> = Box<dyn FnOnce(&TaskResult<A, R>) + Send + 'static>;


/// A callable submitted to the dispatcher, optionally tied to an ordering key.
pub struct Task<A, R> {
    key: Option<OrderingKey>,
    f: TaskFn<A, R>,
}

impl<A, R> Task<A, R> {
    /// An unbound task. Rejected in [`OrderingMode::ByTaskTargetKey`].
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&A) -> R + Send + 'static,
    {
        Self { key: None, f: Box::new(f) }
    }

    /// A task bound to `target`; tasks sharing a target share a queue.
    pub fn bound<T, F>(target: &Arc<T>, f: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(&T, &A) -> R + Send + 'static,
    {
        let target = Arc::clone(target);
        Self {
            key: Some(OrderingKey::of(&target)),
            f: Box::new(move |args| f(&target, args)),
        }
    }

    pub fn keyed<F>(key: OrderingKey, f: F) -> Self
    where
        F: FnOnce(&A) -> R + Send + 'static,
    {
        Self { key: Some(key), f: Box::new(f) }
    }

    #[inline]
    pub fn key(&self) -> Option<OrderingKey> {
        self.key
    }
}

impl<A, R> fmt::Debug for Task<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("key", &self.key).finish_non_exhaustive()
    }
}


/// Callback run with the populated [`TaskResult`] after a task completes.
pub struct Completion<A, R> {
    key: Option<OrderingKey>,
    f: CompletionFn<A, R>,
}

impl<A, R> Completion<A, R> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&TaskResult<A, R>) + Send + 'static,
    {
        Self { key: None, f: Box::new(f) }
    }

    pub fn bound<T, F>(target: &Arc<T>, f: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(&T, &TaskResult<A, R>) + Send + 'static,
    {
        let target = Arc::clone(target);
        Self {
            key: Some(OrderingKey::of(&target)),
            f: Box::new(move |result| f(&target, result)),
        }
    }

    pub fn keyed<F>(key: OrderingKey, f: F) -> Self
    where
        F: FnOnce(&TaskResult<A, R>) + Send + 'static,
    {
        Self { key: Some(key), f: Box::new(f) }
    }

    #[inline]
    pub fn key(&self) -> Option<OrderingKey> {
        self.key
    }
}

impl<A, R> fmt::Debug for Completion<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("key", &self.key).finish_non_exhaustive()
    }
}


/// One submission, owned by the job closure until it runs.
///
/// Dropped without running, it completes its result as abandoned.
struct Invocation<A, R> {
    task: Option<TaskFn<A, R>>,
    completion: Option<CompletionFn<A, R>>,
    result: Arc<TaskResult<A, R>>,
}

impl<A, R> Invocation<A, R> {
    fn run(mut self) {
        let Some(task) = self.task.take() else { return };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(self.result.args())))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
        if let Err(err) = &outcome {
            tracing::debug!(error = %err, "task faulted");
        }

        // waiters are released before the completion callback runs
        self.result.complete(outcome);

        if let Some(completion) = self.completion.take() {
            let result: &TaskResult<A, R> = &self.result;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| completion(result))) {
                tracing::error!(
                    error = %panic_message(payload.as_ref()),
                    "completion callback panicked"
                );
            }
        }
    }
}

impl<A, R> Drop for Invocation<A, R> {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.result.complete(Err(TaskError::Abandoned));
        }
        // the completion callback, if any, has returned by now
        self.result.settle();
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unordered,
    Key(OrderingKey),
    Sequential,
}

#[derive(Default)]
struct Queues {
    /// A present key means its head job is in flight.
    by_key: HashMap<OrderingKey, VecDeque<Work>>,
    sequential: VecDeque<Work>,
    executing: bool,
}

impl Queues {
    /// Frees `slot` and hands back everything still queued behind it.
    fn drain(&mut self, slot: Slot) -> VecDeque<Work> {
        match slot {
            Slot::Unordered => VecDeque::new(),
            Slot::Key(key) => self.by_key.remove(&key).unwrap_or_default(),
            Slot::Sequential => {
                self.executing = false;
                mem::take(&mut self.sequential)
            }
        }
    }
}

struct Inner {
    mode: OrderingMode,
    pool: Arc<WorkerPool>,
    queues: Mutex<Queues>,
}

impl Inner {
    /// Frees `slot` and hands its next queued job, if any, to the pool.
    ///
    /// Queued jobs carry no slot guard, so dropping a backlog unrun abandons
    /// each entry without re-entering here.
    fn release(self: &Arc<Self>, slot: Slot) {
        let (next, backlog) = {
            let mut q = self.queues.lock();
            if self.pool.is_disposed() {
                (None, q.drain(slot))
            } else {
                let next = match slot {
                    Slot::Unordered => None,
                    Slot::Key(key) => {
                        let next = q.by_key.get_mut(&key).and_then(VecDeque::pop_front);
                        if next.is_none() {
                            q.by_key.remove(&key);
                        }
                        next
                    }
                    Slot::Sequential => {
                        let next = q.sequential.pop_front();
                        if next.is_none() {
                            q.executing = false;
                        }
                        next
                    }
                };
                (next, VecDeque::new())
            }
        };

        if !backlog.is_empty() {
            tracing::debug!(abandoned = backlog.len(), "pool disposed, queued tasks abandoned");
        }
        drop(backlog);

        if let Some(entry) = next {
            // a rejected job drops its guard, which lands in the drain above
            if let Err(err) = self.dispatch(slot, entry) {
                tracing::debug!(error = %err, "queued task abandoned");
            }
        }
    }

    /// Submits `entry` with a guard that releases `slot` once it is done.
    fn dispatch(self: &Arc<Self>, slot: Slot, entry: Work) -> Result<(), PoolError> {
        let guard = SlotGuard {
            inner: Arc::clone(self),
            slot,
        };
        self.pool.submit(Box::new(move || {
            entry();
            drop(guard);
        }))
    }
}

/// Releases the ordering slot when the job finishes or is dropped unrun.
struct SlotGuard {
    inner: Arc<Inner>,
    slot: Slot,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release(self.slot);
    }
}


/// Executes tasks on a worker pool, serializing them per [`OrderingMode`].
///
/// ```no_run
/// use ordered_pool::{OrderedTaskDispatcher, OrderingMode, Task};
///
/// let dispatcher = OrderedTaskDispatcher::new(OrderingMode::Sequential)?;
/// let handle = dispatcher.execute(Task::new(|(a, b): &(i32, i32)| a + b), None, None, (2, 3))?;
/// assert_eq!(dispatcher.end_invoke(handle), Ok(5));
/// # Ok::<(), ordered_pool::DispatchError>(())
/// ```
pub struct OrderedTaskDispatcher {
    inner: Arc<Inner>,
}

impl OrderedTaskDispatcher {
    /// Dispatcher on the process-wide pool named [`SHARED_POOL_NAME`].
    pub fn new(mode: OrderingMode) -> Result<Self, DispatchError> {
        Ok(Self::with_pool(mode, shared_pool()?))
    }

    pub fn with_pool(mode: OrderingMode, pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                pool,
                queues: Mutex::new(Queues::default()),
            }),
        }
    }

    /// Applies `options` to the shared pool, creating it if needed.
    pub fn configure_shared_pool(options: &PoolOptions) -> Result<(), DispatchError> {
        shared_pool()?.configure(options)?;
        Ok(())
    }

    #[inline]
    pub fn mode(&self) -> OrderingMode {
        self.inner.mode
    }

    #[inline]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Submissions waiting behind an in-flight task of the same queue.
    pub fn pending_count(&self) -> usize {
        let q = self.inner.queues.lock();
        q.by_key.values().map(VecDeque::len).sum::<usize>() + q.sequential.len()
    }

    /// Submits `task` with `args`.
    ///
    /// The returned handle exists before the task starts. Task panics are
    /// captured into the result; completion panics are logged and dropped.
    pub fn execute<A, R>(
        &self,
        task: Task<A, R>,
        completion: Option<Completion<A, R>>,
        state: Option<AsyncState>,
        args: A,
    ) -> Result<TaskHandle<A, R>, DispatchError>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        let slot = match self.inner.mode {
            OrderingMode::Unordered => Slot::Unordered,
            OrderingMode::ByTaskTargetKey => Slot::Key(task.key.ok_or(DispatchError::MissingTarget)?),
            OrderingMode::ByReturnTargetKey => Slot::Key(
                completion
                    .as_ref()
                    .and_then(Completion::key)
                    .ok_or(DispatchError::MissingCompletion)?,
            ),
            OrderingMode::Sequential => Slot::Sequential,
        };
        if self.inner.pool.is_disposed() {
            return Err(PoolError::Disposed(self.inner.pool.name().to_string()).into());
        }

        let result = Arc::new(TaskResult::new(args, state));
        let invocation = Invocation {
            task: Some(task.f),
            completion: completion.map(|c| c.f),
            result: result.clone(),
        };
        let job: Work = Box::new(move || invocation.run());

        let immediate = {
            let mut q = self.inner.queues.lock();
            match slot {
                Slot::Unordered => Some(job),
                Slot::Key(key) => match q.by_key.entry(key) {
                    Entry::Occupied(mut list) => {
                        list.get_mut().push_back(job);
                        None
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(VecDeque::new());
                        Some(job)
                    }
                },
                Slot::Sequential => {
                    if q.executing {
                        q.sequential.push_back(job);
                        None
                    } else {
                        q.executing = true;
                        Some(job)
                    }
                }
            }
        };

        if let Some(job) = immediate {
            // a rejected job is dropped, which releases the slot it claimed
            self.inner.dispatch(slot, job)?;
        }

        Ok(TaskHandle::new(result))
    }

    /// Blocks until the task behind `handle` completes.
    pub fn end_invoke<A, R>(&self, handle: TaskHandle<A, R>) -> Result<R, TaskError> {
        handle.end_invoke()
    }
}

impl fmt::Debug for OrderedTaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedTaskDispatcher")
            .field("mode", &self.inner.mode)
            .field("pool", &self.inner.pool.name())
            .field("pending", &self.pending_count())
            .finish()
    }
}


fn shared_pool() -> Result<Arc<WorkerPool>, PoolError> {
    if let Some(pool) = SHARED_POOL.get() {
        return Ok(pool.clone());
    }
    let pool = Arc::new(WorkerPool::new(SHARED_POOL_NAME)?);
    // a concurrent initializer may win; the spare pool is disposed on drop
    Ok(SHARED_POOL.get_or_init(|| pool).clone())
}

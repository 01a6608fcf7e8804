use super::{
    config::{PoolConfiguration, PoolOptions, DEFAULT_IDLE_SHUTDOWN_MS},
    errors::{panic_message, PoolError},
    model::{PoolMetrics, WaitTimeout},
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};


/// A unit of work queued on the pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Shutdown acknowledgements are awaited in batches of this size.
const SHUTDOWN_BATCH: usize = 64;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);


struct WorkerRecord {
    assigned: Option<Work>,
    /// Auto-reset wake signal: at most one pending token.
    wake: Sender<()>,
    shutdown_ack: Receiver<()>,
    force_shutdown: bool,
    thread: Option<JoinHandle<()>>,
}

struct PoolState {
    min_threads: usize,
    max_threads: usize,
    idle_timeout: WaitTimeout,
    read_only: bool,
    queue: VecDeque<Work>,
    workers: HashMap<usize, WorkerRecord>,
    idle: Vec<usize>,
    peak_threads: usize,
    completed: usize,
    failed: usize,
}

impl PoolState {
    #[inline]
    fn live(&self) -> usize {
        self.workers.len()
    }

    fn mark_busy(&mut self, id: usize) {
        self.idle.retain(|w| *w != id);
    }

    fn retire(&mut self, id: usize) -> Option<WorkerRecord> {
        self.mark_busy(id);
        self.workers.remove(&id)
    }
}

struct Shared {
    name: String,
    validate_bounds: bool,
    disposed: AtomicBool,
    next_worker: AtomicUsize,
    state: Mutex<PoolState>,
}

impl Shared {
    fn bound_allowed(&self, value: usize) -> bool {
        !self.validate_bounds || value >= num_cpus::get()
    }

    /// Starts a worker. Called with the pool state locked, so the new thread
    /// cannot look up its record before it is inserted.
    fn spawn_worker(
        self: &Arc<Self>,
        st: &mut PoolState,
        assigned: Option<Work>,
    ) -> Result<usize, (io::Error, Option<Work>)> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed) + 1;
        let (wake_tx, wake_rx) = channel::bounded(1);
        let (ack_tx, ack_rx) = channel::bounded(1);
        let shared = Arc::clone(self);

        // The new thread's first act is to lock the state, which the caller
        // holds until the record below is inserted.
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, id))
            .spawn(move || shared.worker_main(id, wake_rx, ack_tx));

        match spawned {
            Ok(handle) => {
                if assigned.is_none() {
                    st.idle.push(id);
                }
                st.workers.insert(
                    id,
                    WorkerRecord {
                        assigned,
                        wake: wake_tx,
                        shutdown_ack: ack_rx,
                        force_shutdown: false,
                        thread: Some(handle),
                    },
                );
                st.peak_threads = st.peak_threads.max(st.live());
                Ok(id)
            }
            Err(err) => Err((err, assigned)),
        }
    }

    fn worker_main(self: Arc<Self>, id: usize, wake: Receiver<()>, ack: Sender<()>) {
        tracing::debug!(pool = %self.name, worker = id, "worker started");

        // The exit decision and the record removal share one critical section,
        // so concurrent retirements never undershoot the minimum.
        let retired = loop {
            let (task, idle_timeout) = {
                let mut st = self.state.lock();
                let Some(record) = st.workers.get_mut(&id) else { break None };
                if record.force_shutdown || self.disposed.load(Ordering::Acquire) {
                    break st.retire(id);
                }

                let mut task = record.assigned.take();
                if task.is_none() {
                    if st.live() > st.max_threads {
                        // over the bound with nothing to do
                        break st.retire(id);
                    }
                    if let Some(work) = st.queue.pop_front() {
                        st.mark_busy(id);
                        task = Some(work);
                    }
                }
                (task, st.idle_timeout)
            };

            let task = match task {
                Some(task) => task,
                None => {
                    let signaled = match idle_timeout {
                        WaitTimeout::Infinite => {
                            let _ = wake.recv();
                            true
                        }
                        WaitTimeout::After(timeout) => match wake.recv_timeout(timeout) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                            Err(RecvTimeoutError::Timeout) => false,
                        },
                    };

                    let mut st = self.state.lock();
                    let Some(record) = st.workers.get_mut(&id) else { break None };
                    if record.force_shutdown || self.disposed.load(Ordering::Acquire) {
                        break st.retire(id);
                    }
                    match record.assigned.take() {
                        Some(task) => task,
                        None if !signaled && st.live() > st.min_threads => break st.retire(id),
                        None => continue,
                    }
                }
            };

            self.run(id, task);
        };

        let forced = retired.as_ref().map_or(false, |r| r.force_shutdown);
        drop(retired);
        if forced {
            let _ = ack.send(());
        }

        tracing::debug!(pool = %self.name, worker = id, forced, "worker exited");
    }

    fn run(&self, id: usize, task: Work) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(task));

        let mut st = self.state.lock();
        match &outcome {
            Ok(()) => st.completed += 1,
            Err(_) => st.failed += 1,
        }
        if st.workers.contains_key(&id) {
            st.idle.push(id);
        }
        drop(st);

        if let Err(payload) = outcome {
            tracing::error!(
                pool = %self.name,
                worker = id,
                error = %panic_message(payload.as_ref()),
                "queued work panicked"
            );
        }
    }
}


/// Elastic pool of OS threads.
///
/// Keeps between `min_threads` and `max_threads` workers alive. Idle workers
/// above the minimum exit after `idle_timeout`. Dropping the pool disposes it.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn builder(name: impl Into<String>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(name)
    }

    pub fn new(name: impl Into<String>) -> Result<Self, PoolError> {
        Self::builder(name).build()
    }

    pub fn with_options(name: impl Into<String>, options: &PoolOptions) -> Result<Self, PoolError> {
        Self::builder(name).options(options).build()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), PoolError> {
        if self.is_disposed() {
            return Err(PoolError::Disposed(self.shared.name.clone()));
        }
        Ok(())
    }

    /// Queues `callback(state)`. Never blocks on running work.
    pub fn enqueue<S, F>(&self, callback: F, state: S) -> Result<(), PoolError>
    where
        S: Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        self.submit(Box::new(move || callback(state)))
    }

    #[inline]
    pub fn execute<F>(&self, work: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(work))
    }

    pub(crate) fn submit(&self, work: Work) -> Result<(), PoolError> {
        self.ensure_alive()?;
        let mut st = self.shared.state.lock();
        if self.is_disposed() {
            return Err(PoolError::Disposed(self.shared.name.clone()));
        }

        tracing::trace!(pool = %self.shared.name, queued = st.queue.len(), "enqueue");

        if let Some(id) = st.idle.pop() {
            if let Some(record) = st.workers.get_mut(&id) {
                record.assigned = Some(work);
                let _ = record.wake.try_send(());
                return Ok(());
            }
        }

        let work = if st.live() < st.max_threads {
            match self.shared.spawn_worker(&mut st, Some(work)) {
                Ok(_) => return Ok(()),
                Err((err, work)) => {
                    tracing::error!(pool = %self.shared.name, error = %err, "failed to start worker");
                    work
                }
            }
        } else {
            Some(work)
        };

        if let Some(work) = work {
            st.queue.push_back(work);
            if st.live() < st.max_threads {
                if let Err((err, _)) = self.shared.spawn_worker(&mut st, None) {
                    tracing::error!(pool = %self.shared.name, error = %err, "failed to start helper worker");
                }
            }
        }
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().live()
    }

    pub fn min_threads(&self) -> usize {
        self.shared.state.lock().min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    pub fn idle_timeout(&self) -> WaitTimeout {
        self.shared.state.lock().idle_timeout
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.state.lock().read_only
    }

    pub fn metrics(&self) -> PoolMetrics {
        let st = self.shared.state.lock();
        PoolMetrics {
            thread_count: st.live(),
            idle_workers: st.idle.len(),
            queued_tasks: st.queue.len(),
            min_threads: st.min_threads,
            max_threads: st.max_threads,
            peak_threads: st.peak_threads,
            completed_tasks: st.completed,
            failed_tasks: st.failed,
        }
    }

    /// Applies `options` unless the pool is read-only.
    pub fn configure(&self, options: &PoolOptions) -> Result<(), PoolError> {
        self.ensure_alive()?;
        if self.is_read_only() {
            tracing::debug!(pool = %self.shared.name, "read-only pool, configuration ignored");
            return Ok(());
        }
        self.set_max_threads(options.max_threads)?;
        self.set_min_threads(options.min_threads)?;
        if let Some(idle) = options.idle_timeout() {
            self.set_idle_timeout(idle)?;
        }
        Ok(())
    }

    /// Raises or lowers the minimum. Values outside the allowed range are
    /// ignored; raising it starts workers up to the new minimum.
    pub fn set_min_threads(&self, value: usize) -> Result<(), PoolError> {
        self.ensure_alive()?;
        let mut st = self.shared.state.lock();
        if st.read_only || !self.shared.bound_allowed(value) || value > st.max_threads {
            return Ok(());
        }
        while st.live() < value {
            if let Err((err, _)) = self.shared.spawn_worker(&mut st, None) {
                return Err(PoolError::Spawn {
                    pool: self.shared.name.clone(),
                    source: err,
                });
            }
        }
        st.min_threads = value;
        Ok(())
    }

    /// Lowering the maximum below the live count wakes idle workers so they
    /// retire; busy workers finish their work first.
    pub fn set_max_threads(&self, value: usize) -> Result<(), PoolError> {
        self.ensure_alive()?;
        let mut st = self.shared.state.lock();
        if st.read_only
            || value == 0
            || !self.shared.bound_allowed(value)
            || value < st.min_threads
        {
            return Ok(());
        }

        let surplus = st.live().saturating_sub(value);
        st.max_threads = value;
        for id in st.idle.iter().take(surplus) {
            if let Some(record) = st.workers.get(id) {
                let _ = record.wake.try_send(());
            }
        }
        Ok(())
    }

    /// A zero duration is ignored.
    pub fn set_idle_timeout(&self, timeout: WaitTimeout) -> Result<(), PoolError> {
        self.ensure_alive()?;
        let mut st = self.shared.state.lock();
        if st.read_only || timeout == WaitTimeout::After(Duration::ZERO) {
            return Ok(());
        }
        st.idle_timeout = timeout;
        Ok(())
    }

    /// Stops every worker and waits a bounded time for them to acknowledge.
    /// Queued work is dropped without running. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = thread::current().id();

        let (dropped, mut pending) = {
            let mut st = self.shared.state.lock();
            let mut dropped: Vec<Work> = st.queue.drain(..).collect();
            let mut pending = Vec::with_capacity(st.workers.len());
            for record in st.workers.values_mut() {
                record.force_shutdown = true;
                let _ = record.wake.try_send(());
                if let Some(work) = record.assigned.take() {
                    dropped.push(work);
                }
                if let Some(handle) = record.thread.take() {
                    // a worker disposing its own pool cannot wait for itself
                    if handle.thread().id() != current {
                        pending.push((record.shutdown_ack.clone(), handle));
                    }
                }
            }
            (dropped, pending)
        };

        tracing::info!(
            pool = %self.shared.name,
            workers = pending.len(),
            dropped = dropped.len(),
            "disposing thread pool"
        );
        drop(dropped);

        while !pending.is_empty() {
            let take = pending.len().min(SHUTDOWN_BATCH);
            let deadline = Instant::now() + SHUTDOWN_WAIT;
            for (ack, handle) in pending.drain(..take) {
                match ack.recv_deadline(deadline) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = handle.join();
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        tracing::warn!(
                            pool = %self.shared.name,
                            thread = handle.thread().name().unwrap_or("?"),
                            "worker did not acknowledge shutdown, detaching"
                        );
                    }
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("disposed", &self.is_disposed())
            .field("metrics", &self.metrics())
            .finish()
    }
}


/// Builder for [`WorkerPool`].
///
/// Explicit setters win over `configuration`, which wins over `options`.
/// With bound validation on, thread bounds below the logical processor
/// count are ignored.
#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    name: String,
    options: PoolOptions,
    configuration: Option<PoolConfiguration>,
    min_threads: Option<usize>,
    max_threads: Option<usize>,
    idle_timeout: Option<WaitTimeout>,
    read_only: Option<bool>,
    validate_bounds: bool,
}

impl WorkerPoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: PoolOptions::default(),
            configuration: None,
            min_threads: None,
            max_threads: None,
            idle_timeout: None,
            read_only: None,
            validate_bounds: true,
        }
    }

    pub fn options(mut self, options: &PoolOptions) -> Self {
        self.options = options.clone();
        self
    }

    pub fn configuration(mut self, configuration: &PoolConfiguration) -> Self {
        self.configuration = Some(configuration.clone());
        self
    }

    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = Some(n);
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n);
        self
    }

    pub fn idle_timeout(mut self, timeout: impl Into<WaitTimeout>) -> Self {
        self.idle_timeout = Some(timeout.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn validate_bounds(mut self, validate: bool) -> Self {
        self.validate_bounds = validate;
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidArgument("pool name must not be empty".into()));
        }

        let mut options = match &self.configuration {
            Some(cfg) => cfg.resolve(&self.name, &self.options),
            None => self.options.clone(),
        };
        if let Some(n) = self.min_threads {
            options.min_threads = n;
        }
        if let Some(n) = self.max_threads {
            options.max_threads = n;
        }
        if let Some(ro) = self.read_only {
            options.read_only = ro;
        }

        let defaults = PoolOptions::default();
        let allowed = |n: usize| !self.validate_bounds || n >= num_cpus::get();
        let min_threads = if allowed(options.min_threads) {
            options.min_threads
        } else {
            defaults.min_threads
        };
        let mut max_threads = if allowed(options.max_threads) && options.max_threads > 0 {
            options.max_threads
        } else {
            defaults.max_threads
        };
        if max_threads < min_threads {
            max_threads = min_threads;
        }
        if max_threads == 0 {
            return Err(PoolError::InvalidArgument("pool needs at least one thread".into()));
        }

        let idle_timeout = self
            .idle_timeout
            .filter(|t| *t != WaitTimeout::After(Duration::ZERO))
            .or_else(|| options.idle_timeout())
            .unwrap_or(WaitTimeout::After(Duration::from_millis(
                DEFAULT_IDLE_SHUTDOWN_MS as u64,
            )));

        let shared = Arc::new(Shared {
            name: self.name,
            validate_bounds: self.validate_bounds,
            disposed: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            state: Mutex::new(PoolState {
                min_threads,
                max_threads,
                idle_timeout,
                read_only: options.read_only,
                queue: VecDeque::new(),
                workers: HashMap::with_capacity(min_threads),
                idle: Vec::with_capacity(min_threads),
                peak_threads: 0,
                completed: 0,
                failed: 0,
            }),
        });
        let pool = WorkerPool { shared };

        {
            let mut st = pool.shared.state.lock();
            for _ in 0..min_threads {
                if let Err((err, _)) = pool.shared.spawn_worker(&mut st, None) {
                    drop(st);
                    return Err(PoolError::Spawn {
                        pool: pool.shared.name.clone(),
                        source: err,
                    });
                }
            }
        }

        tracing::info!(
            pool = %pool.shared.name,
            min_threads,
            max_threads,
            idle_timeout = %idle_timeout,
            read_only = options.read_only,
            "thread pool created"
        );

        Ok(pool)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(name: &str, min: usize, max: usize) -> WorkerPool {
        WorkerPool::builder(name)
            .min_threads(min)
            .max_threads(max)
            .validate_bounds(false)
            .build()
            .unwrap()
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn starts_min_threads() {
        let pool = small_pool("start", 2, 4);
        assert_eq!(pool.thread_count(), 2);
        assert_eq!(pool.min_threads(), 2);
        assert_eq!(pool.max_threads(), 4);
        assert_eq!(pool.name(), "start");
    }

    #[test]
    fn rejects_empty_name() {
        let err = WorkerPool::new("  ").unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));
    }

    #[test]
    fn validated_bounds_ignore_small_values() {
        let cpus = num_cpus::get();
        let pool = WorkerPool::builder("validated")
            .min_threads(0)
            .max_threads(cpus + 2)
            .build()
            .unwrap();
        assert_eq!(pool.min_threads(), cpus);
        assert_eq!(pool.max_threads(), cpus + 2);
    }

    #[test]
    fn max_raised_to_min() {
        let pool = small_pool("raise", 3, 1);
        assert_eq!(pool.max_threads(), 3);
    }

    #[test]
    fn enqueue_passes_state() {
        let pool = small_pool("state", 1, 2);
        let (tx, rx) = channel::bounded(1);
        pool.enqueue(move |n: u32| tx.send(n * 2).unwrap(), 21).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn panicking_work_keeps_worker_alive() {
        let pool = small_pool("panics", 1, 1);
        pool.execute(|| panic!("boom")).unwrap();

        let (tx, rx) = channel::bounded(1);
        pool.execute(move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(pool.thread_count(), 1);
        assert!(wait_until(Duration::from_secs(2), || pool.metrics().failed_tasks == 1));
    }

    #[test]
    fn queue_drains_in_fifo_order_on_single_worker() {
        let pool = small_pool("fifo", 1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            pool.execute(move || order.lock().push(i)).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || order.lock().len() == 20));
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn idle_workers_retire_to_min() {
        let pool = WorkerPool::builder("retire")
            .min_threads(1)
            .max_threads(4)
            .idle_timeout(Duration::from_millis(100))
            .validate_bounds(false)
            .build()
            .unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 4));
        assert!(pool.metrics().peak_threads <= 4);
        assert!(wait_until(Duration::from_secs(5), || pool.thread_count() == 1));
    }

    #[test]
    fn infinite_idle_timeout_keeps_threads() {
        let pool = WorkerPool::builder("forever")
            .min_threads(1)
            .max_threads(3)
            .idle_timeout(WaitTimeout::Infinite)
            .validate_bounds(false)
            .build()
            .unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(4));
        for _ in 0..3 {
            let barrier = barrier.clone();
            pool.execute(move || {
                barrier.wait();
            })
            .unwrap();
        }
        barrier.wait();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.thread_count(), 3);
    }

    #[test]
    fn read_only_ignores_configuration() {
        let pool = WorkerPool::builder("ro")
            .min_threads(1)
            .max_threads(2)
            .read_only(true)
            .validate_bounds(false)
            .build()
            .unwrap();
        let options = PoolOptions {
            min_threads: 2,
            max_threads: 8,
            idle_shutdown_ms: -1,
            read_only: false,
        };
        pool.configure(&options).unwrap();
        assert!(pool.is_read_only());
        assert_eq!(pool.max_threads(), 2);
        assert_eq!(pool.min_threads(), 1);
        assert_ne!(pool.idle_timeout(), WaitTimeout::Infinite);
    }

    #[test]
    fn configure_applies_bounds() {
        let pool = small_pool("cfg", 1, 2);
        let options = PoolOptions {
            min_threads: 3,
            max_threads: 6,
            idle_shutdown_ms: -1,
            read_only: false,
        };
        pool.configure(&options).unwrap();
        assert_eq!(pool.max_threads(), 6);
        assert_eq!(pool.min_threads(), 3);
        assert_eq!(pool.thread_count(), 3);
        assert_eq!(pool.idle_timeout(), WaitTimeout::Infinite);
    }

    #[test]
    fn lowering_max_retires_idle_workers() {
        let pool = small_pool("shrink", 1, 6);
        pool.set_min_threads(5).unwrap();
        assert_eq!(pool.thread_count(), 5);
        pool.set_min_threads(1).unwrap();

        pool.set_max_threads(2).unwrap();
        assert_eq!(pool.max_threads(), 2);
        assert!(wait_until(Duration::from_secs(5), || pool.thread_count() == 2));
    }

    #[test]
    fn disposed_pool_rejects_work() {
        let pool = small_pool("disposed", 2, 2);
        pool.dispose();
        assert!(pool.is_disposed());
        let err = pool.execute(|| {}).unwrap_err();
        assert!(err.is_disposed());
        assert!(pool.set_max_threads(4).unwrap_err().is_disposed());
        assert_eq!(pool.thread_count(), 0);
        pool.dispose();
    }

    #[test]
    fn dispose_drops_queued_work() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let pool = small_pool("drop-queued", 1, 1);
        let (started_tx, started_rx) = channel::bounded(1);
        pool.execute(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
        })
        .unwrap();
        started_rx.recv().unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        pool.execute(move || {
            let _flag = flag;
            ran2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.dispose();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
    }
}

use super::errors::TaskError;
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    fmt,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};


/// Opaque caller state carried alongside a submission.
pub type AsyncState = Box<dyn Any + Send + Sync>;


/// Manual-reset event: once set, every current and future waiter passes.
pub struct WaitHandle {
    signaled: Mutex<bool>,
    cond: Condvar,
    waker: AtomicWaker,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            waker: AtomicWaker::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
        drop(signaled);
        self.waker.wake();
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Returns `true` if the handle was set before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond
                .wait_while_for(&mut signaled, |signaled| !*signaled, timeout);
        }
        *signaled
    }

    fn register(&self, waker: &std::task::Waker) {
        self.waker.register(waker);
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle").field("set", &self.is_set()).finish()
    }
}


/// Outcome of one dispatcher submission.
///
/// Populated exactly once by the worker that ran the task; the wait handle is
/// set only after the outcome is stored. The outcome stays readable until the
/// completion callback has returned and the submission is settled.
pub struct TaskResult<A, R> {
    args: A,
    state: Option<AsyncState>,
    completed: AtomicBool,
    outcome: Mutex<Option<Result<R, TaskError>>>,
    wait_handle: WaitHandle,
    settled: WaitHandle,
}

impl<A, R> TaskResult<A, R> {
    pub(crate) fn new(args: A, state: Option<AsyncState>) -> Self {
        Self {
            args,
            state,
            completed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            wait_handle: WaitHandle::new(),
            settled: WaitHandle::new(),
        }
    }

    /// Stores the outcome and releases waiters. Later calls are ignored.
    pub(crate) fn complete(&self, outcome: Result<R, TaskError>) -> bool {
        let mut slot = self.outcome.lock();
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(outcome);
        self.completed.store(true, Ordering::Release);
        drop(slot);
        self.wait_handle.set();
        true
    }

    /// Marks the submission done with the result, completion callback included.
    pub(crate) fn settle(&self) {
        self.settled.set();
    }

    /// Moves the outcome out once nothing else can read it.
    fn take_outcome(&self) -> Result<R, TaskError> {
        self.settled.wait();
        self.outcome.lock().take().unwrap_or(Err(TaskError::Abandoned))
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn args(&self) -> &A {
        &self.args
    }

    pub fn state(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.state.as_deref()
    }

    pub fn state_as<T: Any>(&self) -> Option<&T> {
        self.state.as_ref().and_then(|s| s.downcast_ref::<T>())
    }

    pub fn wait_handle(&self) -> &WaitHandle {
        &self.wait_handle
    }

    /// The captured fault, if the task failed.
    pub fn error(&self) -> Option<TaskError> {
        match self.outcome.lock().as_ref() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.outcome.lock().as_ref(), Some(Err(_)))
    }

    /// Applies `f` to the return value while it is still held.
    pub fn map_value<T>(&self, f: impl FnOnce(&R) -> T) -> Option<T> {
        match self.outcome.lock().as_ref() {
            Some(Ok(value)) => Some(f(value)),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<R>
    where
        R: Clone,
    {
        self.map_value(R::clone)
    }
}

impl<A: fmt::Debug, R> fmt::Debug for TaskResult<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("args", &self.args)
            .field("completed", &self.is_completed())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}


/// Caller-side handle to a submitted task.
///
/// Blocking callers use [`end_invoke`](Self::end_invoke); async callers can
/// `.await` the handle directly.
pub struct TaskHandle<A, R> {
    result: Arc<TaskResult<A, R>>,
}

impl<A, R> TaskHandle<A, R> {
    pub(crate) fn new(result: Arc<TaskResult<A, R>>) -> Self {
        Self { result }
    }

    #[inline]
    pub fn result(&self) -> &TaskResult<A, R> {
        &self.result
    }

    /// Blocks until the task completes and returns its value or fault.
    ///
    /// Returns only after any completion callback has finished with the result.
    pub fn end_invoke(self) -> Result<R, TaskError> {
        if !self.result.is_completed() {
            self.result.wait_handle.wait();
        }
        self.result.take_outcome()
    }

    /// Returns `true` if the task completed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.result.is_completed() || self.result.wait_handle.wait_timeout(timeout)
    }

    /// Awaits the outcome for at most `timeout`; `None` leaves the handle usable.
    pub async fn await_timeout(&mut self, timeout: Duration) -> Option<Result<R, TaskError>> {
        tokio::time::timeout(timeout, Pin::new(self)).await.ok()
    }
}

impl<A, R> Deref for TaskHandle<A, R> {
    type Target = TaskResult<A, R>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl<A, R> Future for TaskHandle<A, R> {
    type Output = Result<R, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.result.settled.is_set() {
            this.result.settled.register(cx.waker());
            if !this.result.settled.is_set() {
                return Poll::Pending;
            }
        }
        Poll::Ready(this.result.take_outcome())
    }
}

impl<A: fmt::Debug, R> fmt::Debug for TaskHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.result).finish()
    }
}

//! Reentrant lock that refuses acquisitions closing a two-thread wait cycle.
//!
//! Every live lock is recorded in a process-wide registry together with its
//! owner and the threads waiting on it. Before a thread blocks on a lock held
//! by someone else, the registry is checked for the reverse edge: a lock the
//! requester holds that the owner is already waiting for. Longer cycles are
//! not detected.

use super::{
    errors::{DeadlockError, LockError},
    model::WaitTimeout,
};
use parking_lot::{Condvar, Mutex};
use std::{
    backtrace::Backtrace,
    collections::{BTreeMap, HashMap},
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::Instant,
};


static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_LOCK: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    locks: BTreeMap::new(),
});

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique token of the calling thread. Zero is never handed out.
#[inline]
fn current_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}


/// Where and when a thread started waiting for (or took) a lock.
#[derive(Debug)]
pub struct WaitContext {
    pub thread: ThreadId,
    pub thread_name: String,
    pub since: Instant,
    /// Captured according to `RUST_BACKTRACE`; disabled otherwise.
    pub backtrace: Backtrace,
}

impl WaitContext {
    fn capture() -> Self {
        let current = thread::current();
        let thread_name = current
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self {
            thread: current.id(),
            thread_name,
            since: Instant::now(),
            backtrace: Backtrace::capture(),
        }
    }
}


struct LockBook {
    name: String,
    owner: u64,
    owner_context: Option<Arc<WaitContext>>,
    waiters: HashMap<u64, Arc<WaitContext>>,
}

struct Registry {
    locks: BTreeMap<u64, LockBook>,
}

impl Registry {
    /// A lock other than `requested`, owned by `me`, that `owner` waits on.
    fn find_cycle(&self, requested: u64, me: u64, owner: u64) -> Option<(&LockBook, Arc<WaitContext>)> {
        self.locks
            .iter()
            .filter(|(id, book)| **id != requested && book.owner == me)
            .find_map(|(_, book)| book.waiters.get(&owner).map(|ctx| (book, ctx.clone())))
    }
}


enum GateWait {
    Acquired,
    TimedOut,
    Disposed,
}

/// Binary semaphore that also wakes its waiters on disposal.
struct Gate {
    taken: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            taken: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, timeout: WaitTimeout, disposed: &AtomicBool) -> GateWait {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut taken = self.taken.lock();
        loop {
            if disposed.load(Ordering::Acquire) {
                return GateWait::Disposed;
            }
            if !*taken {
                *taken = true;
                return GateWait::Acquired;
            }
            match deadline {
                None => self.cond.wait(&mut taken),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return GateWait::TimedOut;
                    }
                    self.cond.wait_until(&mut taken, deadline);
                }
            }
        }
    }

    fn release(&self) {
        *self.taken.lock() = false;
        self.cond.notify_one();
    }

    fn wake_all(&self) {
        let _taken = self.taken.lock();
        self.cond.notify_all();
    }
}


/// Reentrant mutual-exclusion lock with two-thread deadlock detection.
///
/// Share it through an `Arc`. Ownership is per thread: only the owning
/// thread may release it, once per successful acquisition.
pub struct DeadlockSafeLock {
    id: u64,
    lock_id: String,
    name: String,
    owner: AtomicU64,
    hold: AtomicUsize,
    disposed: AtomicBool,
    gate: Gate,
}

impl DeadlockSafeLock {
    pub fn new(name: impl Into<String>) -> Result<Self, LockError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LockError::InvalidArgument("lock name must not be empty".into()));
        }

        let id = NEXT_LOCK.fetch_add(1, Ordering::Relaxed);
        REGISTRY.lock().locks.insert(
            id,
            LockBook {
                name: name.clone(),
                owner: 0,
                owner_context: None,
                waiters: HashMap::new(),
            },
        );

        let lock = Self {
            id,
            lock_id: uuid::Uuid::new_v4().to_string(),
            name,
            owner: AtomicU64::new(0),
            hold: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            gate: Gate::new(),
        };
        tracing::debug!(lock = %lock.name, lock_id = %lock.lock_id, "lock created");
        Ok(lock)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_token()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Reentrancy depth held by the calling thread.
    pub fn hold_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.hold.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Threads currently blocked on this lock.
    pub fn waiting_threads(&self) -> usize {
        REGISTRY
            .lock()
            .locks
            .get(&self.id)
            .map_or(0, |book| book.waiters.len())
    }

    /// Where the current owner took the lock.
    pub fn owner_context(&self) -> Option<Arc<WaitContext>> {
        REGISTRY
            .lock()
            .locks
            .get(&self.id)
            .and_then(|book| book.owner_context.clone())
    }

    fn ensure_alive(&self) -> Result<(), LockError> {
        if self.is_disposed() {
            return Err(LockError::Disposed(self.name.clone()));
        }
        Ok(())
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> Result<(), LockError> {
        self.try_lock(WaitTimeout::Infinite).map(|_| ())
    }

    /// Millisecond variant of [`try_lock`](Self::try_lock): `-1` waits
    /// forever, other negative values are rejected.
    pub fn try_lock_millis(&self, ms: i64) -> Result<bool, LockError> {
        let timeout = WaitTimeout::from_millis(ms)
            .ok_or_else(|| LockError::InvalidArgument(format!("invalid timeout: {ms}ms")))?;
        self.try_lock(timeout)
    }

    /// Returns `Ok(false)` if the lock could not be taken within `timeout`.
    ///
    /// Fails with [`LockError::Deadlock`] instead of blocking when the owner
    /// is itself waiting for a lock held by the calling thread.
    pub fn try_lock(&self, timeout: impl Into<WaitTimeout>) -> Result<bool, LockError> {
        let timeout = timeout.into();
        self.ensure_alive()?;

        let me = current_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.hold.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        let context = Arc::new(WaitContext::capture());
        {
            let mut reg = REGISTRY.lock();
            let owner = self.owner.load(Ordering::Acquire);
            if owner != 0 {
                if let Some((held, wait_context)) = reg.find_cycle(self.id, me, owner) {
                    let err = DeadlockError {
                        requested: self.name.clone(),
                        held: held.name.clone(),
                        owner: wait_context.thread_name.clone(),
                        wait_context,
                    };
                    tracing::warn!(
                        requested = %err.requested,
                        held = %err.held,
                        owner = %err.owner,
                        "deadlock avoided"
                    );
                    return Err(err.into());
                }
            }

            match reg.locks.get_mut(&self.id) {
                Some(book) => {
                    book.waiters.insert(me, context.clone());
                }
                None => return Err(LockError::Disposed(self.name.clone())),
            }
        }

        let outcome = self.gate.acquire(timeout, &self.disposed);

        let mut reg = REGISTRY.lock();
        let book = reg.locks.get_mut(&self.id);
        match outcome {
            GateWait::Acquired => {
                self.hold.store(1, Ordering::Relaxed);
                self.owner.store(me, Ordering::Release);
                if let Some(book) = book {
                    book.waiters.remove(&me);
                    book.owner = me;
                    book.owner_context = Some(context);
                }
                Ok(true)
            }
            GateWait::TimedOut => {
                if let Some(book) = book {
                    book.waiters.remove(&me);
                }
                Ok(false)
            }
            GateWait::Disposed => {
                if let Some(book) = book {
                    book.waiters.remove(&me);
                }
                Err(LockError::Disposed(self.name.clone()))
            }
        }
    }

    /// Releases one level of ownership.
    pub fn unlock(&self) -> Result<(), LockError> {
        if !self.is_held_by_current_thread() {
            return Err(LockError::NotOwner(self.name.clone()));
        }

        let hold = self.hold.load(Ordering::Relaxed);
        if hold > 1 {
            self.hold.store(hold - 1, Ordering::Relaxed);
            return Ok(());
        }

        {
            let mut reg = REGISTRY.lock();
            if let Some(book) = reg.locks.get_mut(&self.id) {
                book.owner = 0;
                book.owner_context = None;
            }
            self.hold.store(0, Ordering::Relaxed);
            self.owner.store(0, Ordering::Release);
        }
        self.gate.release();
        Ok(())
    }

    /// Acquires the lock and releases it when the guard drops.
    pub fn guard(&self) -> Result<DeadlockSafeGuard<'_>, LockError> {
        self.lock()?;
        Ok(DeadlockSafeGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Removes the lock from the registry and fails every pending and future
    /// acquisition with [`LockError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        REGISTRY.lock().locks.remove(&self.id);
        self.gate.wake_all();
        tracing::debug!(lock = %self.name, "lock disposed");
    }
}

/// Number of locks currently registered in the process.
pub fn live_lock_count() -> usize {
    REGISTRY.lock().locks.len()
}

impl PartialEq for DeadlockSafeLock {
    fn eq(&self, other: &Self) -> bool {
        self.lock_id == other.lock_id && self.name == other.name
    }
}

impl Eq for DeadlockSafeLock {}

impl Drop for DeadlockSafeLock {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DeadlockSafeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockSafeLock")
            .field("name", &self.name)
            .field("lock_id", &self.lock_id)
            .field("locked", &self.is_locked())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}


/// Scoped ownership of a [`DeadlockSafeLock`]. Bound to the acquiring thread.
pub struct DeadlockSafeGuard<'a> {
    lock: &'a DeadlockSafeLock,
    _not_send: PhantomData<*const ()>,
}

impl DeadlockSafeGuard<'_> {
    pub fn lock(&self) -> &DeadlockSafeLock {
        self.lock
    }
}

impl Drop for DeadlockSafeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            tracing::error!(lock = %self.lock.name, error = %err, "guard release failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, time::Duration};

    fn wait_for_waiters(lock: &DeadlockSafeLock, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while lock.waiting_threads() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(lock.waiting_threads(), n);
    }

    fn acquire_elsewhere(lock: &Arc<DeadlockSafeLock>) -> bool {
        let other = lock.clone();
        thread::spawn(move || other.try_lock(Duration::ZERO).unwrap())
            .join()
            .unwrap()
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            DeadlockSafeLock::new(""),
            Err(LockError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reentrant_acquisition_needs_matching_releases() {
        let lock = Arc::new(DeadlockSafeLock::new("reentrant").unwrap());
        for _ in 0..3 {
            lock.lock().unwrap();
        }
        assert_eq!(lock.hold_count(), 3);

        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(!acquire_elsewhere(&lock));

        lock.unlock().unwrap();
        assert!(!lock.is_locked());
        assert!(acquire_elsewhere(&lock));
    }

    #[test]
    fn try_lock_times_out_while_held() {
        let lock = Arc::new(DeadlockSafeLock::new("timeout").unwrap());
        lock.lock().unwrap();

        let other = lock.clone();
        let started = Instant::now();
        let acquired = thread::spawn(move || other.try_lock(Duration::from_millis(50)).unwrap())
            .join()
            .unwrap();
        assert!(!acquired);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(lock.waiting_threads(), 0);
        lock.unlock().unwrap();
    }

    #[test]
    fn try_lock_millis_validates_input() {
        let lock = DeadlockSafeLock::new("millis").unwrap();
        assert!(matches!(lock.try_lock_millis(-2), Err(LockError::InvalidArgument(_))));
        assert!(lock.try_lock_millis(0).unwrap());
        assert!(lock.try_lock_millis(-1).unwrap());
        assert_eq!(lock.hold_count(), 2);
    }

    #[test]
    fn unlock_by_non_owner_fails() {
        let lock = Arc::new(DeadlockSafeLock::new("owner").unwrap());
        assert!(matches!(lock.unlock(), Err(LockError::NotOwner(_))));

        lock.lock().unwrap();
        let other = lock.clone();
        let err = thread::spawn(move || other.unlock()).join().unwrap();
        assert!(matches!(err, Err(LockError::NotOwner(_))));
        lock.unlock().unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = DeadlockSafeLock::new("guarded").unwrap();
        {
            let guard = lock.guard().unwrap();
            assert!(guard.lock().is_held_by_current_thread());
            assert!(lock.owner_context().is_some());
        }
        assert!(!lock.is_locked());
        assert!(lock.owner_context().is_none());
    }

    #[test]
    fn dispose_wakes_waiters() {
        let lock = Arc::new(DeadlockSafeLock::new("disposed").unwrap());
        lock.lock().unwrap();

        let other = lock.clone();
        let waiter = thread::spawn(move || other.lock());
        wait_for_waiters(&lock, 1);

        lock.dispose();
        assert!(matches!(waiter.join().unwrap(), Err(LockError::Disposed(_))));
        assert!(matches!(lock.lock(), Err(LockError::Disposed(_))));
    }

    #[test]
    fn crossed_acquisition_is_refused() {
        let first = Arc::new(DeadlockSafeLock::new("first").unwrap());
        let second = Arc::new(DeadlockSafeLock::new("second").unwrap());
        let both_held = Arc::new(Barrier::new(2));

        let (f, s, b) = (first.clone(), second.clone(), both_held.clone());
        let other = thread::Builder::new()
            .name("crossing".into())
            .spawn(move || {
                s.lock().unwrap();
                b.wait();
                let got = f.lock();
                if got.is_ok() {
                    f.unlock().unwrap();
                }
                s.unlock().unwrap();
                got
            })
            .unwrap();

        first.lock().unwrap();
        both_held.wait();
        wait_for_waiters(&first, 1);

        let err = second.lock().unwrap_err();
        let deadlock = err.as_deadlock().unwrap();
        assert_eq!(deadlock.requested, "second");
        assert_eq!(deadlock.held, "first");
        assert_eq!(deadlock.owner, "crossing");
        assert_eq!(deadlock.wait_context.thread_name, "crossing");

        first.unlock().unwrap();
        assert!(other.join().unwrap().is_ok());
    }

    #[test]
    fn locks_compare_by_identity() {
        let a = DeadlockSafeLock::new("same").unwrap();
        let b = DeadlockSafeLock::new("same").unwrap();
        assert_eq!(a, a);
        assert_ne!(a, b);
        assert_ne!(a.lock_id(), b.lock_id());
        assert!(live_lock_count() >= 2);
    }
}

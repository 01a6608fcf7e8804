//! Elastic OS-thread pool, deadlock-detecting reentrant lock and an ordered
//! task dispatcher built on the pool.
//!
//! # Features
//! - Worker pool that grows to a maximum and retires idle threads to a minimum
//! - Reentrant lock that fails fast instead of closing a two-thread wait cycle
//! - Dispatcher with unordered, per-target, per-callback-target and sequential ordering
//! - Blocking and awaitable task handles
//! - Pool configuration from JSON or environment variables

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod handle;
pub mod lock;
pub mod logging;
pub mod model;
pub mod pool;

pub use config::{PoolConfiguration, PoolOptions, PoolSection};
pub use dispatcher::{Completion, OrderedTaskDispatcher, Task};
pub use errors::{ConfigError, DeadlockError, DispatchError, LockError, PoolError, TaskError};
pub use handle::{AsyncState, TaskHandle, TaskResult, WaitHandle};
pub use lock::{live_lock_count, DeadlockSafeGuard, DeadlockSafeLock, WaitContext};
pub use model::{OrderingKey, OrderingMode, PoolMetrics, WaitTimeout};
pub use pool::{WorkerPool, WorkerPoolBuilder};

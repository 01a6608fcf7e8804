use ordered_pool::{
    logging, Completion, DeadlockSafeLock, OrderedTaskDispatcher, OrderingMode, PoolOptions, Task,
    WorkerPool,
};
use std::{
    error::Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};


fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    logging::init("ordered_pool=info");

    let options = PoolOptions::from_env("ORDERED_POOL")?;
    let pool = Arc::new(WorkerPool::with_options("demo", &options)?);
    tracing::info!(threads = pool.thread_count(), "pool ready");

    let now = Instant::now();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10_000 {
        let counter = counter.clone();
        pool.execute(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    while counter.load(Ordering::Relaxed) < 10_000 {
        thread::sleep(Duration::from_millis(1));
    }
    tracing::info!(elapsed = ?now.elapsed(), metrics = ?pool.metrics(), "raw pool done");

    let dispatcher = OrderedTaskDispatcher::with_pool(OrderingMode::ByTaskTargetKey, pool.clone());
    let account = Arc::new(DeadlockSafeLock::new("account")?);
    let handles = (0..100)
        .map(|i| {
            dispatcher.execute(
                Task::bound(&account, |lock: &DeadlockSafeLock, n: &u64| -> u64 {
                    match lock.guard() {
                        Ok(_guard) => n * 2,
                        Err(err) => {
                            tracing::error!(error = %err, "lock failed");
                            0
                        }
                    }
                }),
                Some(Completion::new(|result| {
                    if let Some(err) = result.error() {
                        tracing::warn!(error = %err, "task failed");
                    }
                })),
                None,
                i,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut total = 0;
    for handle in handles {
        total += dispatcher.end_invoke(handle)?;
    }
    tracing::info!(total, elapsed = ?now.elapsed(), "ordered dispatch done");

    pool.dispose();
    Ok(())
}

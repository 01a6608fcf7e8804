use std::{
    fmt,
    sync::Arc,
    time::Duration,
};


/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTimeout {
    Infinite,
    After(Duration),
}

impl WaitTimeout {
    /// Millisecond form used by configuration: `-1` is infinite, other
    /// negative values are rejected.
    pub fn from_millis(ms: i64) -> Option<Self> {
        match ms {
            -1 => Some(WaitTimeout::Infinite),
            ms if ms >= 0 => Some(WaitTimeout::After(Duration::from_millis(ms as u64))),
            _ => None,
        }
    }

    #[inline]
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::Infinite => None,
            WaitTimeout::After(d) => Some(*d),
        }
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        matches!(self, WaitTimeout::Infinite)
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::After(d)
    }
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTimeout::Infinite => f.write_str("infinite"),
            WaitTimeout::After(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}


/// Interleaving policy of an `OrderedTaskDispatcher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrderingMode {
    /// Everything runs as soon as a worker is free.
    Unordered,
    /// FIFO per task target, targets run concurrently.
    #[default]
    ByTaskTargetKey,
    /// FIFO per completion target; a completion is mandatory.
    ByReturnTargetKey,
    /// One global FIFO, one task at a time.
    Sequential,
}


/// Identity of the object a task or completion is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderingKey(u64);

impl OrderingKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Key derived from the address of the shared target.
    pub fn of<T: ?Sized>(target: &Arc<T>) -> Self {
        Self(Arc::as_ptr(target) as *const () as usize as u64)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}


#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub thread_count: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    pub peak_threads: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

impl PoolMetrics {
    pub fn busy_workers(&self) -> usize {
        self.thread_count.saturating_sub(self.idle_workers)
    }

    pub fn utilization(&self) -> f64 {
        if self.thread_count == 0 {
            return 0.0;
        }
        self.busy_workers() as f64 / self.thread_count as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_from_millis() {
        assert_eq!(WaitTimeout::from_millis(-1), Some(WaitTimeout::Infinite));
        assert_eq!(
            WaitTimeout::from_millis(250),
            Some(WaitTimeout::After(Duration::from_millis(250)))
        );
        assert_eq!(WaitTimeout::from_millis(-2), None);
        assert!(WaitTimeout::Infinite.as_duration().is_none());
    }

    #[test]
    fn ordering_key_follows_identity() {
        let a = Arc::new(1u8);
        let b = Arc::new(1u8);
        assert_eq!(OrderingKey::of(&a), OrderingKey::of(&a.clone()));
        assert_ne!(OrderingKey::of(&a), OrderingKey::of(&b));
    }

    #[test]
    fn metrics_ratios() {
        let m = PoolMetrics {
            thread_count: 4,
            idle_workers: 1,
            queued_tasks: 0,
            min_threads: 2,
            max_threads: 8,
            peak_threads: 4,
            completed_tasks: 3,
            failed_tasks: 1,
        };
        assert_eq!(m.busy_workers(), 3);
        assert!((m.utilization() - 0.75).abs() < f64::EPSILON);
        assert!((m.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}

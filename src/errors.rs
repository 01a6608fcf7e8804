use super::lock::WaitContext;
use std::{
    io,
    sync::Arc,
};
use thiserror::Error;


#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("thread pool `{0}` has been disposed")]
    Disposed(String),

    #[error("failed to spawn worker thread for pool `{pool}`: {source}")]
    Spawn {
        pool: String,
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    #[inline]
    pub fn is_disposed(&self) -> bool {
        matches!(self, PoolError::Disposed(_))
    }
}


/// Raised when acquiring a lock would close a wait cycle between two threads.
#[derive(Debug, Clone, Error)]
#[error(
    "deadlock detected: acquiring `{requested}` would wait on thread {owner}, \
     which is already waiting for `{held}` held by the current thread"
)]
pub struct DeadlockError {
    /// The lock the current thread tried to take.
    pub requested: String,
    /// The lock the current thread already owns.
    pub held: String,
    /// Display name of the thread owning `requested`.
    pub owner: String,
    /// Where `owner` started waiting for `held`.
    pub wait_context: Arc<WaitContext>,
}


#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock `{0}` has been disposed")]
    Disposed(String),

    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    #[error("current thread does not own lock `{0}`")]
    NotOwner(String),
}

impl LockError {
    #[inline]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::Deadlock(_))
    }

    pub fn as_deadlock(&self) -> Option<&DeadlockError> {
        match self {
            LockError::Deadlock(err) => Some(err),
            _ => None,
        }
    }
}


#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task must be bound to a target in ByTaskTargetKey mode")]
    MissingTarget,

    #[error("a completion bound to a target is required in ByReturnTargetKey mode")]
    MissingCompletion,

    #[error(transparent)]
    Pool(#[from] PoolError),
}


/// Fault captured from user work; never raised on the worker itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was dropped before it could run")]
    Abandoned,
}


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse {key}='{value}': {error}")]
    Parse {
        key: String,
        value: String,
        error: String,
    },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}


/// Renders a `catch_unwind` payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_from_str_and_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn dispatch_error_wraps_pool_error() {
        let err: DispatchError = PoolError::Disposed("p".into()).into();
        assert!(matches!(err, DispatchError::Pool(ref e) if e.is_disposed()));
        assert!(err.to_string().contains("`p`"));
    }
}

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};


fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into())
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, else `default_filter`.
///
/// Panics if a global subscriber is already set; see [`try_init`].
pub fn init(default_filter: &str) {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a subscriber
/// is already installed.
pub fn try_init(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

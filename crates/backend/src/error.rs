/// Failures from a [`crate::Backend`] implementation. Transient storage
/// errors (spec §7 category 3) are represented uniformly here; callers
/// (worker/scheduler) are responsible for retrying with backoff — the
/// backend itself never silently swallows an error.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("backend connection unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

// Result waiter (spec §4.7): a producer-facing handle to await a
// task's outcome. Polls `Backend::get_result` with the teacher's
// short-poll-then-sleep idiom; `InMemoryBackend` additionally exposes a
// `Notify` fast path behind the same trait method, so this handle
// doesn't need to know which backend it's talking to.
//
// Bound to the same `Handler` the producer encoded the task's data
// with, so `get` can run `decode_result` on a success payload instead
// of handing back raw bytes — `timed_out`/`task_failed`/`discarded`
// are distinct error cases from spec §4.7, not folded into one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskkit_backend::{Backend, BackendError};
use taskkit_common::{CodecError, ErrorDescriptor, Handler, ResultKind, Task, TaskId};
use thiserror::Error;

/// Failure modes of [`ResultHandle::get`], kept distinct per spec §4.7:
/// a timeout is not a task failure, and a task failure is not a
/// discard.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out waiting for task result")]
    TimedOut,
    #[error("task failed: {0:?}")]
    TaskFailed(ErrorDescriptor),
    #[error("task was discarded")]
    Discarded,
    #[error("failed to decode task result: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure modes of [`crate::Kit::initiate_task`]: encoding the value
/// via `Handler::encode_data` can fail just like any other codec call,
/// distinct from a backend error enqueuing the resulting task.
#[derive(Debug, Error)]
pub enum InitiateError {
    #[error("failed to encode task data: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Returned by [`crate::Kit::initiate_task`]. Cheap to clone; many
/// callers can await the same task's result independently.
pub struct ResultHandle<H: Handler> {
    backend: Arc<dyn Backend>,
    handler: Arc<H>,
    group: String,
    name: String,
    task_id: TaskId,
}

impl<H: Handler> Clone for ResultHandle<H> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            handler: Arc::clone(&self.handler),
            group: self.group.clone(),
            name: self.name.clone(),
            task_id: self.task_id,
        }
    }
}

impl<H: Handler> ResultHandle<H> {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, handler: Arc<H>, group: String, name: String, task_id: TaskId) -> Self {
        Self { backend, handler, group, name, task_id }
    }

    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Waits up to `timeout` for a result. `TimedOut` means the task
    /// may simply still be running; `TaskFailed`/`Discarded` mean the
    /// backend recorded a terminal outcome other than success.
    pub async fn get(&self, timeout: Duration) -> Result<H::Value, WaitError> {
        let block_until = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();
        let Some(result) = self.backend.get_result(self.task_id, block_until).await? else {
            return Err(WaitError::TimedOut);
        };

        match result.kind {
            ResultKind::Success => {
                // Stub task: decode_result only needs id/group/name to
                // pick a decoding strategy, not the full row.
                let stub = Task {
                    id: self.task_id,
                    group: self.group.clone(),
                    name: self.name.clone(),
                    data: Vec::new(),
                    due_at: result.created_at,
                    retry_count: 0,
                    assignee: None,
                    lease_expires_at: None,
                };
                Ok(self.handler.decode_result(&stub, &result.payload)?)
            }
            ResultKind::Error => {
                let descriptor = ErrorDescriptor::from_json(&result.payload)
                    .unwrap_or_else(|| ErrorDescriptor::new("Unknown", "failed to decode stored error descriptor"));
                Err(WaitError::TaskFailed(descriptor))
            }
            ResultKind::Discarded => Err(WaitError::Discarded),
        }
    }
}

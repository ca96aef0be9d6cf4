use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CodecError, ErrorDescriptor};
use crate::task::Task;

/// What to do after a handler raises an error. Fixes the Open Question
/// in spec §9: the source treats a handler-returned number as seconds,
/// which this crate makes explicit in the type rather than a runtime
/// convention.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Reschedule after `after`, incrementing `retry_count`.
    Retry { after: Duration },
    /// No more retries; write a permanent-failure result.
    FailPermanently,
    /// Drop the task with no result at all.
    Discard,
}

/// Signal a handler can raise instead of returning a value, requesting
/// the task be deleted with no result row (spec §4.3).
#[derive(Debug, Clone)]
pub struct Discard;

impl std::fmt::Display for Discard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task discarded by handler")
    }
}

impl std::error::Error for Discard {}

/// User-supplied domain logic. One instance is shared across every
/// worker in a process; `handle` must be safe to call concurrently for
/// different tasks (spec §5 — the core never invokes the same handler
/// instance on overlapping tasks within one worker, but different
/// workers may do so in parallel).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Domain-specific value type a handler exchanges with callers.
    /// Kept generic over `Handler` rather than fixed to raw bytes so
    /// embedders get a typed `initiate_task`/`ResultHandle::get` API;
    /// the core itself only ever sees the encoded bytes.
    type Value: Send + Sync;

    /// Runs the task. Returning `Err` drives the retry/fail path via
    /// `get_retry_interval`; the task may instead raise `Discard`
    /// (downcast from the boxed error) to skip straight to discard.
    async fn handle(&self, task: &Task) -> Result<Self::Value, Box<dyn std::error::Error + Send + Sync>>;

    /// Called after `handle` returns `Err` to decide next steps. May
    /// itself signal discard by returning `RetryDecision::Discard`.
    fn get_retry_interval(
        &self,
        task: &Task,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> RetryDecision;

    /// Encodes a value to be enqueued as a new task's `data`.
    fn encode_data(&self, group: &str, name: &str, value: &Self::Value) -> Result<Vec<u8>, CodecError>;

    /// Encodes a successful handler return value for storage as a result payload.
    fn encode_result(&self, task: &Task, value: &Self::Value) -> Result<Vec<u8>, CodecError>;

    /// Decodes a stored success payload back into `Value`.
    fn decode_result(&self, task: &Task, payload: &[u8]) -> Result<Self::Value, CodecError>;
}

/// Produces the bounded descriptor a worker persists for a failed task.
#[must_use]
pub fn error_descriptor(error: &(dyn std::error::Error + Send + Sync)) -> ErrorDescriptor {
    ErrorDescriptor::new(std::any::type_name_of_val(error), error.to_string())
}

/// Object-safe facade over a [`Handler`] that erases its associated
/// `Value` type. The worker and the kit's dispatch registry only ever
/// need to run a task and get back an encoded result or a retry
/// decision — they never touch `Value` directly — so this is what gets
/// stored behind `Arc<dyn ErasedHandler>` in a `(group, name)` registry
/// instead of the generic `Handler` itself.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    /// Runs the task and returns its encoded success payload.
    async fn run(&self, task: &Task) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

    fn get_retry_interval(&self, task: &Task, error: &(dyn std::error::Error + Send + Sync)) -> RetryDecision;
}

/// Adapts any [`Handler`] into an [`ErasedHandler`].
pub struct HandlerAdapter<H>(pub H);

#[async_trait]
impl<H: Handler> ErasedHandler for HandlerAdapter<H> {
    async fn run(&self, task: &Task) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let value = self.0.handle(task).await?;
        self.0.encode_result(task, &value).map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }

    fn get_retry_interval(&self, task: &Task, error: &(dyn std::error::Error + Send + Sync)) -> RetryDecision {
        self.0.get_retry_interval(task, error)
    }
}

/// Maps `(group, name)` to the handler responsible for it (spec §9's
/// "registry mapping (group, name) → function" design note). Shared by
/// the worker, which dispatches incoming tasks through it, and the kit,
/// which builds it up at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, group: impl Into<String>, name: impl Into<String>, handler: Arc<dyn ErasedHandler>) {
        self.handlers.insert((group.into(), name.into()), handler);
    }

    #[must_use]
    pub fn get(&self, group: &str, name: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(&(group.to_string(), name.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_display_matches_error_signal() {
        let discard = Discard;
        assert_eq!(discard.to_string(), "task discarded by handler");
    }

    #[test]
    fn error_descriptor_captures_message() {
        let error: Box<dyn std::error::Error + Send + Sync> = "boom".into();
        let descriptor = error_descriptor(error.as_ref());
        assert_eq!(descriptor.message, "boom");
    }
}

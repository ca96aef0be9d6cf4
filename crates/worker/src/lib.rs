// taskkit-worker: the single-worker poll/assign/execute/finalize state
// machine (spec §4.3) and the group worker pool that runs several of
// them concurrently against one backend (spec §4.4).

pub mod backoff;
pub mod pool;
pub mod worker;

pub use backoff::PollBackoff;
pub use pool::{spawn_group_pool, PoolHandle};
pub use worker::{Worker, WorkerConfig};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use taskkit_backend::memory::InMemoryBackend;
    use taskkit_backend::Backend;
    use taskkit_common::{CodecError, Handler, HandlerAdapter, HandlerRegistry, ResultKind, RetryDecision, Task};

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        type Value = Vec<u8>;

        async fn handle(&self, task: &Task) -> Result<Self::Value, Box<dyn std::error::Error + Send + Sync>> {
            Ok(task.data.clone())
        }

        fn get_retry_interval(&self, _task: &Task, _error: &(dyn std::error::Error + Send + Sync)) -> RetryDecision {
            RetryDecision::FailPermanently
        }

        fn encode_data(&self, _group: &str, _name: &str, value: &Self::Value) -> Result<Vec<u8>, CodecError> {
            Ok(value.clone())
        }

        fn encode_result(&self, _task: &Task, value: &Self::Value) -> Result<Vec<u8>, CodecError> {
            Ok(value.clone())
        }

        fn decode_result(&self, _task: &Task, payload: &[u8]) -> Result<Self::Value, CodecError> {
            Ok(payload.to_vec())
        }
    }

    #[tokio::test]
    async fn worker_completes_a_due_task() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let mut registry = HandlerRegistry::new();
        registry.register("echo", "say", Arc::new(HandlerAdapter(EchoHandler)));
        let registry = Arc::new(registry);

        let task = Task::new("echo", "say", b"hello".to_vec(), Utc::now());
        backend.enqueue(task.clone()).await.unwrap();

        let handle = spawn_group_pool(Arc::clone(&backend), registry, "echo", "w", 1, Duration::from_secs(10));

        let deadline = Utc::now() + chrono::Duration::seconds(5);
        let result = loop {
            if let Some(result) = backend.get_result(task.id, Utc::now() + chrono::Duration::milliseconds(50)).await.unwrap() {
                break result;
            }
            if Utc::now() > deadline {
                panic!("task did not complete in time");
            }
        };

        assert_eq!(result.kind, ResultKind::Success);
        assert_eq!(result.payload, b"hello");
        handle.join().await;
    }
}

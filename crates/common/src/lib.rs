// taskkit-common: shared types and utilities for the taskkit workspace

pub mod error;
pub mod handler;
pub mod schedule;
pub mod task;

pub use error::{CodecError, ErrorDescriptor};
pub use handler::{error_descriptor, ErasedHandler, Handler, HandlerAdapter, HandlerRegistry, RetryDecision};
pub use schedule::{RegularSchedule, Schedule, ScheduleEntry};
pub use task::{ResultKind, Task, TaskId, TaskResult, TaskState};

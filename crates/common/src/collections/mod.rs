//! Specialized data structures
//!
//! - **[`task_queue`]**: bounded async priority queue with backpressure

pub mod task_queue;

pub use task_queue::{
    BackpressurePolicy, Priority, QueueConfig, QueueError, QueueResult, TaskQueue,
};

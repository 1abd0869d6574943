//! Bounded async priority queue with backpressure
//!
//! Items leave the queue highest [`Priority`] first and in arrival order within
//! a priority. When the queue is at capacity an enqueue either fails with
//! [`QueueError::Full`] or suspends until space frees up, depending on the
//! configured [`BackpressurePolicy`]. Consumers suspend on an empty queue until
//! an item arrives or the queue is closed.
//!
//! Items are addressable by id so that a not-yet-dequeued entry can be
//! withdrawn with [`TaskQueue::remove`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CommonError, ErrorSeverity};
use crate::impl_error_classification;
use crate::resilience::{ConfigError, ConfigResult};

/// Task priority levels, most urgent last
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Priority::Background,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl_status_conversions!(Priority {
    Background => "background",
    Low => "low",
    Normal => "normal",
    High => "high",
    Critical => "critical",
});

/// Behavior of `enqueue` on a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail immediately with [`QueueError::Full`]
    #[default]
    Reject,
    /// Suspend the producer until an item leaves the queue
    Block,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued items
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024, backpressure: BackpressurePolicy::Reject }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, backpressure: BackpressurePolicy) -> Self {
        Self { capacity, backpressure }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "queue capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Queue operation errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Queue is at maximum capacity ({capacity})")]
    Full { capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Duplicate item ID: {0}")]
    DuplicateItem(String),
}

impl_error_classification!(QueueError, Common,
    Self::Full { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Closed => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::DuplicateItem(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

pub type QueueResult<T> = Result<T, QueueError>;

type SlotKey = (Reverse<Priority>, u64);

struct QueueState<K, T> {
    slots: BTreeMap<SlotKey, (K, T)>,
    index: HashMap<K, SlotKey>,
    sequence: u64,
    closed: bool,
}

impl<K: Eq + Hash + Clone, T> QueueState<K, T> {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn insert(&mut self, id: K, priority: Priority, item: T) {
        let key = (Reverse(priority), self.sequence);
        self.sequence += 1;
        self.index.insert(id.clone(), key);
        self.slots.insert(key, (id, item));
    }

    fn pop(&mut self) -> Option<T> {
        let (_, (id, item)) = self.slots.pop_first()?;
        self.index.remove(&id);
        Some(item)
    }
}

/// Bounded async priority queue
///
/// ```rust
/// use taskgate_common::collections::{Priority, QueueConfig, TaskQueue};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = TaskQueue::new(QueueConfig::default())?;
/// queue.enqueue("a", Priority::Low, "report").await?;
/// queue.enqueue("b", Priority::High, "alert").await?;
///
/// assert_eq!(queue.dequeue().await, Some("alert"));
/// # Ok(())
/// # }
/// ```
pub struct TaskQueue<K, T> {
    config: QueueConfig,
    state: Mutex<QueueState<K, T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<K, T> fmt::Debug for TaskQueue<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("capacity", &self.config.capacity)
            .field("len", &state.slots.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<K, T> TaskQueue<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new(config: QueueConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(QueueState {
                slots: BTreeMap::new(),
                index: HashMap::new(),
                sequence: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add an item under the configured backpressure policy
    pub async fn enqueue(&self, id: K, priority: Priority, item: T) -> QueueResult<()> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Registered before the capacity check so a concurrent dequeue cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.index.contains_key(&id) {
                    return Err(QueueError::DuplicateItem(format!("{id:?}")));
                }
                if state.len() < self.config.capacity {
                    state.insert(id, priority, item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                if self.config.backpressure == BackpressurePolicy::Reject {
                    debug!(capacity = self.config.capacity, "queue full, rejecting item");
                    return Err(QueueError::Full { capacity: self.config.capacity });
                }
            }

            debug!(capacity = self.config.capacity, "queue full, waiting for space");
            notified.await;
        }
    }

    /// Add an item if there is room, never suspending
    pub fn try_enqueue(&self, id: K, priority: Priority, item: T) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.index.contains_key(&id) {
            return Err(QueueError::DuplicateItem(format!("{id:?}")));
        }
        if state.len() >= self.config.capacity {
            return Err(QueueError::Full { capacity: self.config.capacity });
        }
        state.insert(id, priority, item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next item, suspending while the queue is empty
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.pop() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next item if one is queued
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.state.lock().pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Withdraw a queued item by id
    pub fn remove(&self, id: &K) -> Option<T> {
        let item = {
            let mut state = self.state.lock();
            let key = state.index.remove(id)?;
            state.slots.remove(&key).map(|(_, item)| item)
        };
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove and return every queued item in dequeue order
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = {
            let mut state = self.state.lock();
            state.index.clear();
            std::mem::take(&mut state.slots).into_values().map(|(_, item)| item).collect()
        };
        self.not_full.notify_waiters();
        items
    }

    /// Stop accepting items and wake every waiter
    ///
    /// Already queued items can still be dequeued.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, id: &K) -> bool {
        self.state.lock().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }
}

//! Per-module FIFO work queues with blocking pop.
//!
//! Multi-producer/multi-consumer. `get_next` blocks up to a timeout waiting
//! for a request (zero means non-blocking). Version gating and claim
//! locking happen in the system layer; the queues only own FIFO ordering.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{CoreError, CoreResult};
use crate::models::AnalysisRequest;

/// Contract for the per-module work queues.
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Create a queue for the named module type. Returns false when the
    /// queue already exists.
    async fn add_queue(&self, module_name: &str) -> CoreResult<bool>;

    /// Delete a queue and discard its contents. Returns false when absent.
    async fn delete_queue(&self, module_name: &str) -> CoreResult<bool>;

    /// True when the named queue exists.
    async fn queue_exists(&self, module_name: &str) -> CoreResult<bool>;

    /// Append a request to the named queue.
    async fn put(&self, module_name: &str, request: &AnalysisRequest) -> CoreResult<()>;

    /// Pop the next request, waiting up to `timeout` for one to arrive.
    async fn get_next(
        &self,
        module_name: &str,
        timeout: Duration,
    ) -> CoreResult<Option<AnalysisRequest>>;

    /// Number of requests waiting on the named queue.
    async fn queue_size(&self, module_name: &str) -> CoreResult<u64>;

    /// Remove every queue, waking blocked consumers.
    async fn reset(&self) -> CoreResult<()>;
}

/// Deadline for a blocking pop, clamped so oversized timeouts cannot
/// overflow the clock.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

struct Queue {
    entries: Mutex<VecDeque<AnalysisRequest>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// In-memory work queue store.
pub struct MemoryWorkQueueStore {
    queues: DashMap<String, Arc<Queue>>,
}

impl MemoryWorkQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    fn queue(&self, module_name: &str) -> CoreResult<Arc<Queue>> {
        self.queues
            .get(module_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::UnknownAnalysisModuleType(module_name.to_string()))
    }
}

impl Default for MemoryWorkQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueueStore for MemoryWorkQueueStore {
    async fn add_queue(&self, module_name: &str) -> CoreResult<bool> {
        match self.queues.entry(module_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Queue::new()));
                Ok(true)
            }
        }
    }

    async fn delete_queue(&self, module_name: &str) -> CoreResult<bool> {
        match self.queues.remove(module_name) {
            Some((_, queue)) => {
                // wake any blocked consumers so they observe the removal
                queue.notify.notify_waiters();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_exists(&self, module_name: &str) -> CoreResult<bool> {
        Ok(self.queues.contains_key(module_name))
    }

    async fn put(&self, module_name: &str, request: &AnalysisRequest) -> CoreResult<()> {
        let queue = self.queue(module_name)?;
        queue.entries.lock().await.push_back(request.clone());
        queue.notify.notify_one();
        Ok(())
    }

    async fn get_next(
        &self,
        module_name: &str,
        timeout: Duration,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let queue = self.queue(module_name)?;
        let deadline = deadline_after(timeout);

        loop {
            if let Some(request) = queue.entries.lock().await.pop_front() {
                return Ok(Some(request));
            }

            if timeout.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }

            // the queue may have been deleted while we waited
            if !self.queues.contains_key(module_name) {
                return Ok(None);
            }
        }
    }

    async fn reset(&self) -> CoreResult<()> {
        for entry in self.queues.iter() {
            entry.notify.notify_waiters();
        }
        self.queues.clear();
        Ok(())
    }

    async fn queue_size(&self, module_name: &str) -> CoreResult<u64> {
        let queue = self.queue(module_name)?;
        let size = queue.entries.lock().await.len();
        Ok(size as u64)
    }
}

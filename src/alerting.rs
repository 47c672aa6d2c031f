//! Alert delivery: named alert systems long-poll for the uuids of roots
//! that carried detection points at completion.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Contract for alert fan-out.
#[async_trait]
pub trait AlertBroker: Send + Sync {
    /// Register an alert system. Returns false when already registered.
    async fn register(&self, name: &str) -> CoreResult<bool>;

    /// Unregister an alert system. Returns false when unknown.
    async fn unregister(&self, name: &str) -> CoreResult<bool>;

    /// Push a root uuid onto every registered alert system queue. Returns
    /// true when at least one system received it.
    async fn submit(&self, root_uuid: Uuid) -> CoreResult<bool>;

    /// Fetch pending alerts for an alert system. With no timeout every
    /// pending alert drains immediately; with a timeout the call blocks
    /// for up to that long waiting for a single alert.
    async fn get_alerts(&self, name: &str, timeout: Option<Duration>) -> CoreResult<Vec<Uuid>>;

    /// Number of pending alerts for an alert system.
    async fn alert_count(&self, name: &str) -> CoreResult<u64>;

    /// Remove every alert system, waking blocked pollers.
    async fn reset(&self) -> CoreResult<()>;
}

struct AlertQueue {
    entries: Mutex<VecDeque<Uuid>>,
    notify: Notify,
}

impl AlertQueue {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// In-memory alert broker.
pub struct MemoryAlertBroker {
    systems: DashMap<String, Arc<AlertQueue>>,
}

impl MemoryAlertBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            systems: DashMap::new(),
        }
    }

    fn system(&self, name: &str) -> CoreResult<Arc<AlertQueue>> {
        self.systems
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::UnknownAlertSystem(name.to_string()))
    }
}

impl Default for MemoryAlertBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertBroker for MemoryAlertBroker {
    async fn register(&self, name: &str) -> CoreResult<bool> {
        match self.systems.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(AlertQueue::new()));
                Ok(true)
            }
        }
    }

    async fn unregister(&self, name: &str) -> CoreResult<bool> {
        Ok(self.systems.remove(name).is_some())
    }

    async fn submit(&self, root_uuid: Uuid) -> CoreResult<bool> {
        let mut delivered = false;
        let queues: Vec<Arc<AlertQueue>> = self
            .systems
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for queue in queues {
            queue.entries.lock().await.push_back(root_uuid);
            queue.notify.notify_one();
            delivered = true;
        }

        Ok(delivered)
    }

    async fn get_alerts(&self, name: &str, timeout: Option<Duration>) -> CoreResult<Vec<Uuid>> {
        let queue = self.system(name)?;

        match timeout {
            None => {
                let mut entries = queue.entries.lock().await;
                Ok(entries.drain(..).collect())
            }
            Some(timeout) => {
                let deadline = crate::queues::deadline_after(timeout);
                loop {
                    if let Some(uuid) = queue.entries.lock().await.pop_front() {
                        return Ok(vec![uuid]);
                    }

                    tokio::select! {
                        _ = queue.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                    }
                }
            }
        }
    }

    async fn alert_count(&self, name: &str) -> CoreResult<u64> {
        let queue = self.system(name)?;
        let count = queue.entries.lock().await.len();
        Ok(count as u64)
    }

    async fn reset(&self) -> CoreResult<()> {
        for entry in self.systems.iter() {
            entry.notify.notify_waiters();
        }
        self.systems.clear();
        Ok(())
    }
}

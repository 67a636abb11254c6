use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::error::RelayError;

/// Admission control for assistant runs: one run per conversation at a time,
/// and at most `max_concurrent` runs overall.
#[derive(Clone)]
pub struct RunGate {
    conversations: Arc<DashMap<String, Arc<Mutex<()>>>>,
    global: Arc<Semaphore>,
}

/// Held for the duration of one run. Dropping it releases both slots.
pub struct RunPermit {
    conversations: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    _global: OwnedSemaphorePermit,
}

impl RunGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            conversations: Arc::new(DashMap::new()),
            global: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub async fn acquire(&self, convo_id: &str) -> Result<RunPermit, RelayError> {
        let lock = self
            .conversations
            .entry(convo_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Internal("run gate closed".to_string()))?;

        Ok(RunPermit {
            conversations: self.conversations.clone(),
            key: convo_id.to_string(),
            lock,
            guard: Some(guard),
            _global: global,
        })
    }

    #[cfg(test)]
    fn available_runs(&self) -> usize {
        self.global.available_permits()
    }

    #[cfg(test)]
    fn tracked_conversations(&self) -> usize {
        self.conversations.len()
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map and this permit still point at the lock: nobody is waiting.
        self.conversations
            .remove_if(&self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
    }
}

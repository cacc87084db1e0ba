// src/core/timer.rs

//! A small timer service over the tokio runtime: schedule a future for an
//! absolute deadline, cancel it by id.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identifies a scheduled timer. The generation component makes ids unique
/// even when the same scope (e.g. a deferred-ack buffer's node) is rescheduled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub scope: String,
    pub generation: u64,
}

impl TimerId {
    pub fn new(scope: impl Into<String>, generation: u64) -> Self {
        Self {
            scope: scope.into(),
            generation,
        }
    }
}

/// Schedules callbacks at absolute deadlines.
#[derive(Debug, Default)]
pub struct TimerService {
    tasks: Arc<DashMap<TimerId, JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run at `fire_at`. A previously scheduled timer
    /// with the same id is replaced.
    pub fn schedule<F>(&self, id: TimerId, fire_at: Instant, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at.into()).await;
            // Deregister before running: a cancel arriving mid-callback must
            // not abort the callback itself.
            tasks.remove(&task_id);
            callback.await;
        });
        if let Some(previous) = self.tasks.insert(id.clone(), handle) {
            previous.abort();
        }
        // The callback may have completed before the insert landed.
        if let Some(current) = self.tasks.get(&id)
            && current.value().is_finished()
        {
            drop(current);
            self.tasks.remove(&id);
        }
    }

    /// Cancels a scheduled timer. Callbacks must tolerate cancellation at
    /// their await points; callers guard one-shot effects themselves.
    pub fn cancel(&self, id: &TimerId) {
        if let Some((_, handle)) = self.tasks.remove(id) {
            trace!("Cancelled timer {:?}", id);
            handle.abort();
        }
    }

    /// Aborts every outstanding timer. Called on engine shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<TimerId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

//! Enqueues continuations once their parent succeeds.

use chrono::Utc;
use std::sync::Arc;

use crate::core::types::JobId;
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, StorageError};

/// Promotes the dependents of succeeded jobs.
///
/// Dependents of a failed job are left `Scheduled` until they are deleted.
pub struct ContinuationLinker<S: JobStore> {
    store: Arc<S>,
    event_bus: Arc<EventBus>,
}

impl<S: JobStore> Clone for ContinuationLinker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            event_bus: Arc::clone(&self.event_bus),
        }
    }
}

impl<S: JobStore> ContinuationLinker<S> {
    pub fn new(store: Arc<S>, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    /// Enqueue the ready continuations of `parent` and report each one.
    pub async fn on_succeeded(&self, parent: &JobId) -> Result<Vec<JobId>, StorageError> {
        let promoted = self.store.promote_continuations(parent, Utc::now()).await?;
        for child in &promoted {
            self.event_bus
                .emit(Event::continuation_enqueued(child.clone(), parent.clone()))
                .await;
        }
        Ok(promoted)
    }
}

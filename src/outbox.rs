use crate::core::{OutboxEntry, Result};
use crate::dispatch::Dispatcher;
use crate::storage::{CollectionName, DurableStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{Level, event};

/// Result of a drain that dispatched every queued entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub dispatched: usize,
    pub cleared: usize,
}

/// Persisted FIFO of mutations awaiting remote confirmation.
#[derive(Clone)]
pub struct Outbox {
    store: DurableStore,
}

impl Outbox {
    pub fn new(store: DurableStore) -> Self {
        Self { store }
    }

    /// Appends an entry. Returns once the entry is durable.
    pub async fn enqueue(&self, entry: &OutboxEntry) -> StoreResult<()> {
        self.store.add(entry).await?;
        event!(
            Level::DEBUG,
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            action = %entry.action,
            "outbox entry enqueued"
        );
        Ok(())
    }

    /// Dispatches every entry in enqueue order.
    ///
    /// Entries are removed only when all of them were dispatched, in a single
    /// transaction. On the first failure nothing is removed, including entries
    /// that were already accepted in this pass; they will be sent again on the
    /// next drain. Entries enqueued while the drain is running are not part of
    /// this pass and stay queued.
    pub async fn drain_all(&self, dispatcher: &dyn Dispatcher) -> Result<DrainReport> {
        let entries = self.store.get_all::<OutboxEntry>().await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        for (position, entry) in entries.iter().enumerate() {
            if let Err(fault) = dispatcher.dispatch(entry).await {
                event!(
                    Level::WARN,
                    entry_id = %entry.id,
                    position,
                    queued = entries.len(),
                    error = %fault,
                    "outbox drain aborted"
                );
                return Err(fault.into());
            }
        }

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let cleared = self.store.delete_many::<OutboxEntry>(&ids).await?;
        event!(Level::INFO, dispatched = entries.len(), cleared, "outbox drained");
        Ok(DrainReport {
            dispatched: entries.len(),
            cleared,
        })
    }

    /// Read-only snapshot of the queue in FIFO order.
    pub async fn peek(&self) -> StoreResult<Vec<OutboxEntry>> {
        self.store.get_all().await
    }

    pub async fn len(&self) -> StoreResult<usize> {
        self.store.count(CollectionName::Outbox).await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DispatchFault, EntityType, SyncAction, SyncError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records dispatched ids; fails on the configured call number (1-based).
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(entry.id.clone());
            if Some(seen.len()) == self.fail_on_call {
                return Err(DispatchFault::Unreachable("boom".to_string()));
            }
            Ok(())
        }
    }

    async fn outbox_with(n: usize) -> (Outbox, Vec<String>) {
        let outbox = Outbox::new(DurableStore::in_memory());
        let mut ids = Vec::new();
        for i in 0..n {
            let entry = OutboxEntry::new(EntityType::Expense, SyncAction::Create, json!({"n": i}));
            ids.push(entry.id.clone());
            outbox.enqueue(&entry).await.unwrap();
        }
        (outbox, ids)
    }

    #[tokio::test]
    async fn test_drain_dispatches_in_order_and_empties() {
        let (outbox, ids) = outbox_with(5).await;
        let recorder = Recorder::default();

        let report = outbox.drain_all(&recorder).await.unwrap();
        assert_eq!(report, DrainReport { dispatched: 5, cleared: 5 });
        assert_eq!(*recorder.seen.lock().unwrap(), ids);
        assert!(outbox.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_every_entry() {
        let (outbox, ids) = outbox_with(3).await;
        let failing = Recorder {
            fail_on_call: Some(2),
            ..Recorder::default()
        };

        let err = outbox.drain_all(&failing).await.unwrap_err();
        assert!(matches!(err, SyncError::Dispatch(_)));
        assert_eq!(outbox.len().await.unwrap(), 3);

        let recorder = Recorder::default();
        outbox.drain_all(&recorder).await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), ids);
        assert_eq!(outbox.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peek_does_not_mutate() {
        let (outbox, ids) = outbox_with(2).await;
        let first = outbox.peek().await.unwrap();
        let second = outbox.peek().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), ids);
    }

    #[tokio::test]
    async fn test_empty_drain_is_a_noop() {
        let (outbox, _) = outbox_with(0).await;
        let recorder = Recorder::default();
        let report = outbox.drain_all(&recorder).await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}

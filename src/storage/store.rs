use crate::config::StoreConfig;
use crate::core::{IndexQuery, StorageFault};
use crate::storage::collection::{Collection, CollectionName, Record};
use crate::storage::persistence::{DurabilityMode, JournalOp, PersistenceManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

pub type StoreResult<T> = std::result::Result<T, StorageFault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub expenses: usize,
    pub budgets: usize,
    pub outbox: usize,
    pub journal_ops_since_checkpoint: usize,
}

struct StoreInner {
    open: bool,
    collections: HashMap<CollectionName, Collection>,
    persistence: Option<PersistenceManager>,
    checkpoint_every_ops: usize,
}

impl StoreInner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageFault::NotOpen)
        }
    }

    fn collection(&self, name: CollectionName) -> StoreResult<&Collection> {
        self.collections
            .get(&name)
            .ok_or_else(|| StorageFault::Corrupted(format!("collection '{}' missing", name)))
    }

    /// Journal first, then apply. A failed append leaves memory untouched.
    async fn commit(&mut self, op: JournalOp) -> StoreResult<()> {
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.log(&op).await?;
        }
        op.apply(&mut self.collections);
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn maybe_checkpoint(&mut self) {
        let Some(persistence) = self.persistence.as_mut() else {
            return;
        };
        if persistence.ops_since_checkpoint() < self.checkpoint_every_ops {
            return;
        }
        // The journal already holds the committed op; a failed checkpoint only
        // delays compaction.
        if let Err(err) = persistence.checkpoint(&self.collections).await {
            event!(Level::WARN, error = %err, "store checkpoint failed");
        }
    }
}

/// Transactional local store holding entity records and the outbox.
///
/// Each operation runs under a single lock acquisition against exactly one
/// collection; there is no transaction spanning collections.
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl DurableStore {
    /// Opens the store, recovering from snapshot and journal when the config
    /// points at a data directory.
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let (collections, persistence) = match (&config.data_dir, config.durability) {
            (Some(dir), mode) if mode != DurabilityMode::Memory => {
                let mut persistence = PersistenceManager::new(dir, mode).await?;
                let collections = persistence.recover().await?;
                (collections, Some(persistence))
            }
            _ => (empty_collections(), None),
        };

        let store = Self {
            inner: Arc::new(Mutex::new(StoreInner {
                open: true,
                collections,
                persistence,
                checkpoint_every_ops: config.checkpoint_every_ops.max(1),
            })),
        };
        event!(Level::INFO, data_dir = ?config.data_dir, "store opened");
        Ok(store)
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                open: true,
                collections: empty_collections(),
                persistence: None,
                checkpoint_every_ops: usize::MAX,
            })),
        }
    }

    /// Inserts a new record; fails with `DuplicateKey` if the id exists.
    pub async fn add<R: Record>(&self, record: &R) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.collection(R::COLLECTION)?.contains(record.id()) {
            return Err(StorageFault::DuplicateKey {
                collection: R::COLLECTION.to_string(),
                id: record.id().to_string(),
            });
        }
        inner.commit(put_op(record)?).await
    }

    /// Inserts or replaces a record.
    pub async fn put<R: Record>(&self, record: &R) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.commit(put_op(record)?).await
    }

    /// Removes a record. Returns whether it existed; deleting a missing id is
    /// not an error.
    pub async fn delete<R: Record>(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if !inner.collection(R::COLLECTION)?.contains(id) {
            return Ok(false);
        }
        inner
            .commit(JournalOp::Delete {
                collection: R::COLLECTION,
                id: id.to_string(),
            })
            .await?;
        Ok(true)
    }

    /// Removes every listed id in one transaction. Ids that are already gone
    /// are skipped. Returns how many records were removed.
    pub async fn delete_many<R: Record>(&self, ids: &[String]) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let collection = inner.collection(R::COLLECTION)?;
        let present: Vec<String> = ids
            .iter()
            .filter(|id| collection.contains(id))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }
        let removed = present.len();
        inner
            .commit(JournalOp::DeleteMany {
                collection: R::COLLECTION,
                ids: present,
            })
            .await?;
        Ok(removed)
    }

    pub async fn get<R: Record>(&self, id: &str) -> StoreResult<Option<R>> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner
            .collection(R::COLLECTION)?
            .get(id)
            .map(decode::<R>)
            .transpose()
    }

    /// Every record of the collection, in insertion order.
    pub async fn get_all<R: Record>(&self) -> StoreResult<Vec<R>> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner
            .collection(R::COLLECTION)?
            .scan()
            .into_iter()
            .map(decode::<R>)
            .collect()
    }

    pub async fn get_by_index<R: Record>(
        &self,
        index: &str,
        query: &IndexQuery,
    ) -> StoreResult<Vec<R>> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner
            .collection(R::COLLECTION)?
            .lookup(index, query)?
            .into_iter()
            .map(decode::<R>)
            .collect()
    }

    pub async fn clear(&self, collection: CollectionName) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.commit(JournalOp::Clear { collection }).await
    }

    pub async fn count(&self, collection: CollectionName) -> StoreResult<usize> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.collection(collection)?.len())
    }

    /// Forces a checkpoint: snapshot everything and truncate the journal.
    pub async fn compact(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let StoreInner {
            collections,
            persistence,
            ..
        } = &mut *inner;
        if let Some(persistence) = persistence.as_mut() {
            persistence.checkpoint(collections).await?;
        }
        Ok(())
    }

    /// Checkpoints and closes. Later operations fail with `NotOpen`.
    pub async fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Ok(());
        }
        let StoreInner {
            collections,
            persistence,
            ..
        } = &mut *inner;
        if let Some(persistence) = persistence.as_mut() {
            persistence.checkpoint(collections).await?;
        }
        inner.open = false;
        event!(Level::INFO, "store closed");
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(StoreStats {
            expenses: inner.collection(CollectionName::Expenses)?.len(),
            budgets: inner.collection(CollectionName::Budgets)?.len(),
            outbox: inner.collection(CollectionName::Outbox)?.len(),
            journal_ops_since_checkpoint: inner
                .persistence
                .as_ref()
                .map(|p| p.ops_since_checkpoint())
                .unwrap_or_default(),
        })
    }
}

fn empty_collections() -> HashMap<CollectionName, Collection> {
    CollectionName::ALL
        .into_iter()
        .map(|name| (name, Collection::new(name)))
        .collect()
}

fn put_op<R: Record>(record: &R) -> StoreResult<JournalOp> {
    Ok(JournalOp::Put {
        collection: R::COLLECTION,
        id: record.id().to_string(),
        doc: serde_json::to_value(record)?,
        keys: record.index_keys(),
    })
}

fn decode<R: Record>(doc: &serde_json::Value) -> StoreResult<R> {
    R::deserialize(doc).map_err(|err| {
        StorageFault::Serialization(format!("decode {} record: {}", R::COLLECTION, err))
    })
}

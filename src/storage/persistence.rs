//! Journal and snapshot persistence for the durable store

use crate::core::{IndexValue, StorageFault};
use crate::storage::collection::{Collection, CollectionName};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{Level, event};

type StoreResult<T> = std::result::Result<T, StorageFault>;

pub const JOURNAL_FILE: &str = "budgetsync.journal";
pub const SNAPSHOT_FILE: &str = "budgetsync.snapshot";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Journal Entry Types
// ============================================================================

/// A single committed mutation of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Put {
        collection: CollectionName,
        id: String,
        doc: serde_json::Value,
        keys: BTreeMap<String, IndexValue>,
    },
    Delete {
        collection: CollectionName,
        id: String,
    },
    DeleteMany {
        collection: CollectionName,
        ids: Vec<String>,
    },
    Clear {
        collection: CollectionName,
    },
}

impl JournalOp {
    /// Re-applies the op during recovery. Replay is idempotent.
    pub fn apply(self, collections: &mut HashMap<CollectionName, Collection>) {
        match self {
            JournalOp::Put {
                collection,
                id,
                doc,
                keys,
            } => {
                collections
                    .entry(collection)
                    .or_insert_with(|| Collection::new(collection))
                    .upsert(&id, doc, keys);
            }
            JournalOp::Delete { collection, id } => {
                if let Some(c) = collections.get_mut(&collection) {
                    c.remove(&id);
                }
            }
            JournalOp::DeleteMany { collection, ids } => {
                if let Some(c) = collections.get_mut(&collection) {
                    for id in &ids {
                        c.remove(id);
                    }
                }
            }
            JournalOp::Clear { collection } => {
                if let Some(c) = collections.get_mut(&collection) {
                    c.clear();
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub ts_unix_ms: i64,
    #[serde(flatten)]
    pub op: JournalOp,
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityMode {
    /// Every journal append is fsynced before the operation returns.
    #[default]
    Strict,
    /// Appends are flushed. An append fsyncs the journal only when at least
    /// `sync_interval_ms` passed since the last fsync, so the tail of a burst
    /// stays unsynced until a later append or a checkpoint. `compact` and
    /// `close` checkpoint.
    Eventual { sync_interval_ms: u64 },
    /// Nothing touches disk.
    Memory,
}

// ============================================================================
// Journal
// ============================================================================

pub struct Journal {
    path: PathBuf,
    durability: DurabilityMode,
    next_seq: u64,
    ops_since_checkpoint: usize,
    last_sync_unix_ms: i64,
}

impl Journal {
    pub fn new(path: PathBuf, durability: DurabilityMode) -> Self {
        Self {
            path,
            durability,
            next_seq: 1,
            ops_since_checkpoint: 0,
            last_sync_unix_ms: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ops_since_checkpoint(&self) -> usize {
        self.ops_since_checkpoint
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Appends one record, honouring the durability mode.
    pub async fn append(&mut self, op: &JournalOp) -> StoreResult<u64> {
        let seq = self.next_seq;
        let record = JournalRecord {
            seq,
            ts_unix_ms: Utc::now().timestamp_millis(),
            op: op.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let now_ms = Utc::now().timestamp_millis();
        match self.durability {
            DurabilityMode::Strict => {
                file.sync_data().await?;
                self.last_sync_unix_ms = now_ms;
            }
            DurabilityMode::Eventual { sync_interval_ms } => {
                if now_ms - self.last_sync_unix_ms >= sync_interval_ms as i64 {
                    file.sync_data().await?;
                    self.last_sync_unix_ms = now_ms;
                }
            }
            DurabilityMode::Memory => {}
        }

        self.next_seq = seq.saturating_add(1);
        self.ops_since_checkpoint = self.ops_since_checkpoint.saturating_add(1);
        Ok(seq)
    }

    /// Reads every record with `seq > after_seq`.
    ///
    /// An unparsable final line is treated as a torn write and dropped; an
    /// unparsable line anywhere else means the journal is corrupted.
    pub async fn read_after(&mut self, after_seq: u64) -> StoreResult<Vec<JournalRecord>> {
        self.next_seq = after_seq.saturating_add(1);
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut raw = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                raw.push(line);
            }
        }

        let mut records = Vec::with_capacity(raw.len());
        let last = raw.len().saturating_sub(1);
        let mut torn_tail = false;
        for (position, line) in raw.iter().enumerate() {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => {
                    if record.seq > after_seq {
                        self.next_seq = self.next_seq.max(record.seq.saturating_add(1));
                        records.push(record);
                    }
                }
                Err(err) if position == last => {
                    event!(Level::WARN, error = %err, "dropping torn journal tail");
                    torn_tail = true;
                }
                Err(err) => {
                    return Err(StorageFault::Corrupted(format!(
                        "journal line {}: {}",
                        position + 1,
                        err
                    )));
                }
            }
        }
        if torn_tail {
            raw.pop();
            self.rewrite(&raw).await?;
        }
        self.ops_since_checkpoint = records.len();
        Ok(records)
    }

    /// Replaces the journal with `lines` so later appends start on a clean line.
    async fn rewrite(&self, lines: &[String]) -> StoreResult<()> {
        let tmp_path = self.path.with_extension("journal.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        for line in lines {
            tmp.write_all(line.as_bytes()).await?;
            tmp.write_all(b"\n").await?;
        }
        tmp.flush().await?;
        tmp.sync_all().await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Empties the journal after a snapshot has captured everything in it.
    pub async fn truncate(&mut self) -> StoreResult<()> {
        self.rewrite(&[]).await?;
        self.ops_since_checkpoint = 0;
        Ok(())
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub last_seq: u64,
    pub created_at_unix_ms: i64,
    pub collections: Vec<Collection>,
}

impl StoreSnapshot {
    pub fn new(collections: &HashMap<CollectionName, Collection>, last_seq: u64) -> Self {
        let mut collections: Vec<Collection> = collections.values().cloned().collect();
        collections.sort_by_key(|c| c.name());
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            last_seq,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            collections,
        }
    }

    pub fn into_collections(self) -> HashMap<CollectionName, Collection> {
        self.collections
            .into_iter()
            .map(|mut c| {
                c.rebuild_indexes();
                (c.name(), c)
            })
            .collect()
    }
}

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self { snapshot_path }
    }

    /// Writes to a temporary file and renames it over the previous snapshot.
    pub async fn save(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| StorageFault::Serialization(format!("snapshot: {}", e)))?;
        let tmp_path = self.snapshot_path.with_extension("snapshot.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(&serialized).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, &self.snapshot_path).await?;
        Ok(())
    }

    pub async fn load(&self) -> StoreResult<Option<StoreSnapshot>> {
        if !fs::try_exists(&self.snapshot_path).await? {
            return Ok(None);
        }
        let data = fs::read(&self.snapshot_path).await?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| StorageFault::Corrupted(format!("snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageFault::Corrupted(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    journal: Journal,
    snapshot: SnapshotManager,
}

impl PersistenceManager {
    pub async fn new(data_dir: &Path, durability: DurabilityMode) -> StoreResult<Self> {
        fs::create_dir_all(data_dir).await?;
        Ok(Self {
            journal: Journal::new(data_dir.join(JOURNAL_FILE), durability),
            snapshot: SnapshotManager::new(data_dir.join(SNAPSHOT_FILE)),
        })
    }

    pub async fn log(&mut self, op: &JournalOp) -> StoreResult<u64> {
        self.journal.append(op).await
    }

    pub fn ops_since_checkpoint(&self) -> usize {
        self.journal.ops_since_checkpoint()
    }

    /// Snapshot everything, then drop the journal the snapshot subsumes.
    pub async fn checkpoint(
        &mut self,
        collections: &HashMap<CollectionName, Collection>,
    ) -> StoreResult<()> {
        let snapshot = StoreSnapshot::new(collections, self.journal.last_seq());
        self.snapshot.save(&snapshot).await?;
        self.journal.truncate().await?;
        event!(
            Level::DEBUG,
            last_seq = snapshot.last_seq,
            "store checkpoint written"
        );
        Ok(())
    }

    /// Loads the latest snapshot and replays the journal on top of it.
    pub async fn recover(&mut self) -> StoreResult<HashMap<CollectionName, Collection>> {
        let (mut collections, last_seq) = match self.snapshot.load().await? {
            Some(snapshot) => {
                let last_seq = snapshot.last_seq;
                (snapshot.into_collections(), last_seq)
            }
            None => (HashMap::new(), 0),
        };

        let records = self.journal.read_after(last_seq).await?;
        let replayed = records.len();
        for record in records {
            record.op.apply(&mut collections);
        }

        for name in CollectionName::ALL {
            collections
                .entry(name)
                .or_insert_with(|| Collection::new(name));
        }

        event!(Level::DEBUG, snapshot_seq = last_seq, replayed, "store recovered");
        Ok(collections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(collection: CollectionName, id: &str) -> JournalOp {
        JournalOp::Put {
            collection,
            id: id.to_string(),
            doc: json!({ "id": id }),
            keys: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_journal_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let mut pm = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        pm.log(&put(CollectionName::Outbox, "a")).await.unwrap();
        pm.log(&put(CollectionName::Outbox, "b")).await.unwrap();
        pm.log(&JournalOp::Delete {
            collection: CollectionName::Outbox,
            id: "a".to_string(),
        })
        .await
        .unwrap();

        let mut reopened = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let collections = reopened.recover().await.unwrap();
        let outbox = &collections[&CollectionName::Outbox];
        assert_eq!(outbox.len(), 1);
        assert!(outbox.contains("b"));
        assert_eq!(reopened.ops_since_checkpoint(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_truncates_journal_and_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let mut pm = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let mut collections = pm.recover().await.unwrap();

        let op = put(CollectionName::Budgets, "b1");
        pm.log(&op).await.unwrap();
        op.apply(&mut collections);
        pm.checkpoint(&collections).await.unwrap();
        assert_eq!(pm.ops_since_checkpoint(), 0);

        let op = put(CollectionName::Budgets, "b2");
        pm.log(&op).await.unwrap();

        let mut reopened = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let recovered = reopened.recover().await.unwrap();
        assert_eq!(recovered[&CollectionName::Budgets].len(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let mut pm = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        pm.log(&put(CollectionName::Expenses, "e1")).await.unwrap();

        let journal_path = temp_dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .await
            .unwrap();
        file.write_all(b"{\"seq\":2,\"ts_unix_ms\":1,\"op\":\"pu").await.unwrap();
        file.flush().await.unwrap();

        let mut reopened = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let recovered = reopened.recover().await.unwrap();
        assert_eq!(recovered[&CollectionName::Expenses].len(), 1);

        reopened.log(&put(CollectionName::Expenses, "e2")).await.unwrap();
        let mut again = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let recovered = again.recover().await.unwrap();
        assert_eq!(recovered[&CollectionName::Expenses].len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_fails_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let journal_path = temp_dir.path().join(JOURNAL_FILE);
        fs::write(&journal_path, "garbage\n{\"seq\":1,\"ts_unix_ms\":1,\"op\":\"clear\",\"collection\":\"outbox\"}\n")
            .await
            .unwrap();

        let mut pm = PersistenceManager::new(temp_dir.path(), DurabilityMode::Strict)
            .await
            .unwrap();
        let err = pm.recover().await.unwrap_err();
        assert!(matches!(err, StorageFault::Corrupted(_)));
    }
}

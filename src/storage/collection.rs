use crate::core::{Budget, Expense, IndexQuery, IndexValue, OutboxEntry, StorageFault};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// The independently keyed collections the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    Expenses,
    Budgets,
    Outbox,
}

impl CollectionName {
    pub const ALL: [CollectionName; 3] = [Self::Expenses, Self::Budgets, Self::Outbox];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expenses => "expenses",
            Self::Budgets => "budgets",
            Self::Outbox => "outbox",
        }
    }

    /// Secondary indices maintained for the collection.
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            Self::Expenses => &["category", "date", "synced"],
            Self::Budgets => &["category", "month"],
            Self::Outbox => &[],
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A type that can be stored in one of the store's collections.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: CollectionName;

    fn id(&self) -> &str;

    /// Key for the named secondary index, `None` if the record has none.
    fn index_value(&self, index: &str) -> Option<IndexValue>;

    /// All index keys of this record, as written to the journal.
    fn index_keys(&self) -> BTreeMap<String, IndexValue> {
        Self::COLLECTION
            .indexes()
            .iter()
            .filter_map(|index| {
                self.index_value(index)
                    .map(|value| (index.to_string(), value))
            })
            .collect()
    }
}

impl Record for Expense {
    const COLLECTION: CollectionName = CollectionName::Expenses;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: &str) -> Option<IndexValue> {
        match index {
            "category" => Some(IndexValue::from(self.category.as_str())),
            "date" => Some(IndexValue::from(self.date)),
            "synced" => Some(IndexValue::from(self.synced)),
            _ => None,
        }
    }
}

impl Record for Budget {
    const COLLECTION: CollectionName = CollectionName::Budgets;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: &str) -> Option<IndexValue> {
        match index {
            "category" => Some(IndexValue::from(self.category.as_str())),
            "month" => Some(IndexValue::from(self.month)),
            _ => None,
        }
    }
}

impl Record for OutboxEntry {
    const COLLECTION: CollectionName = CollectionName::Outbox;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, _index: &str) -> Option<IndexValue> {
        None
    }
}

// ============================================================================
// Collection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRow {
    pub seq: u64,
    pub doc: serde_json::Value,
    pub keys: BTreeMap<String, IndexValue>,
}

/// One keyed collection: documents by id, iterated in insertion order, with
/// ordered secondary indices.
///
/// Indices are not serialized; they are rebuilt after a snapshot is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    name: CollectionName,
    next_seq: u64,
    rows: HashMap<String, StoredRow>,
    order: BTreeMap<u64, String>,
    #[serde(skip)]
    indexes: HashMap<String, BTreeMap<IndexValue, BTreeSet<u64>>>,
}

impl Collection {
    pub fn new(name: CollectionName) -> Self {
        let mut collection = Self {
            name,
            next_seq: 0,
            rows: HashMap::new(),
            order: BTreeMap::new(),
            indexes: HashMap::new(),
        };
        collection.rebuild_indexes();
        collection
    }

    pub fn name(&self) -> CollectionName {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Inserts or replaces. A replaced document keeps its position.
    pub fn upsert(&mut self, id: &str, doc: serde_json::Value, keys: BTreeMap<String, IndexValue>) {
        let seq = match self.rows.get(id) {
            Some(existing) => {
                let seq = existing.seq;
                let old_keys = existing.keys.clone();
                self.remove_from_indexes(seq, &old_keys);
                seq
            }
            None => {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.saturating_add(1);
                self.order.insert(seq, id.to_string());
                seq
            }
        };
        self.update_indexes(seq, &keys);
        self.rows.insert(id.to_string(), StoredRow { seq, doc, keys });
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(row) = self.rows.remove(id) else {
            return false;
        };
        self.order.remove(&row.seq);
        self.remove_from_indexes(row.seq, &row.keys);
        true
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.order.clear();
        self.rebuild_indexes();
    }

    pub fn get(&self, id: &str) -> Option<&serde_json::Value> {
        self.rows.get(id).map(|row| &row.doc)
    }

    /// Documents in insertion order.
    pub fn scan(&self) -> Vec<&serde_json::Value> {
        self.order
            .values()
            .filter_map(|id| self.rows.get(id).map(|row| &row.doc))
            .collect()
    }

    /// Documents matching `query`, ordered by index key then insertion order.
    pub fn lookup(
        &self,
        index: &str,
        query: &IndexQuery,
    ) -> std::result::Result<Vec<&serde_json::Value>, StorageFault> {
        let tree = self
            .indexes
            .get(index)
            .ok_or_else(|| StorageFault::UnknownIndex {
                collection: self.name.to_string(),
                index: index.to_string(),
            })?;

        let seqs: Vec<u64> = match query {
            IndexQuery::Eq(value) => tree
                .get(value)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            IndexQuery::Range { .. } if query.is_empty_range() => Vec::new(),
            IndexQuery::Range { lower, upper } => tree
                .range((lower.clone(), upper.clone()))
                .flat_map(|(_, set)| set.iter().copied())
                .collect(),
        };

        Ok(seqs
            .into_iter()
            .filter_map(|seq| self.order.get(&seq))
            .filter_map(|id| self.rows.get(id).map(|row| &row.doc))
            .collect())
    }

    pub fn rebuild_indexes(&mut self) {
        self.indexes = self
            .name
            .indexes()
            .iter()
            .map(|index| (index.to_string(), BTreeMap::new()))
            .collect();
        let rows: Vec<(u64, BTreeMap<String, IndexValue>)> = self
            .rows
            .values()
            .map(|row| (row.seq, row.keys.clone()))
            .collect();
        for (seq, keys) in rows {
            self.update_indexes(seq, &keys);
        }
    }

    fn update_indexes(&mut self, seq: u64, keys: &BTreeMap<String, IndexValue>) {
        for (index_name, index) in &mut self.indexes {
            if let Some(value) = keys.get(index_name) {
                index.entry(value.clone()).or_default().insert(seq);
            }
        }
    }

    fn remove_from_indexes(&mut self, seq: u64, keys: &BTreeMap<String, IndexValue>) {
        for (index_name, index) in &mut self.indexes {
            if let Some(value) = keys.get(index_name) {
                if let Some(seqs) = index.get_mut(value) {
                    seqs.remove(&seq);
                    if seqs.is_empty() {
                        index.remove(value);
                    }
                }
            }
        }
    }
}

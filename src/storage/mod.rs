pub mod collection;
pub mod persistence;
pub mod store;

pub use collection::{Collection, CollectionName, Record};
pub use persistence::{DurabilityMode, JournalOp, JournalRecord, PersistenceManager};
pub use store::{DurableStore, StoreResult, StoreStats};

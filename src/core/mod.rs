pub mod error;
pub mod types;
pub mod value;

pub use error::{DispatchFault, Result, StorageFault, SyncError};
pub use types::{Budget, EXPENSE_CATEGORIES, EntityType, Expense, OutboxEntry, SyncAction, YearMonth};
pub use value::{IndexQuery, IndexValue};

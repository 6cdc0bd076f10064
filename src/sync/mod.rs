pub mod coordinator;

pub use coordinator::{SyncCoordinator, SyncOutcome, SyncPhase, SyncStats, TriggerReason};

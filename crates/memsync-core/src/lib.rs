//! Memory manager and synchronization primitives for memsync.
//!
//! This crate owns the store registry, the transaction coordinator, the
//! synchronization engine, the propagation queue and the query router that
//! together sit on top of the `memsync-store` adapters.

pub mod builder;
pub mod error;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod router;
pub mod sync;
pub mod transaction;

pub use builder::build_store;
pub use error::SyncError;
/// Memory manager facade.
pub use manager::MemoryManager;
/// Propagation queue and its flush reports.
pub use queue::{FanOutFailure, FlushFailure, FlushReport, PropagationQueue};
pub use registry::StoreRegistry;
pub use retry::retry_with_backoff;
/// Query routing strategies.
pub use router::{QueryCache, QueryRouter, QueryStrategy, RouteRequest, RouteResponse};
/// Synchronization engine and conflict resolution.
pub use sync::{
    ApplyOutcome, ConflictRecord, DirectionReport, Resolution, SyncEngine, SyncReport, SyncStats,
    resolve,
};
pub use transaction::{TransactionCoordinator, TransactionScope};

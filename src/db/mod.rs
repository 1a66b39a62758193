//! Time-series database layer: connection pool, snapshot store (C5) and
//! validator directory (C6).

pub mod directory;
pub mod pool;
pub mod snapshot_store;

pub use directory::ValidatorDirectory;
pub use pool::DbPool;
pub use snapshot_store::SnapshotStore;

//! Shard management for the retrieval node.
//!
//! A shard is the indexed content of one piece. [`DagStore`] owns shard
//! state transitions (register, acquire, recover, destroy, gc) and persists
//! them through [`wharf_meta::MetaStore`]. [`DagStoreWrapper`] adapts it to
//! the retrieval flow: pieces in, read-only blockstores out, with lazy
//! registration, retry-on-unknown, recovery gating and the GC and recovery
//! background loops.
//!
//! Shard data is reached through [`Mount`]s resolved by a [`MountRegistry`]
//! from `scheme://...` URLs.

pub mod blockstore;
pub mod error;
pub mod index;
pub mod mount;
pub mod store;
pub mod wrapper;

pub use blockstore::{ReadOnlyBlockstore, ShardAccessor};
pub use error::DagStoreError;
pub use index::{Chunker, ShardIndex, TopIndex};
pub use mount::{
    FileMount, FileMountFactory, MARKET_SCHEME, Mount, MountFactory, MountRegistry, MountStat,
    PieceMount, PieceMountFactory,
};
pub use store::{DagStore, DagStoreConfig, RegisterOpts, ShardFailure, ShardInfo, ShardResult};
pub use wrapper::{DagStoreWrapper, WrapperConfig};

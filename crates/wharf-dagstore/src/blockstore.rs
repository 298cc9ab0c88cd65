//! Read-only access to acquired shards.

use std::sync::Arc;

use bytes::Bytes;
use wharf_types::{BlockHash, ShardKey};

use crate::error::DagStoreError;
use crate::index::ShardIndex;
use crate::mount::{Mount, MountStat};
use crate::store::ShardRef;

/// Block-level view of one shard's data.
#[derive(Clone)]
pub struct ReadOnlyBlockstore {
    key: ShardKey,
    data: Bytes,
    index: Arc<ShardIndex>,
}

impl ReadOnlyBlockstore {
    pub(crate) fn new(key: ShardKey, data: Bytes, index: Arc<ShardIndex>) -> Self {
        Self { key, data, index }
    }

    /// Shard this view reads from.
    pub fn shard(&self) -> &ShardKey {
        &self.key
    }

    /// True if the shard's index lists `hash`.
    pub fn has(&self, hash: &BlockHash) -> bool {
        self.index.locate(hash).is_some()
    }

    /// Returns the block's bytes as a zero-copy slice of the shard data.
    /// Fails with [`DagStoreError::BlockNotFound`] when the block is not indexed
    /// or its recorded location runs past the end of the data.
    pub fn get(&self, hash: &BlockHash) -> Result<Bytes, DagStoreError> {
        let loc = self
            .index
            .locate(hash)
            .ok_or(DagStoreError::BlockNotFound(*hash))?;
        let start = loc.offset as usize;
        let end = start + loc.len as usize;
        if end > self.data.len() {
            return Err(DagStoreError::BlockNotFound(*hash));
        }
        Ok(self.data.slice(start..end))
    }

    /// Length of a block in bytes, answered from the index alone.
    pub fn get_size(&self, hash: &BlockHash) -> Result<u32, DagStoreError> {
        self.index
            .locate(hash)
            .map(|loc| loc.len)
            .ok_or(DagStoreError::BlockNotFound(*hash))
    }

    /// Every block hash in shard order. Repeated blocks are listed each time.
    pub fn hashes(&self) -> Vec<BlockHash> {
        self.index.hashes().collect()
    }

    /// Total payload bytes in the shard.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl std::fmt::Debug for ReadOnlyBlockstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyBlockstore")
            .field("shard", &self.key)
            .field("blocks", &self.index.len())
            .finish()
    }
}

/// A live handle on an acquired shard. The shard stays `Serving` until every
/// accessor is closed or dropped.
pub struct ShardAccessor {
    blockstore: ReadOnlyBlockstore,
    mount: Arc<dyn Mount>,
    _ref: ShardRef,
}

impl ShardAccessor {
    pub(crate) fn new(
        blockstore: ReadOnlyBlockstore,
        mount: Arc<dyn Mount>,
        shard_ref: ShardRef,
    ) -> Self {
        Self {
            blockstore,
            mount,
            _ref: shard_ref,
        }
    }

    /// Key of the acquired shard.
    pub fn key(&self) -> &ShardKey {
        self.blockstore.shard()
    }

    /// A blockstore over the shard. It stays readable after the accessor is
    /// closed, but the shard no longer counts it as a reference.
    pub fn blockstore(&self) -> ReadOnlyBlockstore {
        self.blockstore.clone()
    }

    /// Stat of the underlying mount.
    pub async fn stat(&self) -> Result<MountStat, DagStoreError> {
        self.mount.stat().await
    }

    /// Release the shard.
    pub fn close(self) {}
}

impl std::fmt::Debug for ShardAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardAccessor")
            .field("shard", self.key())
            .finish()
    }
}

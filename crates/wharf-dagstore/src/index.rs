//! Block indexing.
//!
//! [`Chunker`] splits shard data into fixed-size blocks addressed by
//! `blake3(block)`. [`ShardIndex`] answers "where is block X in this shard",
//! and [`TopIndex`] answers "which shards contain block X" across the node.

use std::collections::HashMap;
use std::sync::Arc;

use wharf_meta::MetaStore;
use wharf_types::{BlockHash, BlockLocation, ShardKey};

use crate::error::DagStoreError;

/// Fixed-size block splitter.
///
/// The last block may be shorter than `block_size`. Empty data produces no
/// blocks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    block_size: u32,
}

impl Chunker {
    /// A zero block size is treated as 1.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Split `data` and return the location of every block, in order.
    pub fn index(&self, data: &[u8]) -> Vec<BlockLocation> {
        let mut blocks = Vec::with_capacity(data.len() / self.block_size as usize + 1);
        let mut offset = 0u64;
        for slice in data.chunks(self.block_size as usize) {
            blocks.push(BlockLocation {
                hash: BlockHash::from_data(slice),
                offset,
                len: slice.len() as u32,
            });
            offset += slice.len() as u64;
        }
        blocks
    }
}

/// Block lookup table for one shard.
#[derive(Debug, Clone, Default)]
pub struct ShardIndex {
    blocks: Vec<BlockLocation>,
    by_hash: HashMap<BlockHash, usize>,
}

impl ShardIndex {
    pub fn new(blocks: Vec<BlockLocation>) -> Self {
        let mut by_hash = HashMap::with_capacity(blocks.len());
        for (i, b) in blocks.iter().enumerate() {
            // Duplicate blocks resolve to their first occurrence.
            by_hash.entry(b.hash).or_insert(i);
        }
        Self { blocks, by_hash }
    }

    /// Where `hash` first appears in the shard.
    pub fn locate(&self, hash: &BlockHash) -> Option<&BlockLocation> {
        self.by_hash.get(hash).map(|&i| &self.blocks[i])
    }

    pub fn hashes(&self) -> impl Iterator<Item = BlockHash> + '_ {
        self.blocks.iter().map(|b| b.hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Node-wide multihash → shard keys index.
#[derive(Clone)]
pub struct TopIndex {
    meta: Arc<MetaStore>,
}

impl TopIndex {
    /// Index over the `top_index` table of `meta`.
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Store `shard`'s block index and add the shard to every block's
    /// top-index entry in a single write. Readers see all of it or none.
    pub fn add_shard_blocks(
        &self,
        shard: &ShardKey,
        blocks: &[BlockLocation],
    ) -> Result<usize, DagStoreError> {
        Ok(self.meta.put_shard_blocks(shard, blocks)?)
    }

    /// Record that `shard` contains every hash in `hashes`.
    pub fn add_multihashes_for_shard<I>(
        &self,
        hashes: I,
        shard: &ShardKey,
    ) -> Result<usize, DagStoreError>
    where
        I: IntoIterator<Item = BlockHash>,
    {
        Ok(self.meta.add_multihashes_for_shard(hashes, shard)?)
    }

    /// Shards containing `hash`, or [`DagStoreError::BlockNotFound`].
    pub fn get_shards_for_multihash(
        &self,
        hash: &BlockHash,
    ) -> Result<Vec<ShardKey>, DagStoreError> {
        let shards = self.meta.get_shards_for_multihash(hash)?;
        if shards.is_empty() {
            return Err(DagStoreError::BlockNotFound(*hash));
        }
        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_empty_data() {
        assert!(Chunker::new(16).index(b"").is_empty());
    }

    #[test]
    fn test_chunker_offsets_and_tail() {
        let data = vec![7u8; 40];
        let blocks = Chunker::new(16).index(&data);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 16);
        assert_eq!(blocks[2].offset, 32);
        assert_eq!(blocks[2].len, 8);
        // Identical full blocks share a hash.
        assert_eq!(blocks[0].hash, blocks[1].hash);
        assert_ne!(blocks[1].hash, blocks[2].hash);
    }

    #[test]
    fn test_shard_index_locate_first_duplicate() {
        let blocks = Chunker::new(4).index(b"aaaaaaaabbbb");
        let index = ShardIndex::new(blocks);
        let a = BlockHash::from_data(b"aaaa");
        assert_eq!(index.locate(&a).unwrap().offset, 0);
        assert_eq!(index.locate(&BlockHash::from_data(b"bbbb")).unwrap().offset, 8);
        assert!(index.locate(&BlockHash::from_data(b"zzzz")).is_none());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_top_index_not_found_is_distinct() {
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let top = TopIndex::new(meta);
        let h = BlockHash::from_data(b"x");
        let err = top.get_shards_for_multihash(&h).unwrap_err();
        assert!(matches!(err, DagStoreError::BlockNotFound(got) if got == h));
        assert!(err.is_not_found());

        let key = ShardKey::new("s");
        assert_eq!(top.add_multihashes_for_shard([h], &key).unwrap(), 1);
        assert_eq!(top.get_shards_for_multihash(&h).unwrap(), vec![key]);
    }

    #[test]
    fn test_add_shard_blocks_writes_both_indices() {
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let top = TopIndex::new(meta.clone());
        let key = ShardKey::new("both");
        let blocks = Chunker::new(4).index(b"aaaabbbbcc");

        assert_eq!(top.add_shard_blocks(&key, &blocks).unwrap(), 3);
        assert_eq!(meta.get_shard_index(&key).unwrap(), Some(blocks.clone()));
        for block in &blocks {
            assert_eq!(top.get_shards_for_multihash(&block.hash).unwrap(), vec![key.clone()]);
        }
    }
}

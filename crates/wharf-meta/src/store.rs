//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::collections::BTreeSet;
use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch};
use tempfile::TempDir;
use tracing::debug;
use wharf_types::{
    Address, BlockHash, BlockLocation, DealId, MinerDeal, PayloadCid, PeerId, PieceCid,
    ProposalCid, ProviderDealIdentifier, ProviderDealState, RetrievalAsk, ShardKey, ShardRecord,
};

use crate::{MetaError, codec, migrate};

type Result<T> = std::result::Result<T, MetaError>;

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const EMPTY: &[u8] = &[];

/// Metadata store backed by Fjall.
pub struct MetaStore {
    db: Database,
    /// ShardKey → ShardRecord.
    shards: Keyspace,
    /// ShardKey → Vec<BlockLocation>.
    shard_indices: Keyspace,
    /// BlockHash ++ ShardKey → empty.
    top_index: Keyspace,
    /// receiver ++ deal id (8 bytes BE) → ProviderDealState.
    retrieval_deals: Keyspace,
    /// Address → RetrievalAsk.
    asks: Keyspace,
    /// ProposalCid → MinerDeal.
    storage_deals: Keyspace,
    /// PayloadCid ++ ProposalCid → empty.
    payload_index: Keyspace,
    /// PieceCid ++ ProposalCid → empty.
    piece_index: Keyspace,
    /// Store-level markers.
    meta: Keyspace,
    /// Keeps the backing directory alive for temporary stores.
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path, applying any pending
    /// schema migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path.as_ref()).open()?;
        let store = Self::init_keyspaces(db, None)?;
        migrate::run(&store, migrate::MIGRATIONS)?;
        Ok(store)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        let store = Self::init_keyspaces(db, Some(tmp))?;
        migrate::run(&store, migrate::MIGRATIONS)?;
        Ok(store)
    }

    fn init_keyspaces(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let shards = db.keyspace("shards", KeyspaceCreateOptions::default)?;
        let shard_indices = db.keyspace("shard_indices", KeyspaceCreateOptions::default)?;
        let top_index = db.keyspace("top_index", KeyspaceCreateOptions::default)?;
        let retrieval_deals = db.keyspace("retrieval_deals", KeyspaceCreateOptions::default)?;
        let asks = db.keyspace("asks", KeyspaceCreateOptions::default)?;
        let storage_deals = db.keyspace("storage_deals", KeyspaceCreateOptions::default)?;
        let payload_index = db.keyspace("payload_index", KeyspaceCreateOptions::default)?;
        let piece_index = db.keyspace("piece_index", KeyspaceCreateOptions::default)?;
        let meta = db.keyspace("meta", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            shards,
            shard_indices,
            top_index,
            retrieval_deals,
            asks,
            storage_deals,
            payload_index,
            piece_index,
            meta,
            _tmp: tmp,
        })
    }

    // ----- Schema marker -----

    /// Schema version the store was last migrated to (0 for a fresh store).
    pub fn schema_version(&self) -> Result<u32> {
        match self.meta.get(SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| MetaError::Corrupt("schema version marker".into()))?;
                Ok(u32::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Record the schema version. Only migrations call this.
    pub fn set_schema_version(&self, version: u32) -> Result<()> {
        self.meta
            .insert(SCHEMA_VERSION_KEY, version.to_be_bytes().as_slice())?;
        Ok(())
    }

    // ----- Shards -----

    /// Insert or overwrite a shard record.
    pub fn put_shard(&self, record: &ShardRecord) -> Result<()> {
        let value = codec::encode(record)?;
        self.shards
            .insert(record.key.as_str().as_bytes(), value.as_slice())?;
        debug!(key = %record.key, state = %record.state, "stored shard record");
        Ok(())
    }

    /// Returns `None` for an unregistered shard.
    pub fn get_shard(&self, key: &ShardKey) -> Result<Option<ShardRecord>> {
        match self.shards.get(key.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_shards(&self) -> Result<Vec<ShardRecord>> {
        let mut records = Vec::new();
        for guard in self.shards.iter() {
            let v = guard.value()?;
            records.push(codec::decode(&v)?);
        }
        Ok(records)
    }

    /// Remove a shard record and its block index. Content-index entries are
    /// additive and stay behind.
    pub fn delete_shard(&self, key: &ShardKey) -> Result<()> {
        self.shards.remove(key.as_str().as_bytes())?;
        self.shard_indices.remove(key.as_str().as_bytes())?;
        debug!(%key, "deleted shard record");
        Ok(())
    }

    // ----- Per-shard block index -----

    /// Store a shard's block index and add the shard to the top-index entry
    /// of every block, as one atomic write. Returns the number of blocks.
    pub fn put_shard_blocks(&self, key: &ShardKey, blocks: &[BlockLocation]) -> Result<usize> {
        self.shard_blocks_batch(key, blocks)?.commit()?;
        debug!(%key, blocks = blocks.len(), "stored shard index");
        Ok(blocks.len())
    }

    fn shard_blocks_batch(
        &self,
        key: &ShardKey,
        blocks: &[BlockLocation],
    ) -> Result<OwnedWriteBatch> {
        let mut batch = self.db.batch();
        batch.insert(
            &self.shard_indices,
            key.as_str().as_bytes(),
            codec::encode(&blocks)?,
        );
        for block in blocks {
            let top_key = composite_key(block.hash.as_bytes(), key.as_str().as_bytes());
            batch.insert(&self.top_index, top_key, EMPTY);
        }
        Ok(batch)
    }

    /// The block index of `key`, if it was ever indexed.
    pub fn get_shard_index(&self, key: &ShardKey) -> Result<Option<Vec<BlockLocation>>> {
        match self.shard_indices.get(key.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ----- Top index (block hash → shard keys) -----

    /// Add `shard` to the key set of every hash in `hashes`, in one write
    /// batch. Existing entries are left untouched, so repeated calls are
    /// harmless.
    pub fn add_multihashes_for_shard<I>(&self, hashes: I, shard: &ShardKey) -> Result<usize>
    where
        I: IntoIterator<Item = BlockHash>,
    {
        let mut batch = self.db.batch();
        let mut count = 0;
        for hash in hashes {
            let key = composite_key(hash.as_bytes(), shard.as_str().as_bytes());
            batch.insert(&self.top_index, key, EMPTY);
            count += 1;
        }
        batch.commit()?;
        debug!(%shard, hashes = count, "added multihashes to top index");
        Ok(count)
    }

    /// All shards known to contain `hash`; empty when the hash is unknown.
    pub fn get_shards_for_multihash(&self, hash: &BlockHash) -> Result<Vec<ShardKey>> {
        let mut keys = BTreeSet::new();
        for guard in self.top_index.prefix(hash.as_bytes()) {
            let k = guard.key()?;
            let suffix = &k[32..];
            let shard = std::str::from_utf8(suffix)
                .map_err(|_| MetaError::Corrupt("top index shard key".into()))?;
            keys.insert(ShardKey::new(shard));
        }
        Ok(keys.into_iter().collect())
    }

    // ----- Retrieval deals -----

    pub fn put_retrieval_deal(&self, deal: &ProviderDealState) -> Result<()> {
        let key = deal_key(&deal.identifier());
        let value = codec::encode(deal)?;
        self.retrieval_deals.insert(key.as_slice(), value.as_slice())?;
        debug!(deal = %deal.identifier(), status = %deal.status, "stored retrieval deal");
        Ok(())
    }

    pub fn get_retrieval_deal(
        &self,
        id: &ProviderDealIdentifier,
    ) -> Result<Option<ProviderDealState>> {
        match self.retrieval_deals.get(deal_key(id).as_slice())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored retrieval deal, terminal ones included.
    pub fn list_retrieval_deals(&self) -> Result<Vec<ProviderDealState>> {
        let mut deals = Vec::new();
        for guard in self.retrieval_deals.iter() {
            let v = guard.value()?;
            deals.push(codec::decode(&v)?);
        }
        Ok(deals)
    }

    /// Deals opened by one receiver, ordered by deal id.
    pub fn list_retrieval_deals_for(&self, receiver: &PeerId) -> Result<Vec<ProviderDealState>> {
        let mut deals = Vec::new();
        for guard in self.retrieval_deals.prefix(receiver.as_bytes()) {
            let v = guard.value()?;
            deals.push(codec::decode(&v)?);
        }
        Ok(deals)
    }

    // ----- Asks -----

    /// Replace the ask stored for `provider`.
    pub fn put_ask(&self, provider: &Address, ask: &RetrievalAsk) -> Result<()> {
        let value = codec::encode(ask)?;
        self.asks.insert(provider.as_bytes(), value.as_slice())?;
        debug!(%provider, price_per_byte = %ask.price_per_byte, "stored retrieval ask");
        Ok(())
    }

    pub fn get_ask(&self, provider: &Address) -> Result<Option<RetrievalAsk>> {
        match self.asks.get(provider.as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ----- Storage deals -----

    /// Store a storage deal and index it by payload and piece.
    pub fn put_miner_deal(&self, deal: &MinerDeal) -> Result<()> {
        let value = codec::encode(deal)?;
        let proposal = deal.proposal_cid.as_bytes();
        self.storage_deals.insert(proposal, value.as_slice())?;
        self.payload_index.insert(
            composite_key(deal.payload_cid.as_bytes(), proposal).as_slice(),
            EMPTY,
        )?;
        self.index_piece(deal)?;
        debug!(proposal = %deal.proposal_cid, piece = %deal.piece_cid, "stored storage deal");
        Ok(())
    }

    /// Add `deal` to the piece index.
    pub(crate) fn index_piece(&self, deal: &MinerDeal) -> Result<()> {
        self.piece_index.insert(
            composite_key(deal.piece_cid.as_bytes(), deal.proposal_cid.as_bytes()).as_slice(),
            EMPTY,
        )?;
        Ok(())
    }

    pub fn get_miner_deal(&self, proposal: &ProposalCid) -> Result<Option<MinerDeal>> {
        match self.storage_deals.get(proposal.as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_miner_deals(&self) -> Result<Vec<MinerDeal>> {
        let mut deals = Vec::new();
        for guard in self.storage_deals.iter() {
            let v = guard.value()?;
            deals.push(codec::decode(&v)?);
        }
        Ok(deals)
    }

    /// Storage deals whose data contains `payload`.
    pub fn deals_for_payload(&self, payload: &PayloadCid) -> Result<Vec<MinerDeal>> {
        self.resolve_index(&self.payload_index, payload.as_bytes())
    }

    /// Storage deals for `piece`. Several deals may store the same piece.
    pub fn deals_for_piece(&self, piece: &PieceCid) -> Result<Vec<MinerDeal>> {
        self.resolve_index(&self.piece_index, piece.as_bytes())
    }

    /// Load the deals listed under `prefix`. Entries whose deal has since been
    /// removed are skipped.
    fn resolve_index(&self, index: &Keyspace, prefix: &[u8; 32]) -> Result<Vec<MinerDeal>> {
        let mut deals = Vec::new();
        for guard in index.prefix(prefix) {
            let k = guard.key()?;
            let proposal = id_suffix(&k)?;
            if let Some(deal) = self.get_miner_deal(&ProposalCid::from(proposal))? {
                deals.push(deal);
            }
        }
        Ok(deals)
    }

    #[cfg(test)]
    pub(crate) fn piece_index_len(&self) -> Result<usize> {
        let mut count = 0;
        for guard in self.piece_index.iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn clear_piece_index(&self) -> Result<()> {
        let mut keys = Vec::new();
        for guard in self.piece_index.iter() {
            keys.push(guard.key()?);
        }
        for k in keys {
            self.piece_index.remove(k)?;
        }
        Ok(())
    }
}

/// `prefix (32 bytes) ++ suffix`.
fn composite_key(prefix: &[u8; 32], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

/// Build the retrieval deal key: `receiver (32 bytes) ++ deal_id (8 bytes BE)`.
///
/// Big-endian keeps one receiver's deals sorted by id.
fn deal_key(id: &ProviderDealIdentifier) -> Vec<u8> {
    let DealId(n) = id.deal_id;
    composite_key(id.receiver.as_bytes(), &n.to_be_bytes())
}

fn id_suffix(key: &[u8]) -> Result<[u8; 32]> {
    key.get(32..64)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| MetaError::Corrupt("index key too short".into()))
}

//! Metadata persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over the node's keyspaces. Unlike a
//! cache, everything here is the source of truth for the node:
//!
//! - `shards`: [`ShardKey`](wharf_types::ShardKey) → [`ShardRecord`](wharf_types::ShardRecord)
//! - `shard_indices`: shard key → block locations inside the shard
//! - `top_index`: block hash ++ shard key → `()` (set-valued content index)
//! - `retrieval_deals`: receiver ++ deal id →
//!   [`ProviderDealState`](wharf_types::ProviderDealState)
//! - `asks`: provider address → [`RetrievalAsk`](wharf_types::RetrievalAsk)
//! - `storage_deals`: proposal cid → [`MinerDeal`](wharf_types::MinerDeal)
//! - `payload_index` / `piece_index`: secondary indexes over `storage_deals`
//! - `meta`: schema version marker
//!
//! Values are postcard-encoded behind a one-byte format version (see
//! [`codec`]). Schema upgrades run at open time (see [`migrate`]).

pub mod codec;
mod error;
pub mod migrate;
mod piece_index;
mod store;

pub use error::MetaError;
pub use piece_index::PieceIndex;
pub use store::MetaStore;

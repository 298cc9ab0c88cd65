use wharf_types::{MinerDeal, PayloadCid, PieceCid};

use crate::{MetaError, MetaStore};

/// Lookup of the storage deals that hold a payload or piece.
pub trait PieceIndex: Send + Sync {
    fn deals_for_payload(&self, payload: &PayloadCid) -> Result<Vec<MinerDeal>, MetaError>;

    fn deals_for_piece(&self, piece: &PieceCid) -> Result<Vec<MinerDeal>, MetaError>;
}

impl PieceIndex for MetaStore {
    fn deals_for_payload(&self, payload: &PayloadCid) -> Result<Vec<MinerDeal>, MetaError> {
        MetaStore::deals_for_payload(self, payload)
    }

    fn deals_for_piece(&self, piece: &PieceCid) -> Result<Vec<MinerDeal>, MetaError> {
        MetaStore::deals_for_piece(self, piece)
    }
}

//! Error types for the retrieval provider.

use wharf_types::{ChannelId, DealStatus, PayloadCid, ProviderDealIdentifier, VoucherError};

use crate::tracker::TrackerError;
use crate::transfer::TransferError;

/// Errors returned by the retrieval provider.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval deal not found: {0}")]
    DealNotFound(ProviderDealIdentifier),

    /// No retrieval deal is bound to this data-transfer channel.
    #[error("no deal for channel {0}")]
    UnknownChannel(ChannelId),

    /// No storage deal makes the payload retrievable.
    #[error("no storage deals found for payload {0}")]
    NoDealsForPayload(PayloadCid),

    /// Terminal deals never change status again.
    #[error("deal {deal} is already {status}")]
    TerminalDeal {
        deal: ProviderDealIdentifier,
        status: DealStatus,
    },

    /// A persisted counter would go backwards.
    #[error("deal {deal}: {field} cannot decrease")]
    AccountingRegression {
        deal: ProviderDealIdentifier,
        field: &'static str,
    },

    /// The pricing function or its inputs failed.
    #[error("pricing failed: {0}")]
    Pricing(String),

    #[error("payment channel error: {0}")]
    Payment(String),

    #[error(transparent)]
    Voucher(#[from] VoucherError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("metadata error: {0}")]
    Meta(#[from] wharf_meta::MetaError),

    #[error("dagstore error: {0}")]
    DagStore(#[from] wharf_dagstore::DagStoreError),

    #[error("piece error: {0}")]
    Piece(#[from] wharf_piece::PieceError),
}

impl RetrievalError {
    /// True when a deal, channel or blockstore lookup found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DealNotFound(_) | Self::UnknownChannel(_) | Self::NoDealsForPayload(_)
        ) || matches!(self, Self::Tracker(TrackerError::NotFound(_)))
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

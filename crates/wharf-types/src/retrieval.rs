//! Retrieval-market records: deal proposals, payments, responses, provider
//! deal state, asks, storage-deal index entries and the query protocol.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Address, PayloadCid, PeerId, PieceCid, ProposalCid, TokenAmount};

/// Byte encoding of the default "explore all" selector. A proposal that
/// declares no selector must be matched against exactly these bytes.
pub const ALL_SELECTOR_BYTES: &[u8] = &[
    0xa1, 0x61, 0x52, 0xa2, 0x61, 0x6c, 0xa1, 0x64, 0x6e, 0x6f, 0x6e, 0x65, 0xa0, 0x62, 0x3a,
    0x3e, 0xa1, 0x61, 0x61, 0xa1, 0x61, 0x3e, 0xa1, 0x61, 0x40, 0xa0,
];

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Client-chosen retrieval deal number, unique per client peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DealId(pub u64);

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one data-transfer channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChannelId {
    /// Peer that opened the channel. For retrievals this is the client.
    pub initiator: PeerId,
    /// The provider.
    pub responder: PeerId,
    /// Sequence number assigned by the initiator.
    pub id: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.initiator, self.responder, self.id)
    }
}

/// Primary key of a provider-side retrieval deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProviderDealIdentifier {
    /// Client the deal's data is sent to.
    pub receiver: PeerId,
    pub deal_id: DealId,
}

impl fmt::Display for ProviderDealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.receiver, self.deal_id)
    }
}

// ---------------------------------------------------------------------------
// Deal status
// ---------------------------------------------------------------------------

/// Status of a retrieval deal as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealStatus {
    /// Proposal received but not yet checked.
    New,
    /// The backing shard is being loaded.
    Unsealing,
    /// Shard loaded and the channel resumed.
    Unsealed,
    /// Waiting for the client to pay the unseal price.
    FundsNeededUnseal,
    Accepted,
    /// Blocks are flowing and paid up to the current interval.
    Ongoing,
    /// Paused until the client pays for the current interval.
    FundsNeeded,
    /// All blocks sent, waiting for the final payment.
    FundsNeededLastPayment,
    BlocksComplete,
    /// Fully paid. Waiting for the transport to report completion.
    Finalizing,
    Completed,
    /// The proposal was refused. The response message says why.
    Rejected,
    /// The proposal named a payload this provider does not have.
    DealNotFound,
    Errored,
    Cancelling,
    Cancelled,
}

impl DealStatus {
    /// A terminal deal never changes status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Proposal / response / payment
// ---------------------------------------------------------------------------

/// Terms proposed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealParams {
    /// Encoded selector; `None` means "explore all".
    pub selector: Option<Vec<u8>>,
    pub piece_cid: Option<PieceCid>,
    /// Price charged for every byte sent.
    pub price_per_byte: TokenAmount,
    /// Bytes sent before the first payment is due.
    pub payment_interval: u64,
    /// Growth of each following interval, in bytes.
    pub payment_interval_increase: u64,
    /// Paid up front when the piece has no unsealed copy.
    pub unseal_price: TokenAmount,
}

impl DealParams {
    /// Selector bytes the pull request must match.
    pub fn selector_bytes(&self) -> &[u8] {
        self.selector.as_deref().unwrap_or(ALL_SELECTOR_BYTES)
    }

    /// Returns `(lower, upper)` for the payment interval containing
    /// `current`. Interval sizes grow by `payment_interval_increase` each step.
    pub fn interval_bounds(&self, current: u64) -> (u64, u64) {
        let mut size = self.payment_interval;
        let mut lower = 0u64;
        let mut target = 0u64;
        while target <= current {
            if size == 0 {
                return (target, u64::MAX);
            }
            lower = target;
            target = target.saturating_add(size);
            size = size.saturating_add(self.payment_interval_increase);
            if target == u64::MAX {
                break;
            }
        }
        (lower, target)
    }

    /// First interval boundary strictly above `current`.
    pub fn next_interval(&self, current: u64) -> u64 {
        self.interval_bounds(current).1
    }
}

/// Client's retrieval deal proposal, carried as the opening voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    /// Chosen by the client, unique per client peer.
    pub id: DealId,
    /// Root of the data being retrieved.
    pub payload_cid: PayloadCid,
    pub params: DealParams,
}

/// Provider's answer to a proposal or payment, sent as a voucher result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealResponse {
    pub id: DealId,
    pub status: DealStatus,
    pub payment_owed: TokenAmount,
    pub message: String,
}

impl DealResponse {
    /// Response with nothing owed and no message.
    pub fn new(id: DealId, status: DealStatus) -> Self {
        Self {
            id,
            status,
            payment_owed: TokenAmount::ZERO,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the amount the client must pay before the transfer continues.
    pub fn with_owed(mut self, owed: TokenAmount) -> Self {
        self.payment_owed = owed;
        self
    }
}

/// Payment-channel voucher as signed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoucher {
    pub channel_addr: Address,
    /// Lane within the channel. Each lane tracks its own redeemed amount.
    pub lane: u64,
    /// Must increase on every voucher for the same lane.
    pub nonce: u64,
    /// Cumulative amount redeemable on this lane.
    pub amount: TokenAmount,
    pub signature: Vec<u8>,
}

/// Client payment for a retrieval deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealPayment {
    pub id: DealId,
    /// Channel the voucher draws from.
    pub payment_channel: Address,
    pub payment_voucher: SignedVoucher,
}

// ---------------------------------------------------------------------------
// Vouchers
// ---------------------------------------------------------------------------

/// A typed payload exchanged over a data-transfer channel.
pub trait VoucherType: Serialize + DeserializeOwned {
    const TYPE_ID: &'static str;
}

impl VoucherType for DealProposal {
    const TYPE_ID: &'static str = "RetrievalDealProposal/1";
}

impl VoucherType for DealPayment {
    const TYPE_ID: &'static str = "RetrievalDealPayment/1";
}

impl VoucherType for DealResponse {
    const TYPE_ID: &'static str = "RetrievalDealResponse/1";
}

/// Proposal sent by clients speaking the previous protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyDealProposal(pub DealProposal);

impl VoucherType for LegacyDealProposal {
    const TYPE_ID: &'static str = "RetrievalDealProposal/0";
}

/// Payment sent by clients speaking the previous protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyDealPayment(pub DealPayment);

impl VoucherType for LegacyDealPayment {
    const TYPE_ID: &'static str = "RetrievalDealPayment/0";
}

/// Response to a legacy client, tagged with the old type id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyDealResponse(pub DealResponse);

impl VoucherType for LegacyDealResponse {
    const TYPE_ID: &'static str = "RetrievalDealResponse/0";
}

/// Failure to decode a [`Voucher`] into a concrete type.
#[derive(Debug, thiserror::Error)]
pub enum VoucherError {
    #[error("wrong voucher type: expected {expected}, got {actual}")]
    WrongVoucherType {
        expected: &'static str,
        actual: String,
    },
    #[error("voucher codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Type-tagged, encoded voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub type_id: String,
    pub data: Vec<u8>,
}

impl Voucher {
    /// Serialize `value` and tag it with its type id.
    pub fn encode<T: VoucherType>(value: &T) -> Result<Self, VoucherError> {
        Ok(Self {
            type_id: T::TYPE_ID.to_string(),
            data: postcard::to_allocvec(value)?,
        })
    }

    /// True if this voucher carries a `T`.
    pub fn is<T: VoucherType>(&self) -> bool {
        self.type_id == T::TYPE_ID
    }

    /// Decode the payload, refusing a voucher tagged with another type.
    pub fn decode<T: VoucherType>(&self) -> Result<T, VoucherError> {
        if !self.is::<T>() {
            return Err(VoucherError::WrongVoucherType {
                expected: T::TYPE_ID,
                actual: self.type_id.clone(),
            });
        }
        Ok(postcard::from_bytes(&self.data)?)
    }
}

// ---------------------------------------------------------------------------
// Provider deal state
// ---------------------------------------------------------------------------

/// Where a piece sits inside a sealed sector, per storage deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceDealInfo {
    pub proposal_cid: ProposalCid,
    pub sector: u64,
    /// Byte offset of the piece within the sector.
    pub offset: u64,
    pub length: u64,
}

/// The piece backing a retrieval deal and the storage deals that hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub piece_cid: PieceCid,
    pub deals: Vec<PieceDealInfo>,
}

/// Provider-side record of one retrieval deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDealState {
    pub proposal: DealProposal,
    pub receiver: PeerId,
    pub status: DealStatus,
    /// Set once the pull request that opened the deal has been validated.
    pub channel_id: Option<ChannelId>,
    /// Resolved while validating the proposal.
    pub piece_info: Option<PieceInfo>,
    /// Bytes queued for sending so far.
    pub total_sent: u64,
    /// Sum of every voucher amount credited to this deal.
    pub funds_received: TokenAmount,
    /// Byte count at which the next payment falls due.
    pub current_interval: u64,
    /// Last error or rejection reason, empty otherwise.
    pub message: String,
    /// Storage deal picked to serve the piece, when more than one holds it.
    pub sel_storage_proposal_cid: Option<ProposalCid>,
    /// The client proposed with the previous protocol version, so every
    /// response goes out as its legacy voucher type.
    pub legacy_protocol: bool,
}

impl ProviderDealState {
    /// A fresh deal in [`DealStatus::New`] with its first interval already set.
    pub fn new(proposal: DealProposal, receiver: PeerId) -> Self {
        let current_interval = proposal.params.payment_interval;
        Self {
            proposal,
            receiver,
            status: DealStatus::New,
            channel_id: None,
            piece_info: None,
            total_sent: 0,
            funds_received: TokenAmount::ZERO,
            current_interval,
            message: String::new(),
            sel_storage_proposal_cid: None,
            legacy_protocol: false,
        }
    }

    /// Key under which the deal is stored.
    pub fn identifier(&self) -> ProviderDealIdentifier {
        ProviderDealIdentifier {
            receiver: self.receiver,
            deal_id: self.proposal.id,
        }
    }

    pub fn params(&self) -> &DealParams {
        &self.proposal.params
    }

    /// Advance `current_interval` past everything sent so far.
    pub fn advance_interval(&mut self) {
        while self.current_interval <= self.total_sent {
            let next = self.proposal.params.next_interval(self.current_interval);
            if next <= self.current_interval {
                break;
            }
            self.current_interval = next;
        }
    }
}

// ---------------------------------------------------------------------------
// Ask
// ---------------------------------------------------------------------------

/// Retrieval pricing terms advertised by a provider address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalAsk {
    /// Minimum price per byte a proposal may offer.
    pub price_per_byte: TokenAmount,
    /// Minimum unseal price a proposal may offer.
    pub unseal_price: TokenAmount,
    /// Largest first payment interval a proposal may ask for.
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl Default for RetrievalAsk {
    fn default() -> Self {
        Self {
            price_per_byte: TokenAmount::ZERO,
            unseal_price: TokenAmount::ZERO,
            payment_interval: 1 << 20,
            payment_interval_increase: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage deals
// ---------------------------------------------------------------------------

/// State of a storage deal on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinerDealState {
    Validating,
    Transferring,
    Publishing,
    AwaitingPreCommit,
    Sealing,
    Active,
    Expired,
    Slashed,
    Failing,
    Error,
}

impl MinerDealState {
    /// True once the deal data has been handed to the sealing subsystem and
    /// is expected to remain retrievable.
    pub fn is_handed_to_sealing(&self) -> bool {
        matches!(self, Self::AwaitingPreCommit | Self::Sealing | Self::Active)
    }
}

/// Storage deal as tracked by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerDeal {
    pub proposal_cid: ProposalCid,
    pub client: PeerId,
    pub provider: Address,
    pub payload_cid: PayloadCid,
    pub piece_cid: PieceCid,
    /// Unpadded piece size in bytes.
    pub piece_size: u64,
    /// Only deals handed to sealing are served.
    pub state: MinerDealState,
    /// Sector holding the piece once sealed.
    pub sector: u64,
    pub offset: u64,
    pub length: u64,
    pub verified: bool,
    /// The provider keeps an unsealed copy of the piece.
    pub fast_retrieval: bool,
}

impl MinerDeal {
    /// Placement of this deal's piece, as stored in the piece index.
    pub fn piece_deal_info(&self) -> PieceDealInfo {
        PieceDealInfo {
            proposal_cid: self.proposal_cid,
            sector: self.sector,
            offset: self.offset,
            length: self.length,
        }
    }
}

// ---------------------------------------------------------------------------
// Query protocol
// ---------------------------------------------------------------------------

/// A client asking whether the provider can serve a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub payload_cid: PayloadCid,
    /// Restrict the answer to one piece.
    pub piece_cid: Option<PieceCid>,
}

/// Whether the provider can serve the queried payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResponseStatus {
    Available,
    Unavailable,
    Error,
}

/// Whether the piece named in the query holds the payload. `Unknown` when
/// the query named no piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryItemStatus {
    Available,
    Unavailable,
    Unknown,
}

/// Provider's answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: QueryResponseStatus,
    pub piece_cid_found: QueryItemStatus,
    /// Size in bytes of the piece that would serve the payload.
    pub size: u64,
    pub min_price_per_byte: TokenAmount,
    pub max_payment_interval: u64,
    pub max_payment_interval_increase: u64,
    /// Zero when an unsealed copy is available.
    pub unseal_price: TokenAmount,
    /// Address the client should open a payment channel to.
    pub payment_address: Option<Address>,
    pub message: String,
}

impl QueryResponse {
    /// The payload cannot be served; `message` says why.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_status(QueryResponseStatus::Unavailable, message)
    }

    /// The query itself failed on the provider.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(QueryResponseStatus::Error, message)
    }

    fn with_status(status: QueryResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            piece_cid_found: QueryItemStatus::Unavailable,
            size: 0,
            min_price_per_byte: TokenAmount::ZERO,
            max_payment_interval: 0,
            max_payment_interval_increase: 0,
            unseal_price: TokenAmount::ZERO,
            payment_address: None,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Retrieval asks and dynamic pricing.
//!
//! The static ask per provider address is persisted. Quotes for a specific
//! payload run it through a [`PricingFunc`] together with context about the
//! backing storage deals, supplied by a [`PricingInputProvider`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use wharf_meta::{MetaStore, PieceIndex};
use wharf_piece::PieceAccessor;
use wharf_types::{
    Address, MinerDeal, PayloadCid, PeerId, PieceCid, ProposalCid, RetrievalAsk, TokenAmount,
};

use crate::error::{Result, RetrievalError};

/// Everything a pricing function may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingInput {
    /// Payload being quoted.
    pub payload_cid: PayloadCid,
    /// Piece that would serve it.
    pub piece_cid: PieceCid,
    /// Largest piece size among the matching storage deals.
    pub piece_size: u64,
    /// Unknown for anonymous price queries.
    pub client: Option<PeerId>,
    /// At least one matching storage deal is verified.
    pub verified_deal: bool,
    /// An unsealed copy exists, so serving needs no unseal.
    pub unsealed: bool,
    /// The provider's stored ask.
    pub current_ask: RetrievalAsk,
}

/// Deal-specific pricing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingContext {
    pub piece_size: u64,
    pub verified_deal: bool,
}

/// Looks up what pricing needs to know about the storage deals holding a
/// piece.
#[async_trait::async_trait]
pub trait PricingInputProvider: Send + Sync {
    async fn pricing_context(
        &self,
        piece: PieceCid,
        storage_deals: &[ProposalCid],
    ) -> Result<PricingContext>;
}

/// Reads pricing context from the stored storage deals.
pub struct StoredDealInputs {
    meta: Arc<MetaStore>,
}

impl StoredDealInputs {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }
}

#[async_trait::async_trait]
impl PricingInputProvider for StoredDealInputs {
    async fn pricing_context(
        &self,
        piece: PieceCid,
        storage_deals: &[ProposalCid],
    ) -> Result<PricingContext> {
        let mut ctx: Option<PricingContext> = None;
        for proposal in storage_deals {
            let Some(deal) = self.meta.get_miner_deal(proposal)? else {
                continue;
            };
            if deal.piece_cid != piece {
                continue;
            }
            let entry = ctx.get_or_insert(PricingContext {
                piece_size: 0,
                verified_deal: false,
            });
            entry.piece_size = entry.piece_size.max(deal.piece_size);
            entry.verified_deal |= deal.verified;
        }
        ctx.ok_or_else(|| {
            RetrievalError::Pricing(format!(
                "no storage deal for piece {piece} among {} candidates",
                storage_deals.len()
            ))
        })
    }
}

/// Turns a [`PricingInput`] into the ask quoted for it.
pub trait PricingFunc: Send + Sync {
    /// Proposals for the payload are checked against the returned ask.
    fn price(&self, input: &PricingInput) -> Result<RetrievalAsk>;
}

/// The static ask, with no unseal price for unsealed pieces and optionally
/// free transfer for verified deals.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPricing {
    pub verified_deals_free_transfer: bool,
}

impl PricingFunc for DefaultPricing {
    fn price(&self, input: &PricingInput) -> Result<RetrievalAsk> {
        let mut ask = input.current_ask.clone();
        if input.unsealed {
            ask.unseal_price = TokenAmount::ZERO;
        }
        if input.verified_deal && self.verified_deals_free_transfer {
            ask.price_per_byte = TokenAmount::ZERO;
        }
        Ok(ask)
    }
}

/// Maps a storage provider address to the address clients should pay.
#[async_trait::async_trait]
pub trait PaymentAddressResolver: Send + Sync {
    /// `None` when no payment address is configured for `provider`.
    async fn payment_address(&self, provider: &Address) -> Option<Address>;
}

/// Fixed provider → payment address table.
#[derive(Debug, Clone, Default)]
pub struct PaymentAddresses {
    addresses: HashMap<Address, Address>,
}

impl PaymentAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route payments for `provider` to `payment`.
    pub fn with(mut self, provider: Address, payment: Address) -> Self {
        self.addresses.insert(provider, payment);
        self
    }
}

#[async_trait::async_trait]
impl PaymentAddressResolver for PaymentAddresses {
    async fn payment_address(&self, provider: &Address) -> Option<Address> {
        self.addresses.get(provider).copied()
    }
}

/// Stores the static ask and quotes asks for payloads.
pub struct AskHandler {
    meta: Arc<MetaStore>,
    piece_index: Arc<dyn PieceIndex>,
    inputs: Arc<dyn PricingInputProvider>,
    pricing: Arc<dyn PricingFunc>,
    pieces: Arc<dyn PieceAccessor>,
}

impl AskHandler {
    pub fn new(
        meta: Arc<MetaStore>,
        piece_index: Arc<dyn PieceIndex>,
        inputs: Arc<dyn PricingInputProvider>,
        pricing: Arc<dyn PricingFunc>,
        pieces: Arc<dyn PieceAccessor>,
    ) -> Self {
        Self {
            meta,
            piece_index,
            inputs,
            pricing,
            pieces,
        }
    }

    /// The static ask for `provider`, or the default ask if none was set.
    pub fn get_ask(&self, provider: &Address) -> Result<RetrievalAsk> {
        match self.meta.get_ask(provider)? {
            Some(ask) => Ok(ask),
            None => {
                debug!(%provider, "no ask stored, using default");
                Ok(RetrievalAsk::default())
            }
        }
    }

    /// Persist a new ask for `provider`. It applies to proposals validated from
    /// now on.
    pub fn set_ask(&self, provider: &Address, ask: &RetrievalAsk) -> Result<()> {
        self.meta.put_ask(provider, ask)?;
        info!(
            %provider,
            price_per_byte = %ask.price_per_byte,
            unseal_price = %ask.unseal_price,
            payment_interval = ask.payment_interval,
            "retrieval ask updated"
        );
        Ok(())
    }

    /// Price `input` after merging in context about `storage_deals`.
    pub async fn get_dynamic_ask(
        &self,
        mut input: PricingInput,
        storage_deals: &[ProposalCid],
    ) -> Result<RetrievalAsk> {
        let ctx = self.inputs.pricing_context(input.piece_cid, storage_deals).await?;
        input.piece_size = ctx.piece_size;
        input.verified_deal = ctx.verified_deal;

        let ask = self.pricing.price(&input)?;
        debug!(
            payload = %input.payload_cid,
            piece = %input.piece_cid,
            verified = input.verified_deal,
            unsealed = input.unsealed,
            price_per_byte = %ask.price_per_byte,
            unseal_price = %ask.unseal_price,
            "priced retrieval"
        );
        Ok(ask)
    }

    /// Storage deals holding `payload`, restricted to `piece` when given.
    pub fn resolve_deals(
        &self,
        payload: &PayloadCid,
        piece: Option<&PieceCid>,
    ) -> Result<Vec<MinerDeal>> {
        let mut deals = self.piece_index.deals_for_payload(payload)?;
        if let Some(piece) = piece {
            deals.retain(|d| d.piece_cid == *piece);
        }
        Ok(deals)
    }

    /// Quote for serving `payload` out of `deal`'s piece under `provider`'s
    /// static ask. `related` are the storage deals sharing that piece.
    pub async fn get_ask_for_deal(
        &self,
        payload: PayloadCid,
        deal: &MinerDeal,
        related: &[ProposalCid],
        client: Option<PeerId>,
        provider: &Address,
    ) -> Result<RetrievalAsk> {
        let unsealed = match self.pieces.is_locally_unsealed(deal.piece_cid).await {
            Ok(unsealed) => unsealed,
            Err(e) => {
                debug!(
                    piece = %deal.piece_cid,
                    error = %e,
                    "unseal status unknown, assuming sealed"
                );
                false
            }
        };
        let input = PricingInput {
            payload_cid: payload,
            piece_cid: deal.piece_cid,
            piece_size: deal.piece_size,
            client,
            verified_deal: deal.verified,
            unsealed,
            current_ask: self.get_ask(provider)?,
        };
        self.get_dynamic_ask(input, related).await
    }

    /// Quote for `payload`, failing when no storage deal backs it.
    pub async fn get_ask_for_payload(
        &self,
        payload: PayloadCid,
        piece: Option<PieceCid>,
        client: Option<PeerId>,
        provider: &Address,
    ) -> Result<RetrievalAsk> {
        let deals = self.resolve_deals(&payload, piece.as_ref())?;
        let Some(first) = deals.first() else {
            return Err(RetrievalError::NoDealsForPayload(payload));
        };
        let related = related_proposals(&deals, &first.piece_cid);
        self.get_ask_for_deal(payload, first, &related, client, provider).await
    }
}

/// Proposals of the deals in `deals` that hold `piece`.
pub fn related_proposals(deals: &[MinerDeal], piece: &PieceCid) -> Vec<ProposalCid> {
    deals
        .iter()
        .filter(|d| d.piece_cid == *piece)
        .map(|d| d.proposal_cid)
        .collect()
}

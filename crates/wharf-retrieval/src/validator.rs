//! Pull request validation.
//!
//! A pull request carries a deal proposal voucher. Validation decides the
//! deal's opening status and always pauses the transfer: data only starts
//! flowing once the unseal or payment pipeline resumes the channel.

use std::sync::Arc;

use tracing::{debug, info, warn};
use wharf_types::{
    ChannelId, DealProposal, DealResponse, DealStatus, LegacyDealProposal, MinerDeal, PayloadCid,
    PeerId, PieceInfo, ProviderDealIdentifier, ProviderDealState, RetrievalAsk, Voucher,
};

use crate::ask::{AskHandler, PaymentAddressResolver, related_proposals};
use crate::deals::DealStore;
use crate::error::Result;
use crate::revalidator::payment_owed;
use crate::transfer::ValidationResult;

/// Rejection messages sent when a proposal undercuts the ask.
pub const MSG_PRICE_TOO_LOW: &str = "price per byte too low";
pub const MSG_INTERVAL_TOO_LARGE: &str = "payment interval too large";
pub const MSG_INTERVAL_INCREASE_TOO_LARGE: &str = "payment interval increase too large";
pub const MSG_UNSEAL_PRICE_TOO_SMALL: &str = "unseal price too small";

/// A client's request to pull a payload.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub channel_id: ChannelId,
    pub receiver: PeerId,
    /// Carries the deal proposal.
    pub voucher: Voucher,
    /// Root the client asked the transport for.
    pub base_cid: PayloadCid,
    /// Encoded selector the client asked the transport for.
    pub selector: Vec<u8>,
}

/// Operator policy run on every deal that passed the price checks.
#[async_trait::async_trait]
pub trait DealDecider: Send + Sync {
    /// `Err(reason)` rejects the deal.
    async fn decide(&self, deal: &ProviderDealState) -> std::result::Result<(), String>;
}

/// Decider that accepts every deal.
pub struct AcceptAll;

#[async_trait::async_trait]
impl DealDecider for AcceptAll {
    async fn decide(&self, _deal: &ProviderDealState) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Decode a proposal voucher of either protocol version. The flag is true
/// for the legacy version.
pub fn decode_proposal(voucher: &Voucher) -> Result<(DealProposal, bool)> {
    if voucher.is::<LegacyDealProposal>() {
        return Ok((voucher.decode::<LegacyDealProposal>()?.0, true));
    }
    Ok((voucher.decode::<DealProposal>()?, false))
}

/// Checks incoming pull requests and restarts against stored deals and the
/// current ask.
pub struct RequestValidator {
    deals: DealStore,
    asks: Arc<AskHandler>,
    payment: Arc<dyn PaymentAddressResolver>,
    decider: Arc<dyn DealDecider>,
}

impl RequestValidator {
    pub fn new(
        deals: DealStore,
        asks: Arc<AskHandler>,
        payment: Arc<dyn PaymentAddressResolver>,
        decider: Arc<dyn DealDecider>,
    ) -> Self {
        Self {
            deals,
            asks,
            payment,
            decider,
        }
    }

    /// Validate a new pull request. Only an undecodable voucher is an error;
    /// every other outcome is a deal response.
    pub async fn validate_pull(&self, request: &PullRequest) -> Result<ValidationResult> {
        let (proposal, legacy) = decode_proposal(&request.voucher)?;
        let response = self.accept_deal(request, proposal, legacy).await;
        let accepted = matches!(
            response.status,
            DealStatus::Accepted | DealStatus::FundsNeededUnseal
        );
        info!(
            channel = %request.channel_id,
            deal_id = %response.id,
            status = %response.status,
            message = %response.message,
            "validated pull request"
        );
        Ok(ValidationResult {
            accepted,
            response: Some(response),
            force_pause: true,
            requires_finalization: true,
        })
    }

    /// Re-derive the validation outcome of a reconnecting channel from the
    /// stored deal. Never writes.
    pub async fn validate_restart(
        &self,
        chid: ChannelId,
        voucher: &Voucher,
    ) -> Result<ValidationResult> {
        let (proposal, _) = decode_proposal(voucher)?;
        let id = ProviderDealIdentifier {
            receiver: chid.initiator,
            deal_id: proposal.id,
        };
        let deal = self.deals.require(&id)?;
        if deal.channel_id.is_some_and(|c| c != chid) {
            warn!(deal = %id, channel = %chid, "restart on a different channel than validated");
        }

        let status = deal.status;
        let accepted = !status.is_terminal()
            && !matches!(status, DealStatus::Rejected | DealStatus::DealNotFound);
        let force_pause = matches!(
            status,
            DealStatus::New
                | DealStatus::Accepted
                | DealStatus::Unsealing
                | DealStatus::FundsNeededUnseal
                | DealStatus::FundsNeeded
                | DealStatus::FundsNeededLastPayment
        );
        let requires_finalization =
            !matches!(status, DealStatus::Finalizing | DealStatus::Completed);
        let response = force_pause
            .then(|| DealResponse::new(proposal.id, status).with_owed(payment_owed(&deal)));
        debug!(deal = %id, %status, accepted, force_pause, "validated restart");
        Ok(ValidationResult {
            accepted,
            response,
            force_pause,
            requires_finalization,
        })
    }

    async fn accept_deal(
        &self,
        request: &PullRequest,
        proposal: DealProposal,
        legacy: bool,
    ) -> DealResponse {
        let id = ProviderDealIdentifier {
            receiver: request.receiver,
            deal_id: proposal.id,
        };
        let reject = |status: DealStatus, msg: String| {
            DealResponse::new(proposal.id, status).with_message(msg)
        };

        if proposal.payload_cid != request.base_cid {
            return reject(DealStatus::Rejected, "incorrect CID for this proposal".into());
        }
        if proposal.params.selector_bytes() != request.selector.as_slice() {
            return reject(DealStatus::Rejected, "incorrect selector for this proposal".into());
        }
        match self.deals.get(&id) {
            Ok(None) => {}
            Ok(Some(_)) => return reject(DealStatus::Rejected, format!("deal {id} already exists")),
            Err(e) => return reject(DealStatus::Errored, format!("failed to load deal: {e}")),
        }

        let storage_deals = match self
            .asks
            .resolve_deals(&proposal.payload_cid, proposal.params.piece_cid.as_ref())
        {
            Ok(deals) if deals.is_empty() => {
                return reject(
                    DealStatus::DealNotFound,
                    format!("no storage deals found for payload {}", proposal.payload_cid),
                );
            }
            Ok(deals) => deals,
            Err(e) => {
                return reject(
                    DealStatus::Errored,
                    format!("failed to look up storage deals: {e}"),
                );
            }
        };

        let (deal, ask) = match self.quote(&proposal, &storage_deals, request.receiver).await {
            Ok(Some(quote)) => quote,
            Ok(None) => {
                return reject(
                    DealStatus::Errored,
                    "no payment address configured for any storage deal".into(),
                );
            }
            Err(e) => return reject(DealStatus::Errored, format!("failed to price retrieval: {e}")),
        };

        if let Some(msg) = check_terms(&proposal, &ask) {
            return reject(DealStatus::Rejected, msg.into());
        }

        let mut state = ProviderDealState::new(proposal.clone(), request.receiver);
        state.channel_id = Some(request.channel_id);
        state.legacy_protocol = legacy;
        state.sel_storage_proposal_cid = Some(deal.proposal_cid);
        state.piece_info = Some(PieceInfo {
            piece_cid: deal.piece_cid,
            deals: storage_deals
                .iter()
                .filter(|d| d.piece_cid == deal.piece_cid)
                .map(MinerDeal::piece_deal_info)
                .collect(),
        });

        if let Err(reason) = self.decider.decide(&state).await {
            return reject(DealStatus::Rejected, reason);
        }

        let unseal_price = proposal.params.unseal_price;
        state.status = if unseal_price.is_zero() {
            DealStatus::Accepted
        } else {
            DealStatus::FundsNeededUnseal
        };
        let _guard = self.deals.lock(&id).await;
        if let Ok(Some(_)) = self.deals.get(&id) {
            return reject(DealStatus::Rejected, format!("deal {id} already exists"));
        }
        if let Err(e) = self.deals.save(&state) {
            warn!(deal = %id, error = %e, "failed to persist accepted deal");
            return reject(DealStatus::Errored, format!("failed to persist deal: {e}"));
        }

        let response = DealResponse::new(proposal.id, state.status);
        if state.status == DealStatus::FundsNeededUnseal {
            response.with_owed(unseal_price)
        } else {
            response
        }
    }

    /// Ask for the first storage deal with a payment address.
    async fn quote(
        &self,
        proposal: &DealProposal,
        storage_deals: &[MinerDeal],
        client: PeerId,
    ) -> Result<Option<(MinerDeal, RetrievalAsk)>> {
        for deal in storage_deals {
            if self.payment.payment_address(&deal.provider).await.is_none() {
                debug!(
                    proposal = %deal.proposal_cid,
                    provider = %deal.provider,
                    "no payment address, skipping deal"
                );
                continue;
            }
            let related = related_proposals(storage_deals, &deal.piece_cid);
            let ask = self
                .asks
                .get_ask_for_deal(
                    proposal.payload_cid,
                    deal,
                    &related,
                    Some(client),
                    &deal.provider,
                )
                .await?;
            return Ok(Some((deal.clone(), ask)));
        }
        Ok(None)
    }
}

/// First violated term, if any.
fn check_terms(proposal: &DealProposal, ask: &RetrievalAsk) -> Option<&'static str> {
    let params = &proposal.params;
    if params.price_per_byte < ask.price_per_byte {
        return Some(MSG_PRICE_TOO_LOW);
    }
    if params.payment_interval > ask.payment_interval {
        return Some(MSG_INTERVAL_TOO_LARGE);
    }
    if params.payment_interval_increase > ask.payment_interval_increase {
        return Some(MSG_INTERVAL_INCREASE_TOO_LARGE);
    }
    if params.unseal_price < ask.unseal_price {
        return Some(MSG_UNSEAL_PRICE_TOO_SMALL);
    }
    None
}

//! The retrieval provider: wires the ask handler, validator, revalidators
//! and deal handler together and exposes the transport-facing surface.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wharf_dagstore::{DagStoreWrapper, ReadOnlyBlockstore};
use wharf_meta::MetaStore;
use wharf_piece::PieceAccessor;
use wharf_types::events::EventBus;
use wharf_types::{
    Address, ChannelId, DealPayment, DealProposal, DealResponse, DealStatus, LegacyDealPayment,
    LegacyDealProposal, LegacyDealResponse, ProviderDealIdentifier, ProviderDealState, RetrievalAsk,
    Voucher, VoucherType,
};

use crate::ask::{AskHandler, PaymentAddressResolver, PricingFunc, StoredDealInputs};
use crate::deals::DealStore;
use crate::error::Result;
use crate::handler::DealHandler;
use crate::legacy::LegacyRevalidator;
use crate::paych::PaymentChannel;
use crate::query::QueryHandler;
use crate::revalidator::{PaymentRevalidator, Revalidator};
use crate::subscriber::EventSubscriber;
use crate::tracker::ReadOnlyBlockstoreTracker;
use crate::transfer::{self, DataTransfer, RevalidationResult, TransferEvent, ValidationResult};
use crate::validator::{DealDecider, PullRequest, RequestValidator};

/// Voucher types announced to the transport at start.
pub const VOUCHER_TYPES: [&str; 6] = [
    DealProposal::TYPE_ID,
    DealPayment::TYPE_ID,
    DealResponse::TYPE_ID,
    LegacyDealProposal::TYPE_ID,
    LegacyDealPayment::TYPE_ID,
    LegacyDealResponse::TYPE_ID,
];

/// Collaborators the provider is built from.
pub struct ProviderDeps {
    pub meta: Arc<MetaStore>,
    pub events: EventBus,
    /// Source of the shards deals are served from.
    pub dagstore: Arc<DagStoreWrapper>,
    /// Used to check whether a piece has an unsealed copy.
    pub pieces: Arc<dyn PieceAccessor>,
    /// Transport the provider pauses, resumes and closes channels on.
    pub transfer: Arc<dyn DataTransfer>,
    /// Where payment vouchers are checked and recorded.
    pub paych: Arc<dyn PaymentChannel>,
    /// Resolves the address paid for retrievals.
    pub payment: Arc<dyn PaymentAddressResolver>,
    /// Turns the stored ask into a quote for a particular payload.
    pub pricing: Arc<dyn PricingFunc>,
    /// Final say on proposals that passed the pricing checks.
    pub decider: Arc<dyn DealDecider>,
}

/// Provider side of the retrieval market.
///
/// Validates pull requests against the current ask and unseals the backing
/// piece. It then meters the transfer until the client has paid for every
/// byte.
pub struct RetrievalProvider {
    address: Address,
    deals: DealStore,
    asks: Arc<AskHandler>,
    validator: RequestValidator,
    revalidator: Arc<Revalidator>,
    handler: Arc<DealHandler>,
    subscriber: EventSubscriber,
    query: Arc<QueryHandler>,
    tracker: Arc<ReadOnlyBlockstoreTracker>,
    transfer: Arc<dyn DataTransfer>,
    cancel: CancellationToken,
}

impl RetrievalProvider {
    /// `address` is the storage provider address whose ask is served.
    pub fn new(address: Address, deps: ProviderDeps) -> Self {
        let ProviderDeps {
            meta,
            events,
            dagstore,
            pieces,
            transfer,
            paych,
            payment,
            pricing,
            decider,
        } = deps;

        let cancel = CancellationToken::new();
        let deals = DealStore::new(meta.clone(), events);
        let asks = Arc::new(AskHandler::new(
            meta.clone(),
            meta.clone(),
            Arc::new(StoredDealInputs::new(meta)),
            pricing,
            pieces.clone(),
        ));
        let tracker = Arc::new(ReadOnlyBlockstoreTracker::new());
        let handler = Arc::new(DealHandler::new(
            deals.clone(),
            dagstore,
            tracker.clone(),
            transfer.clone(),
            cancel.child_token(),
        ));
        let revalidator = Arc::new(Revalidator::new(deals.clone(), paych, handler.clone()));
        let revalidators: Vec<Arc<dyn PaymentRevalidator>> = vec![
            revalidator.clone(),
            Arc::new(LegacyRevalidator::new(revalidator.clone())),
        ];
        let subscriber = EventSubscriber::new(handler.clone(), revalidators);
        let validator =
            RequestValidator::new(deals.clone(), asks.clone(), payment.clone(), decider);
        let query = Arc::new(QueryHandler::new(asks.clone(), payment, pieces));

        Self {
            address,
            deals,
            asks,
            validator,
            revalidator,
            handler,
            subscriber,
            query,
            tracker,
            transfer,
            cancel,
        }
    }

    /// Announce voucher types and resume deals interrupted mid-unseal.
    pub async fn start(&self) -> Result<()> {
        for type_id in VOUCHER_TYPES {
            self.transfer.register_voucher_type(type_id).await?;
        }

        let interrupted: Vec<ProviderDealIdentifier> = self
            .deals
            .list()?
            .into_iter()
            .filter(|d| d.status == DealStatus::Unsealing)
            .map(|d| d.identifier())
            .collect();
        for id in &interrupted {
            let handler = self.handler.clone();
            let id = *id;
            tokio::spawn(async move {
                if let Err(e) = handler.unseal_data(&id).await {
                    warn!(deal = %id, error = %e, "restarted unseal failed");
                }
            });
        }
        info!(address = %self.address, restarted = interrupted.len(), "retrieval provider started");
        Ok(())
    }

    /// Abort in-flight shard loads.
    pub fn close(&self) {
        self.cancel.cancel();
        info!("retrieval provider closed");
    }

    /// Provider address retrievals are paid to.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Validate a client's pull request and record the deal if it is accepted.
    pub async fn validate_pull(&self, request: &PullRequest) -> Result<ValidationResult> {
        self.validator.validate_pull(request).await
    }

    /// Validate a channel restart against the deal already stored for it.
    pub async fn validate_restart(
        &self,
        chid: ChannelId,
        voucher: &Voucher,
    ) -> Result<ValidationResult> {
        self.validator.validate_restart(chid, voucher).await
    }

    /// Handle a transport event and drive the channel with the outcome.
    pub async fn on_event(
        &self,
        chid: ChannelId,
        event: TransferEvent,
    ) -> Result<Option<RevalidationResult>> {
        let result = self.subscriber.on_event(chid, event).await?;
        self.apply(chid, result).await
    }

    /// Account bytes sent on `chid` and drive the channel with the outcome.
    pub async fn on_pull_data_sent(
        &self,
        chid: ChannelId,
        additional: u64,
    ) -> Result<Option<RevalidationResult>> {
        let result = self.subscriber.on_pull_data_sent(chid, additional).await?;
        self.apply(chid, result).await
    }

    async fn apply(
        &self,
        chid: ChannelId,
        result: Option<RevalidationResult>,
    ) -> Result<Option<RevalidationResult>> {
        if let Some(result) = &result {
            transfer::apply(self.transfer.as_ref(), chid, result).await?;
        }
        Ok(result)
    }

    /// Blockstore serving an unsealed deal.
    pub fn blockstore(&self, deal: &ProviderDealIdentifier) -> Result<ReadOnlyBlockstore> {
        Ok(self.tracker.get(deal)?)
    }

    /// Current record of a deal, if it exists.
    pub fn get_deal(&self, id: &ProviderDealIdentifier) -> Result<Option<ProviderDealState>> {
        self.deals.get(id)
    }

    /// Every deal the provider has recorded.
    pub fn list_deals(&self) -> Result<Vec<ProviderDealState>> {
        self.deals.list()
    }

    /// The stored ask, or the default one when none was set.
    pub fn get_ask(&self) -> Result<RetrievalAsk> {
        self.asks.get_ask(&self.address)
    }

    /// Replace this provider's ask.
    pub fn set_ask(&self, ask: &RetrievalAsk) -> Result<()> {
        self.asks.set_ask(&self.address, ask)
    }

    pub fn asks(&self) -> &Arc<AskHandler> {
        &self.asks
    }

    /// Responder to plug into the query server.
    pub fn query_handler(&self) -> Arc<QueryHandler> {
        self.query.clone()
    }

    /// Times a payment was requested for a deal still in `New`.
    pub fn new_status_anomalies(&self) -> u64 {
        self.revalidator.new_status_anomalies()
    }
}

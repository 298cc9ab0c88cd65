//! Deal lifecycle side effects: unsealing, cancellation, cleanup and
//! errors. Every path that ends a deal releases its blockstore and closes
//! its channel.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wharf_dagstore::DagStoreWrapper;
use wharf_types::{ChannelId, DealResponse, DealStatus, ProviderDealIdentifier, ProviderDealState};

use crate::deals::DealStore;
use crate::error::{Result, RetrievalError};
use crate::tracker::{ReadOnlyBlockstoreTracker, TrackerError};
use crate::transfer::{DataTransfer, TransferError};

/// Loads shards for deals and tears deals down. It owns the accessor each
/// unsealed deal reads from.
pub struct DealHandler {
    deals: DealStore,
    dagstore: Arc<DagStoreWrapper>,
    tracker: Arc<ReadOnlyBlockstoreTracker>,
    transfer: Arc<dyn DataTransfer>,
    cancel: CancellationToken,
}

impl DealHandler {
    pub fn new(
        deals: DealStore,
        dagstore: Arc<DagStoreWrapper>,
        tracker: Arc<ReadOnlyBlockstoreTracker>,
        transfer: Arc<dyn DataTransfer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deals,
            dagstore,
            tracker,
            transfer,
            cancel,
        }
    }

    /// The transport accepted the channel. Free deals start unsealing right
    /// away; deals with an unseal price wait for payment.
    pub async fn on_accept(&self, chid: ChannelId) -> Result<()> {
        let deal = self.deals.require_by_channel(&chid)?;
        match deal.status {
            DealStatus::Accepted => self.unseal_data(&deal.identifier()).await,
            DealStatus::FundsNeededUnseal => {
                debug!(deal = %deal.identifier(), "channel accepted, awaiting unseal payment");
                Ok(())
            }
            status => {
                debug!(deal = %deal.identifier(), %status, "channel accepted");
                Ok(())
            }
        }
    }

    /// Load the deal's shard, keep it open for the transfer and resume the
    /// channel. A failed load cancels the deal.
    ///
    /// The deal's lock is held while its status changes but not while the
    /// shard loads, so payments and cancellations are handled meanwhile.
    pub async fn unseal_data(&self, id: &ProviderDealIdentifier) -> Result<()> {
        let deal = {
            let _guard = self.deals.lock(id).await;
            let mut deal = self.deals.require(id)?;
            if deal.status.is_terminal() {
                return Ok(());
            }
            if deal.status != DealStatus::Unsealing {
                deal.status = DealStatus::Unsealing;
                self.deals.save(&deal)?;
            }
            deal
        };

        let Some(piece) = deal.piece_info.as_ref().map(|p| p.piece_cid) else {
            self.cancel_with_message(id, "deal has no piece to unseal".into()).await?;
            return Err(RetrievalError::NoDealsForPayload(deal.proposal.payload_cid));
        };
        info!(deal = %id, %piece, "unsealing");

        let accessor = match self.dagstore.load_shard(piece, &self.cancel).await {
            Ok(accessor) => accessor,
            Err(e) => {
                warn!(deal = %id, %piece, error = %e, "failed to load shard");
                let message = format!("failed to load shard for piece {piece}: {e}");
                self.cancel_with_message(id, message).await?;
                return Err(e.into());
            }
        };

        let guard = self.deals.lock(id).await;
        let mut deal = self.deals.require(id)?;
        if deal.status.is_terminal() {
            // Whoever ended the deal already closed the channel.
            debug!(deal = %id, status = %deal.status, "deal ended while unsealing");
            accessor.close();
            return Ok(());
        }
        match self.tracker.track(*id, accessor) {
            Ok(()) => {}
            // A restarted unseal may find the blockstore already open.
            Err(TrackerError::AlreadyTracked(_)) => debug!(
                deal = %id,
                "blockstore already tracked"
            ),
            Err(e) => return Err(e.into()),
        }
        deal.status = DealStatus::Unsealed;
        if let Err(e) = self.deals.save(&deal) {
            self.untrack(id);
            return Err(e);
        }
        drop(guard);
        info!(deal = %id, %piece, "unsealed, resuming transfer");

        if let Some(chid) = deal.channel_id {
            self.transfer.resume(chid).await?;
        }
        Ok(())
    }

    /// Release the deal's blockstore and channel, then mark it `Cancelled`.
    /// No-op for a deal that already ended.
    pub async fn cancel_deal(&self, id: &ProviderDealIdentifier) -> Result<()> {
        self.cancel_with_message(id, String::new()).await
    }

    /// Cancel the deal bound to `chid`, if there is one.
    pub async fn cancel_channel(&self, chid: ChannelId) -> Result<()> {
        match self.deals.by_channel(&chid)? {
            Some(deal) => self.cancel_deal(&deal.identifier()).await,
            None => {
                debug!(channel = %chid, "cancel for unknown channel");
                Ok(())
            }
        }
    }

    /// The transfer finished: release resources and complete the deal.
    pub async fn cleanup_channel(&self, chid: ChannelId) -> Result<()> {
        let Some(deal) = self.deals.by_channel(&chid)? else {
            debug!(channel = %chid, "completion for unknown channel");
            return Ok(());
        };
        let id = deal.identifier();
        let _guard = self.deals.lock(&id).await;
        let mut deal = self.deals.require(&id)?;
        if deal.status.is_terminal() {
            return Ok(());
        }
        self.release(&deal).await;
        deal.status = DealStatus::Completed;
        self.deals.save(&deal)?;
        info!(
            deal = %deal.identifier(),
            total_sent = deal.total_sent,
            funds = %deal.funds_received,
            "deal completed"
        );
        Ok(())
    }

    /// Move the deal to `Errored`. Failures are logged, never returned.
    pub async fn error(&self, id: &ProviderDealIdentifier, message: String) {
        let _guard = self.deals.lock(id).await;
        let mut deal = match self.deals.require(id) {
            Ok(deal) => deal,
            Err(e) => {
                warn!(deal = %id, error = %e, %message, "cannot record deal error");
                return;
            }
        };
        if deal.status.is_terminal() {
            return;
        }
        self.untrack(id);
        warn!(deal = %id, %message, "deal errored");
        deal.status = DealStatus::Errored;
        deal.message = message;
        if let Err(e) = self.deals.save(&deal) {
            warn!(deal = %id, error = %e, "failed to persist deal error");
        }
    }

    /// Move the deal bound to `chid` to `Errored`.
    pub async fn error_channel(&self, chid: ChannelId, message: String) {
        match self.deals.by_channel(&chid) {
            Ok(Some(deal)) => self.error(&deal.identifier(), message).await,
            Ok(None) => debug!(channel = %chid, %message, "error for unknown channel"),
            Err(e) => warn!(
                channel = %chid,
                error = %e,
                "failed to look up deal for channel error"
            ),
        }
    }

    /// The transport delivered `response` to the client. Logged only.
    pub async fn on_voucher_result_sent(
        &self,
        chid: ChannelId,
        response: &DealResponse,
    ) -> Result<()> {
        match self.deals.by_channel(&chid)? {
            Some(deal) => debug!(
                deal = %deal.identifier(),
                sent_status = %response.status,
                status = %deal.status,
                owed = %response.payment_owed,
                "voucher result delivered"
            ),
            None => debug!(
                channel = %chid,
                sent_status = %response.status,
                "voucher result delivered"
            ),
        }
        Ok(())
    }

    async fn cancel_with_message(
        &self,
        id: &ProviderDealIdentifier,
        message: String,
    ) -> Result<()> {
        let _guard = self.deals.lock(id).await;
        self.cancel_locked(id, message).await
    }

    /// Cancel with the deal's lock already held by the caller.
    pub(crate) async fn cancel_locked(
        &self,
        id: &ProviderDealIdentifier,
        message: String,
    ) -> Result<()> {
        let mut deal = self.deals.require(id)?;
        if deal.status.is_terminal() {
            return Ok(());
        }
        self.release(&deal).await;
        deal.status = DealStatus::Cancelled;
        if !message.is_empty() {
            deal.message = message;
        }
        self.deals.save(&deal)?;
        info!(deal = %id, message = %deal.message, "deal cancelled");
        Ok(())
    }

    /// Drop the tracked blockstore and close the channel. Best effort.
    async fn release(&self, deal: &ProviderDealState) {
        let id = deal.identifier();
        self.untrack(&id);
        if let Some(chid) = deal.channel_id {
            match self.transfer.close(chid).await {
                Ok(()) | Err(TransferError::AlreadyTerminated(_)) => {}
                Err(e) => warn!(deal = %id, channel = %chid, error = %e, "failed to close channel"),
            }
        }
    }

    /// Best effort. An untracked deal is not an error.
    fn untrack(&self, id: &ProviderDealIdentifier) {
        match self.tracker.untrack(id) {
            Ok(()) | Err(TrackerError::NotFound(_)) => {}
            Err(e) => warn!(deal = %id, error = %e, "failed to release blockstore"),
        }
    }
}

//! Payment revalidation.
//!
//! While data flows the transport reports every batch of bytes sent. Once a
//! deal crosses its current payment interval the revalidator pauses the
//! channel and asks for payment; payment vouchers credit the deal and
//! resume, finalize or start unsealing depending on what the client was
//! paying for.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use wharf_types::{
    ChannelId, DealPayment, DealResponse, DealStatus, ProviderDealState, TokenAmount, Voucher,
};

use crate::deals::DealStore;
use crate::error::Result;
use crate::handler::DealHandler;
use crate::paych::PaymentChannel;
use crate::transfer::{RevalidationResult, TransferAction};

/// Amount the client still owes for everything sent so far, including any
/// unpaid part of the unseal price.
///
/// Funds first cover the unseal price; the remainder buys whole bytes at
/// `price_per_byte`.
pub fn payment_owed(deal: &ProviderDealState) -> TokenAmount {
    let params = deal.params();
    let price = params.price_per_byte;
    let unseal = params.unseal_price;

    if deal.funds_received < unseal {
        return unseal.saturating_sub(deal.funds_received) + price * deal.total_sent;
    }
    if price.is_zero() {
        return TokenAmount::ZERO;
    }
    let credit = deal.funds_received.saturating_sub(unseal).value();
    let bytes_paid_for = u64::try_from(credit / price.value()).unwrap_or(u64::MAX);
    price * deal.total_sent.saturating_sub(bytes_paid_for)
}

/// Callback surface the event subscriber dispatches payment events to.
///
/// Each method returns `None` when this revalidator does not handle the
/// event, so several versions can be chained.
#[async_trait::async_trait]
pub trait PaymentRevalidator: Send + Sync {
    async fn revalidate(
        &self,
        chid: ChannelId,
        voucher: &Voucher,
    ) -> Result<Option<RevalidationResult>>;

    async fn on_pull_data_sent(
        &self,
        chid: ChannelId,
        additional: u64,
    ) -> Result<Option<RevalidationResult>>;

    /// Every block of the transfer has been queued.
    async fn on_complete(&self, chid: ChannelId) -> Result<Option<RevalidationResult>>;

    /// The transport paused itself at the data limit.
    async fn on_data_limit_exceeded(&self, chid: ChannelId) -> Result<Option<RevalidationResult>>;
}

/// Meters bytes sent and credits payments for deals on the current protocol.
pub struct Revalidator {
    deals: DealStore,
    paych: Arc<dyn PaymentChannel>,
    handler: Arc<DealHandler>,
    /// Payment requests raised for a deal still in `New`.
    anomalies: AtomicU64,
}

impl Revalidator {
    pub fn new(
        deals: DealStore,
        paych: Arc<dyn PaymentChannel>,
        handler: Arc<DealHandler>,
    ) -> Self {
        Self {
            deals,
            paych,
            handler,
            anomalies: AtomicU64::new(0),
        }
    }

    /// Number of times a payment was requested for a deal that had not been
    /// accepted yet.
    pub fn new_status_anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// Account `additional` bytes and request payment once the current
    /// interval is crossed.
    pub async fn record_data_sent(
        &self,
        chid: ChannelId,
        additional: u64,
    ) -> Result<RevalidationResult> {
        let Some((_guard, mut deal)) = self.lock_live(&chid).await? else {
            return Ok(RevalidationResult::proceed());
        };
        deal.total_sent = deal.total_sent.saturating_add(additional);

        if deal.params().price_per_byte.is_zero() || deal.total_sent < deal.current_interval {
            self.persist(&deal).await?;
            return Ok(RevalidationResult::proceed());
        }
        self.request_payment(deal).await
    }

    /// The transport stopped at the granted limit: settle the interval.
    pub async fn data_limit_exceeded(&self, chid: ChannelId) -> Result<RevalidationResult> {
        let Some((_guard, deal)) = self.lock_live(&chid).await? else {
            return Ok(RevalidationResult::proceed());
        };
        self.request_payment(deal).await
    }

    /// All blocks are sent. Finalize when paid up, otherwise wait for the
    /// last payment.
    pub async fn blocks_complete(&self, chid: ChannelId) -> Result<RevalidationResult> {
        let Some((_guard, mut deal)) = self.lock_live(&chid).await? else {
            return Ok(RevalidationResult::proceed());
        };
        let id = deal.proposal.id;
        deal.status = DealStatus::BlocksComplete;
        self.persist(&deal).await?;

        let owed = payment_owed(&deal);
        if owed.is_zero() {
            deal.status = DealStatus::Finalizing;
            self.persist(&deal).await?;
            info!(
                deal = %deal.identifier(),
                total_sent = deal.total_sent,
                "all blocks sent and paid"
            );
            return Ok(RevalidationResult::complete(DealResponse::new(id, DealStatus::Completed)));
        }

        deal.status = DealStatus::FundsNeededLastPayment;
        self.persist(&deal).await?;
        info!(deal = %deal.identifier(), %owed, "all blocks sent, awaiting last payment");
        Ok(RevalidationResult::pause(
            DealResponse::new(id, DealStatus::FundsNeededLastPayment).with_owed(owed),
        ))
    }

    /// Credit a payment voucher to the deal bound to `chid`.
    ///
    /// The voucher is stored before the deal's lock is taken; the credit is
    /// then applied to a fresh read, since the deal may have moved on (an
    /// unseal finishing, say) while the voucher was being saved.
    pub async fn process_payment(
        &self,
        chid: ChannelId,
        payment: DealPayment,
    ) -> Result<RevalidationResult> {
        let Some(deal) = self.live_deal(&chid)? else {
            debug!(channel = %chid, "payment for unknown or finished deal ignored");
            return Ok(RevalidationResult::proceed());
        };
        let id = deal.proposal.id;
        if payment.id != id {
            warn!(
                channel = %chid,
                deal_id = %id,
                paid_for = %payment.id,
                "payment names a different deal, ignoring"
            );
            return Ok(RevalidationResult::proceed());
        }

        let credited = match self
            .paych
            .add_voucher(
                &payment.payment_channel,
                &payment.payment_voucher,
                &[],
                TokenAmount::ZERO,
            )
            .await
        {
            Ok(amount) => amount,
            Err(e) => {
                warn!(deal = %deal.identifier(), error = %e, "voucher rejected");
                return Ok(RevalidationResult::pause(
                    DealResponse::new(id, deal.status)
                        .with_owed(payment_owed(&deal))
                        .with_message(format!("failed to save voucher: {e}")),
                ));
            }
        };

        let Some((_guard, mut deal)) = self.lock_live(&chid).await? else {
            debug!(channel = %chid, %credited, "deal ended while the voucher was stored");
            return Ok(RevalidationResult::proceed());
        };
        deal.funds_received += credited;

        let owed = payment_owed(&deal);
        if !owed.is_zero() {
            self.persist(&deal).await?;
            debug!(deal = %deal.identifier(), %credited, %owed, "partial payment");
            return Ok(RevalidationResult::pause(
                DealResponse::new(id, deal.status).with_owed(owed),
            ));
        }

        match deal.status {
            DealStatus::FundsNeeded => {
                deal.status = DealStatus::Ongoing;
                deal.advance_interval();
                self.persist(&deal).await?;
                debug!(
                    deal = %deal.identifier(),
                    next_interval = deal.current_interval,
                    "interval paid, resuming"
                );
                Ok(RevalidationResult::resume(None))
            }
            DealStatus::FundsNeededLastPayment => {
                deal.status = DealStatus::Finalizing;
                self.persist(&deal).await?;
                info!(
                    deal = %deal.identifier(),
                    funds = %deal.funds_received,
                    "last payment received"
                );
                Ok(RevalidationResult::complete(DealResponse::new(id, DealStatus::Completed)))
            }
            DealStatus::FundsNeededUnseal => {
                deal.status = DealStatus::Unsealing;
                self.persist(&deal).await?;
                let handler = self.handler.clone();
                let deal_id = deal.identifier();
                tokio::spawn(async move {
                    if let Err(e) = handler.unseal_data(&deal_id).await {
                        warn!(deal = %deal_id, error = %e, "unseal after payment failed");
                    }
                });
                Ok(RevalidationResult {
                    action: TransferAction::Continue,
                    response: Some(DealResponse::new(id, DealStatus::Unsealing)),
                })
            }
            _ => {
                self.persist(&deal).await?;
                Ok(RevalidationResult::proceed())
            }
        }
    }

    /// Pause for payment if anything is owed, otherwise open the next
    /// interval.
    async fn request_payment(&self, mut deal: ProviderDealState) -> Result<RevalidationResult> {
        let owed = payment_owed(&deal);
        if owed.is_zero() {
            deal.advance_interval();
            self.persist(&deal).await?;
            return Ok(RevalidationResult::proceed());
        }

        deal.status = match deal.status {
            DealStatus::Ongoing | DealStatus::Unsealed => DealStatus::FundsNeeded,
            DealStatus::BlocksComplete => DealStatus::FundsNeededLastPayment,
            DealStatus::New => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    deal = %deal.identifier(),
                    %owed,
                    "payment requested before the deal was accepted"
                );
                DealStatus::FundsNeededUnseal
            }
            other => other,
        };
        self.persist(&deal).await?;
        debug!(
            deal = %deal.identifier(),
            status = %deal.status,
            total_sent = deal.total_sent,
            %owed,
            "requesting payment"
        );
        Ok(RevalidationResult::pause(
            DealResponse::new(deal.proposal.id, deal.status).with_owed(owed),
        ))
    }

    /// Unlocked read of the non-terminal deal bound to `chid`.
    fn live_deal(&self, chid: &ChannelId) -> Result<Option<ProviderDealState>> {
        Ok(self
            .deals
            .by_channel(chid)?
            .filter(|d| !d.status.is_terminal()))
    }

    /// Lock the deal bound to `chid` and read it under the lock. `None` if
    /// there is no such deal or it has ended.
    async fn lock_live(
        &self,
        chid: &ChannelId,
    ) -> Result<Option<(OwnedMutexGuard<()>, ProviderDealState)>> {
        let Some(seen) = self.deals.by_channel(chid)? else {
            return Ok(None);
        };
        let id = seen.identifier();
        let guard = self.deals.lock(&id).await;
        let deal = self.deals.require(&id)?;
        if deal.status.is_terminal() {
            return Ok(None);
        }
        Ok(Some((guard, deal)))
    }

    /// Save, cancelling the deal if the write fails. The caller holds the
    /// deal's lock.
    async fn persist(&self, deal: &ProviderDealState) -> Result<()> {
        if let Err(e) = self.deals.save(deal) {
            let id = deal.identifier();
            warn!(deal = %id, error = %e, "failed to persist deal, cancelling");
            if let Err(cancel_err) = self.handler.cancel_locked(&id, String::new()).await {
                warn!(deal = %id, error = %cancel_err, "cancel after failed write also failed");
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PaymentRevalidator for Revalidator {
    async fn revalidate(
        &self,
        chid: ChannelId,
        voucher: &Voucher,
    ) -> Result<Option<RevalidationResult>> {
        if !voucher.is::<DealPayment>() {
            return Ok(None);
        }
        let payment = voucher.decode::<DealPayment>()?;
        self.process_payment(chid, payment).await.map(Some)
    }

    async fn on_pull_data_sent(
        &self,
        chid: ChannelId,
        additional: u64,
    ) -> Result<Option<RevalidationResult>> {
        self.record_data_sent(chid, additional).await.map(Some)
    }

    async fn on_complete(&self, chid: ChannelId) -> Result<Option<RevalidationResult>> {
        self.blocks_complete(chid).await.map(Some)
    }

    async fn on_data_limit_exceeded(&self, chid: ChannelId) -> Result<Option<RevalidationResult>> {
        self.data_limit_exceeded(chid).await.map(Some)
    }
}

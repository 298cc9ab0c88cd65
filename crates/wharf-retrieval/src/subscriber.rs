//! Routes transport events to the deal handler and the revalidators.

use std::sync::Arc;

use tracing::debug;
use wharf_types::{ChannelId, DealPayment, Voucher, VoucherError};

use crate::error::Result;
use crate::handler::DealHandler;
use crate::revalidator::PaymentRevalidator;
use crate::transfer::{RevalidationResult, TransferEvent};

enum Callback<'a> {
    DataSent(u64),
    Complete,
    LimitExceeded,
    Voucher(&'a Voucher),
}

/// Routes transport events to the deal handler and payment callbacks to the
/// revalidators.
pub struct EventSubscriber {
    handler: Arc<DealHandler>,
    /// Tried in order; the first that handles a callback wins.
    revalidators: Vec<Arc<dyn PaymentRevalidator>>,
}

impl EventSubscriber {
    pub fn new(handler: Arc<DealHandler>, revalidators: Vec<Arc<dyn PaymentRevalidator>>) -> Self {
        Self {
            handler,
            revalidators,
        }
    }

    /// Handle one transport event. Each event maps to exactly one call.
    pub async fn on_event(
        &self,
        chid: ChannelId,
        event: TransferEvent,
    ) -> Result<Option<RevalidationResult>> {
        debug!(channel = %chid, event = event.name(), "transfer event");
        match event {
            TransferEvent::Accept => self.handler.on_accept(chid).await.map(|_| None),
            TransferEvent::Disconnected { message } => {
                self.handler
                    .error_channel(chid, format!("data transfer disconnected: {message}"))
                    .await;
                Ok(None)
            }
            TransferEvent::Error { message } => {
                self.handler.error_channel(chid, message).await;
                Ok(None)
            }
            TransferEvent::DataLimitExceeded => self.dispatch(chid, Callback::LimitExceeded).await,
            TransferEvent::BeginFinalizing => self.dispatch(chid, Callback::Complete).await,
            TransferEvent::NewVoucher(voucher) => {
                match self.dispatch(chid, Callback::Voucher(&voucher)).await? {
                    Some(result) => Ok(Some(result)),
                    None => Err(VoucherError::WrongVoucherType {
                        expected: <DealPayment as wharf_types::VoucherType>::TYPE_ID,
                        actual: voucher.type_id.clone(),
                    }
                    .into()),
                }
            }
            TransferEvent::Cancel => self.handler.cancel_channel(chid).await.map(|_| None),
            TransferEvent::NewVoucherResult(response) => self
                .handler
                .on_voucher_result_sent(chid, &response)
                .await
                .map(|_| None),
            TransferEvent::Completed => self.handler.cleanup_channel(chid).await.map(|_| None),
        }
    }

    /// Offer `additional` sent bytes to the revalidators.
    pub async fn on_pull_data_sent(
        &self,
        chid: ChannelId,
        additional: u64,
    ) -> Result<Option<RevalidationResult>> {
        self.dispatch(chid, Callback::DataSent(additional)).await
    }

    /// Offer `callback` to each revalidator in turn until one handles it.
    async fn dispatch(
        &self,
        chid: ChannelId,
        callback: Callback<'_>,
    ) -> Result<Option<RevalidationResult>> {
        for revalidator in &self.revalidators {
            let handled = match &callback {
                Callback::DataSent(n) => revalidator.on_pull_data_sent(chid, *n).await?,
                Callback::Complete => revalidator.on_complete(chid).await?,
                Callback::LimitExceeded => revalidator.on_data_limit_exceeded(chid).await?,
                Callback::Voucher(voucher) => revalidator.revalidate(chid, voucher).await?,
            };
            if handled.is_some() {
                return Ok(handled);
            }
        }
        Ok(None)
    }
}

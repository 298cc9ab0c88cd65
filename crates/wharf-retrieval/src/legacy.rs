//! Previous-version payment vouchers.
//!
//! Legacy payments carry the same fields under a different voucher type.
//! They are unwrapped and credited through the current [`Revalidator`], so
//! one payment is never counted twice whichever version the client speaks.
//! Byte and completion callbacks are left to the current revalidator.

use std::sync::Arc;

use wharf_types::{ChannelId, LegacyDealPayment, Voucher};

use crate::error::Result;
use crate::revalidator::{PaymentRevalidator, Revalidator};
use crate::transfer::RevalidationResult;

/// Credits legacy payment vouchers through the current revalidator.
pub struct LegacyRevalidator {
    inner: Arc<Revalidator>,
}

impl LegacyRevalidator {
    pub fn new(inner: Arc<Revalidator>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl PaymentRevalidator for LegacyRevalidator {
    async fn revalidate(
        &self,
        chid: ChannelId,
        voucher: &Voucher,
    ) -> Result<Option<RevalidationResult>> {
        if !voucher.is::<LegacyDealPayment>() {
            return Ok(None);
        }
        let LegacyDealPayment(payment) = voucher.decode::<LegacyDealPayment>()?;
        self.inner.process_payment(chid, payment).await.map(Some)
    }

    async fn on_pull_data_sent(
        &self,
        _chid: ChannelId,
        _additional: u64,
    ) -> Result<Option<RevalidationResult>> {
        Ok(None)
    }

    async fn on_complete(&self, _chid: ChannelId) -> Result<Option<RevalidationResult>> {
        Ok(None)
    }

    async fn on_data_limit_exceeded(&self, _chid: ChannelId) -> Result<Option<RevalidationResult>> {
        Ok(None)
    }
}

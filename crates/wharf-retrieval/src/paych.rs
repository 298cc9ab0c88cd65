//! Payment-channel collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};
use wharf_types::{Address, SignedVoucher, TokenAmount};

use crate::error::{Result, RetrievalError};

/// Verifies and stores inbound payment vouchers.
#[async_trait::async_trait]
pub trait PaymentChannel: Send + Sync {
    /// Store `voucher` for `channel` and return the amount it newly credits.
    ///
    /// Vouchers carry cumulative lane amounts, so re-submitting a voucher
    /// already seen credits nothing. Fails when the credit is below
    /// `min_expected`.
    async fn add_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        proof: &[u8],
        min_expected: TokenAmount,
    ) -> Result<TokenAmount>;
}

/// In-process voucher ledger tracking the best amount per (channel, lane).
///
/// Signatures are not checked; the node trusts whatever settles the
/// channel on chain to do so.
#[derive(Default)]
pub struct VoucherLedger {
    lanes: Mutex<HashMap<(Address, u64), LaneState>>,
}

#[derive(Debug, Clone, Copy)]
struct LaneState {
    nonce: u64,
    redeemed: TokenAmount,
}

impl VoucherLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total redeemable amount across every lane of `channel`.
    pub fn channel_total(&self, channel: &Address) -> TokenAmount {
        self.lanes
            .lock()
            .expect("voucher ledger lock poisoned")
            .iter()
            .filter(|((addr, _), _)| addr == channel)
            .fold(TokenAmount::ZERO, |acc, (_, lane)| acc + lane.redeemed)
    }
}

#[async_trait::async_trait]
impl PaymentChannel for VoucherLedger {
    async fn add_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        _proof: &[u8],
        min_expected: TokenAmount,
    ) -> Result<TokenAmount> {
        if voucher.channel_addr != *channel {
            return Err(RetrievalError::Payment(format!(
                "voucher is for channel {}, not {channel}",
                voucher.channel_addr
            )));
        }

        let mut lanes = self.lanes.lock().expect("voucher ledger lock poisoned");
        let lane = lanes.entry((*channel, voucher.lane)).or_insert(LaneState {
            nonce: 0,
            redeemed: TokenAmount::ZERO,
        });
        if voucher.amount <= lane.redeemed {
            debug!(%channel, lane = voucher.lane, amount = %voucher.amount, "voucher adds nothing");
            return Ok(TokenAmount::ZERO);
        }
        if voucher.nonce < lane.nonce {
            warn!(%channel, lane = voucher.lane, nonce = voucher.nonce, "stale voucher nonce");
            return Err(RetrievalError::Payment(format!(
                "voucher nonce {} below lane nonce {}",
                voucher.nonce, lane.nonce
            )));
        }

        let delta = voucher.amount.saturating_sub(lane.redeemed);
        if delta < min_expected {
            return Err(RetrievalError::Payment(format!(
                "voucher credits {delta}, expected at least {min_expected}"
            )));
        }
        lane.nonce = voucher.nonce;
        lane.redeemed = voucher.amount;
        debug!(%channel, lane = voucher.lane, credited = %delta, "voucher accepted");
        Ok(delta)
    }
}

//! Data-transfer collaborator: the contract between the retrieval provider
//! and whatever moves blocks to the client.
//!
//! The transport calls into the provider with [`TransferEvent`]s and
//! byte-count callbacks; the provider answers with [`TransferAction`]s and
//! drives the transport through [`DataTransfer`].

use wharf_types::{ChannelId, DealResponse, Voucher};

/// Errors reported by a [`DataTransfer`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    /// The channel already finished or was cancelled.
    #[error("channel {0} already terminated")]
    AlreadyTerminated(ChannelId),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Operations the provider needs from the transport.
#[async_trait::async_trait]
pub trait DataTransfer: Send + Sync {
    /// Announce a voucher type this node understands.
    async fn register_voucher_type(&self, type_id: &'static str) -> Result<(), TransferError>;

    /// Stop sending on `chid` until it is resumed.
    async fn pause(&self, chid: ChannelId) -> Result<(), TransferError>;

    /// Restart a paused channel.
    async fn resume(&self, chid: ChannelId) -> Result<(), TransferError>;

    /// Terminate the channel. Closing an already closed channel fails with
    /// [`TransferError::AlreadyTerminated`].
    async fn close(&self, chid: ChannelId) -> Result<(), TransferError>;

    /// Deliver `response` to the client as a voucher result.
    async fn send_voucher_result(
        &self,
        chid: ChannelId,
        response: DealResponse,
    ) -> Result<(), TransferError>;
}

/// Events raised by the transport for a channel.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Accept,
    Disconnected { message: String },
    Error { message: String },
    /// The transport stopped at the data limit granted so far.
    DataLimitExceeded,
    /// Every block has been queued; the transfer waits for finalization.
    BeginFinalizing,
    NewVoucher(Voucher),
    Cancel,
    /// A voucher result was delivered to the client.
    NewVoucherResult(DealResponse),
    Completed,
}

impl TransferEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
            Self::DataLimitExceeded => "data_limit_exceeded",
            Self::BeginFinalizing => "begin_finalizing",
            Self::NewVoucher(_) => "new_voucher",
            Self::Cancel => "cancel",
            Self::NewVoucherResult(_) => "new_voucher_result",
            Self::Completed => "completed",
        }
    }
}

/// What the transport should do with a channel after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    /// Keep going as before.
    Continue,
    Pause,
    Resume,
    /// Nothing more is owed; finish the transfer.
    Complete,
}

/// Outcome of a payment callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevalidationResult {
    /// What the transport should do next.
    pub action: TransferAction,
    /// Voucher result to send to the client, if any.
    pub response: Option<DealResponse>,
}

impl RevalidationResult {
    /// Carry on with nothing to tell the client.
    pub fn proceed() -> Self {
        Self {
            action: TransferAction::Continue,
            response: None,
        }
    }

    /// Pause the channel and tell the client what it owes.
    pub fn pause(response: DealResponse) -> Self {
        Self {
            action: TransferAction::Pause,
            response: Some(response),
        }
    }

    pub fn resume(response: Option<DealResponse>) -> Self {
        Self {
            action: TransferAction::Resume,
            response,
        }
    }

    /// Finish the transfer after sending the final response.
    pub fn complete(response: DealResponse) -> Self {
        Self {
            action: TransferAction::Complete,
            response: Some(response),
        }
    }
}

/// Outcome of validating a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// False when the request was rejected. `response` then says why.
    pub accepted: bool,
    pub response: Option<DealResponse>,
    /// Hold the transfer until the deal pipeline resumes it.
    pub force_pause: bool,
    /// The transfer needs a final payment round before it may complete.
    pub requires_finalization: bool,
}

/// Drive `transport` according to a callback outcome.
pub async fn apply(
    transport: &dyn DataTransfer,
    chid: ChannelId,
    result: &RevalidationResult,
) -> Result<(), TransferError> {
    if let Some(response) = &result.response {
        transport.send_voucher_result(chid, response.clone()).await?;
    }
    match result.action {
        TransferAction::Continue | TransferAction::Complete => Ok(()),
        TransferAction::Pause => transport.pause(chid).await,
        TransferAction::Resume => transport.resume(chid).await,
    }
}

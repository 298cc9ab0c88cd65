//! Data-transfer endpoint for the Wharf daemon.
//!
//! The daemon ships without a graphsync-style block transport: channels are
//! opened by whatever embeds the provider. [`LocalTransfer`] is the
//! provider-facing side of that arrangement. It keeps the per-channel state
//! the provider drives (paused, running, closed) and logs every voucher
//! result that would go to the client, so the node can be run and observed
//! on its own.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info};
use wharf_retrieval::{DataTransfer, TransferError};
use wharf_types::{ChannelId, DealResponse};

/// Where the provider last left a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Running,
    Paused,
    Closed,
}

#[derive(Default)]
struct Inner {
    voucher_types: HashSet<&'static str>,
    channels: HashMap<ChannelId, ChannelState>,
}

/// In-process [`DataTransfer`] that records channel state and logs voucher
/// results.
#[derive(Default)]
pub struct LocalTransfer {
    inner: Mutex<Inner>,
}

impl fmt::Debug for LocalTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransfer").finish_non_exhaustive()
    }
}

impl LocalTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for a channel the provider never touched.
    pub fn channel_state(&self, chid: &ChannelId) -> Option<ChannelState> {
        self.inner
            .lock()
            .expect("transfer state lock poisoned")
            .channels
            .get(chid)
            .copied()
    }

    /// Registered voucher types, sorted.
    pub fn voucher_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self
            .inner
            .lock()
            .expect("transfer state lock poisoned")
            .voucher_types
            .iter()
            .copied()
            .collect();
        types.sort_unstable();
        types
    }

    fn transition(&self, chid: ChannelId, next: ChannelState) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().expect("transfer state lock poisoned");
        let state = inner.channels.entry(chid).or_insert(ChannelState::Running);
        if *state == ChannelState::Closed {
            return Err(TransferError::AlreadyTerminated(chid));
        }
        *state = next;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DataTransfer for LocalTransfer {
    async fn register_voucher_type(&self, type_id: &'static str) -> Result<(), TransferError> {
        let added = self
            .inner
            .lock()
            .expect("transfer state lock poisoned")
            .voucher_types
            .insert(type_id);
        if added {
            debug!(type_id, "registered voucher type");
        }
        Ok(())
    }

    async fn pause(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.transition(chid, ChannelState::Paused)?;
        debug!(channel = %chid, "channel paused");
        Ok(())
    }

    async fn resume(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.transition(chid, ChannelState::Running)?;
        debug!(channel = %chid, "channel resumed");
        Ok(())
    }

    async fn close(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.transition(chid, ChannelState::Closed)?;
        info!(channel = %chid, "channel closed");
        Ok(())
    }

    async fn send_voucher_result(
        &self,
        chid: ChannelId,
        response: DealResponse,
    ) -> Result<(), TransferError> {
        if self.channel_state(&chid) == Some(ChannelState::Closed) {
            return Err(TransferError::AlreadyTerminated(chid));
        }
        info!(
            channel = %chid,
            deal_id = %response.id,
            status = %response.status,
            owed = %response.payment_owed,
            message = %response.message,
            "voucher result"
        );
        Ok(())
    }
}

//! Persisted retrieval deals.
//!
//! [`DealStore`] is the only writer of [`ProviderDealState`] records. Every
//! write is checked against the stored record: terminal deals are frozen,
//! and `total_sent` / `funds_received` never decrease. Each successful write
//! emits a [`DealUpdated`] event.
//!
//! Writers that read a deal, await something and then save it hold the
//! deal's lock from [`DealStore::lock`] across the read and the save, so
//! two events on one deal never interleave their updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use wharf_meta::MetaStore;
use wharf_types::events::{DealUpdated, EventBus};
use wharf_types::{ChannelId, ProviderDealIdentifier, ProviderDealState};

use crate::error::{Result, RetrievalError};

/// Handle on the persisted deal records. Clones share the channel index and
/// the per-deal locks.
#[derive(Clone)]
pub struct DealStore {
    meta: Arc<MetaStore>,
    events: EventBus,
    /// Channel → deal, filled on write and on lookup misses.
    channels: Arc<Mutex<HashMap<ChannelId, ProviderDealIdentifier>>>,
    /// One write lock per live deal. Dropped once the deal is terminal.
    locks: Arc<Mutex<HashMap<ProviderDealIdentifier, Arc<AsyncMutex<()>>>>>,
}

impl DealStore {
    /// Deals are read from and written to `meta`. Every save is announced on
    /// `events` as a [`DealUpdated`](wharf_types::events::DealUpdated).
    pub fn new(meta: Arc<MetaStore>, events: EventBus) -> Self {
        Self {
            meta,
            events,
            channels: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive write access to deal `id`.
    ///
    /// Re-read the deal after acquiring the guard; the copy read before may
    /// be stale. The lock is not reentrant.
    pub async fn lock(&self, id: &ProviderDealIdentifier) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .expect("deal lock table poisoned")
            .entry(*id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// The stored deal, or `None` if it was never saved.
    pub fn get(&self, id: &ProviderDealIdentifier) -> Result<Option<ProviderDealState>> {
        Ok(self.meta.get_retrieval_deal(id)?)
    }

    /// Like [`get`](Self::get) but a missing deal is an error.
    pub fn require(&self, id: &ProviderDealIdentifier) -> Result<ProviderDealState> {
        self.get(id)?.ok_or(RetrievalError::DealNotFound(*id))
    }

    /// The deal bound to a data-transfer channel, if any.
    pub fn by_channel(&self, chid: &ChannelId) -> Result<Option<ProviderDealState>> {
        let cached = self
            .channels
            .lock()
            .expect("channel index lock poisoned")
            .get(chid)
            .copied();
        if let Some(id) = cached {
            return self.get(&id);
        }

        // Not seen since startup: scan the receiver's deals.
        let found = self
            .meta
            .list_retrieval_deals_for(&chid.initiator)?
            .into_iter()
            .find(|d| d.channel_id.as_ref() == Some(chid));
        if let Some(deal) = &found {
            self.index_channel(deal);
        }
        Ok(found)
    }

    /// Like [`by_channel`](Self::by_channel) but an unbound channel is an
    /// error.
    pub fn require_by_channel(&self, chid: &ChannelId) -> Result<ProviderDealState> {
        self.by_channel(chid)?
            .ok_or(RetrievalError::UnknownChannel(*chid))
    }

    /// Every stored deal, in key order.
    pub fn list(&self) -> Result<Vec<ProviderDealState>> {
        Ok(self.meta.list_retrieval_deals()?)
    }

    /// Write `deal`, enforcing the update rules against the stored copy.
    pub fn save(&self, deal: &ProviderDealState) -> Result<()> {
        let id = deal.identifier();
        if let Some(prev) = self.get(&id)? {
            if prev.status.is_terminal() && prev != *deal {
                return Err(RetrievalError::TerminalDeal {
                    deal: id,
                    status: prev.status,
                });
            }
            if deal.total_sent < prev.total_sent {
                return Err(RetrievalError::AccountingRegression {
                    deal: id,
                    field: "total_sent",
                });
            }
            if deal.funds_received < prev.funds_received {
                return Err(RetrievalError::AccountingRegression {
                    deal: id,
                    field: "funds_received",
                });
            }
        }

        self.meta.put_retrieval_deal(deal)?;
        self.index_channel(deal);
        if deal.status.is_terminal() {
            // Frozen from here on.
            self.locks.lock().expect("deal lock table poisoned").remove(&id);
        }
        debug!(
            deal = %id,
            status = %deal.status,
            total_sent = deal.total_sent,
            funds = %deal.funds_received,
            "deal saved"
        );
        self.events.emit(DealUpdated {
            deal: id,
            status: deal.status,
            message: deal.message.clone(),
        });
        Ok(())
    }

    /// Remember which deal owns the deal's channel, if it has one yet.
    fn index_channel(&self, deal: &ProviderDealState) {
        if let Some(chid) = deal.channel_id {
            self.channels
                .lock()
                .expect("channel index lock poisoned")
                .insert(chid, deal.identifier());
        }
    }
}

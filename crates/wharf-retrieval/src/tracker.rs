//! Open shard accessors per retrieval deal.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;
use wharf_dagstore::{ReadOnlyBlockstore, ShardAccessor};
use wharf_types::ProviderDealIdentifier;

/// Errors returned by [`ReadOnlyBlockstoreTracker`].
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("no blockstore tracked for deal {0}")]
    NotFound(ProviderDealIdentifier),

    /// The deal already holds an accessor. The new one was not kept.
    #[error("a blockstore is already tracked for deal {0}")]
    AlreadyTracked(ProviderDealIdentifier),
}

/// Keeps each deal's shard accessor open while its transfer runs. Dropping
/// an entry releases the shard.
#[derive(Default)]
pub struct ReadOnlyBlockstoreTracker {
    accessors: Mutex<HashMap<ProviderDealIdentifier, ShardAccessor>>,
}

impl ReadOnlyBlockstoreTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of the accessor serving `deal`. A deal holds at most one
    /// accessor; tracking a second fails with [`TrackerError::AlreadyTracked`].
    pub fn track(
        &self,
        deal: ProviderDealIdentifier,
        accessor: ShardAccessor,
    ) -> Result<(), TrackerError> {
        let mut accessors = self.accessors.lock().expect("tracker lock poisoned");
        if accessors.contains_key(&deal) {
            return Err(TrackerError::AlreadyTracked(deal));
        }
        debug!(%deal, shard = %accessor.key(), "tracking blockstore");
        accessors.insert(deal, accessor);
        Ok(())
    }

    /// Release the deal's accessor.
    pub fn untrack(&self, deal: &ProviderDealIdentifier) -> Result<(), TrackerError> {
        let accessor = self
            .accessors
            .lock()
            .expect("tracker lock poisoned")
            .remove(deal)
            .ok_or(TrackerError::NotFound(*deal))?;
        debug!(%deal, shard = %accessor.key(), "released blockstore");
        accessor.close();
        Ok(())
    }

    /// Blockstore of the accessor tracked for `deal`.
    pub fn get(&self, deal: &ProviderDealIdentifier) -> Result<ReadOnlyBlockstore, TrackerError> {
        self.accessors
            .lock()
            .expect("tracker lock poisoned")
            .get(deal)
            .map(ShardAccessor::blockstore)
            .ok_or(TrackerError::NotFound(*deal))
    }

    /// Number of deals with an open accessor.
    pub fn len(&self) -> usize {
        self.accessors.lock().expect("tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

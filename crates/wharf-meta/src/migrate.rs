//! Ordered schema migrations.
//!
//! Each [`MigrationStep`] upgrades the store from schema `from` to `from + 1`.
//! [`run`] applies every step whose `from` matches the current marker, in
//! order. The marker is advanced before a step runs and put back to `from`
//! if the step fails, so a failed upgrade is retried on the next open.

use tracing::{info, warn};

use crate::{MetaError, MetaStore};

/// Schema version produced by the current build.
pub const SCHEMA_VERSION: u32 = 1;

/// Entry in [`MIGRATIONS`].
pub struct MigrationStep {
    pub from: u32,
    pub description: &'static str,
    /// Must be safe to rerun if a previous attempt stopped halfway.
    pub apply: fn(&MetaStore) -> Result<(), MetaError>,
}

/// The schedule applied at open time.
pub const MIGRATIONS: &[MigrationStep] = &[MigrationStep {
    from: 0,
    description: "index storage deals by piece cid",
    apply: backfill_piece_index,
}];

/// Apply pending steps and return the resulting schema version.
pub fn run(store: &MetaStore, steps: &[MigrationStep]) -> Result<u32, MetaError> {
    let mut version = store.schema_version()?;
    for step in steps {
        if step.from != version {
            continue;
        }
        store.set_schema_version(step.from + 1)?;
        if let Err(e) = (step.apply)(store) {
            warn!(from = step.from, step = step.description, error = %e, "migration failed");
            store.set_schema_version(step.from)?;
            return Err(MetaError::Migration {
                from: step.from,
                reason: e.to_string(),
            });
        }
        version = step.from + 1;
        info!(version, step = step.description, "applied schema migration");
    }
    Ok(version)
}

fn backfill_piece_index(store: &MetaStore) -> Result<(), MetaError> {
    for deal in store.list_miner_deals()? {
        store.index_piece(&deal)?;
    }
    Ok(())
}

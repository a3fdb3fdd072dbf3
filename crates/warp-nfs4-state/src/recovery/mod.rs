//! Client recovery ledger
//!
//! The ledger remembers which client identities held confirmed state in the
//! previous server instance. After a restart those clients, and only those,
//! may reclaim state until the reclaim window is closed.
//!
//! ```text
//!   open ──► NORMAL (reclaim window open) ──reclaim_complete()──► CLOSED
//! ```
//!
//! In CLOSED every `want_reclaim` fails with `NoGrace`.

mod ephemeral;
mod sled_store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StateConfig;
use crate::error::NfsResult;

pub use ephemeral::EphemeralClientStore;
pub use sled_store::SledClientStore;

/// Persisted value of a ledger entry, keyed by client owner id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// When the client first confirmed state in its epoch
    pub created_at: DateTime<Utc>,
}

impl RecoveryRecord {
    /// Record stamped with the current time
    pub fn now() -> Self {
        Self {
            created_at: Utc::now(),
        }
    }
}

/// Durable set of client identities that may reclaim after a restart
pub trait ClientRecoveryStore: Send + Sync {
    /// Record that `client` holds state in this epoch
    fn add_client(&self, client: &[u8]) -> NfsResult<()>;

    /// Forget `client` (graceful removal)
    fn remove_client(&self, client: &[u8]) -> NfsResult<()>;

    /// Check whether `client` may reclaim state
    ///
    /// Fails with `ReclaimBad` if the client was not known to the previous
    /// epoch, and with `NoGrace` once the reclaim window is closed.
    fn want_reclaim(&self, client: &[u8]) -> NfsResult<()>;

    /// `client` finished reclaiming its state
    fn reclaim_client(&self, client: &[u8]) -> NfsResult<()>;

    /// Close the reclaim window for this epoch
    fn reclaim_complete(&self) -> NfsResult<()>;

    /// Whether any client of the previous epoch has yet to reclaim
    fn waiting_for_reclaim(&self) -> bool;

    /// Flush and release the store
    fn close(&self) -> NfsResult<()>;
}

/// Open the ledger selected by `config`
///
/// A configured directory gets a durable sled ledger; without one the
/// ledger lives in memory and there is never anything to reclaim.
pub fn open_store(config: &StateConfig) -> NfsResult<Arc<dyn ClientRecoveryStore>> {
    match &config.recovery_dir {
        Some(dir) => Ok(Arc::new(SledClientStore::open(dir)?)),
        None => {
            info!("no recovery directory configured, using in-memory client ledger");
            Ok(Arc::new(EphemeralClientStore::new()))
        }
    }
}

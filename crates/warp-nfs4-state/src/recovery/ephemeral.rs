//! In-memory ledger for servers without a recovery directory

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use super::{ClientRecoveryStore, RecoveryRecord};
use crate::error::{NfsError, NfsResult};

/// Ledger that forgets everything on restart
///
/// There is never a previous epoch, so no client may reclaim and nobody is
/// waited for.
#[derive(Debug, Default)]
pub struct EphemeralClientStore {
    clients: DashMap<Vec<u8>, RecoveryRecord>,
    closed: AtomicBool,
}

impl EphemeralClientStore {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is recorded
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClientRecoveryStore for EphemeralClientStore {
    fn add_client(&self, client: &[u8]) -> NfsResult<()> {
        self.clients.insert(client.to_vec(), RecoveryRecord::now());
        Ok(())
    }

    fn remove_client(&self, client: &[u8]) -> NfsResult<()> {
        self.clients.remove(client);
        Ok(())
    }

    fn want_reclaim(&self, client: &[u8]) -> NfsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NfsError::NoGrace("reclaim window closed".to_string()));
        }
        Err(NfsError::ReclaimBad(format!(
            "client {} had no state before restart",
            String::from_utf8_lossy(client)
        )))
    }

    fn reclaim_client(&self, _client: &[u8]) -> NfsResult<()> {
        Ok(())
    }

    fn reclaim_complete(&self) -> NfsResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn waiting_for_reclaim(&self) -> bool {
        false
    }

    fn close(&self) -> NfsResult<()> {
        Ok(())
    }
}

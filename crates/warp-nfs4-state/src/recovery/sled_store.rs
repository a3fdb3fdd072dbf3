//! Ledger backed by sled

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use super::{ClientRecoveryStore, RecoveryRecord};
use crate::error::{NfsError, NfsResult};

/// Clients holding state in the running epoch
const CURRENT_TREE: &str = "current";
/// Clients of earlier epochs allowed to reclaim
const RECLAIM_TREE: &str = "reclaim";

/// Durable ledger
///
/// On open, the `current` tree of the previous instance is folded into
/// `reclaim` and emptied. The fold is idempotent, so a crash half way
/// through is repaired by the next open.
pub struct SledClientStore {
    db: sled::Db,
    current: sled::Tree,
    reclaim: sled::Tree,
    closed: AtomicBool,
}

impl SledClientStore {
    /// Open or create the ledger at `path`
    ///
    /// # Errors
    ///
    /// Any storage failure is returned as `NfsError::Storage`; the server
    /// must not start without a readable ledger.
    pub fn open(path: impl AsRef<Path>) -> NfsResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| NfsError::Storage(format!("Failed to open client ledger: {e}")))?;
        let current = db
            .open_tree(CURRENT_TREE)
            .map_err(|e| NfsError::Storage(format!("Failed to open current tree: {e}")))?;
        let reclaim = db
            .open_tree(RECLAIM_TREE)
            .map_err(|e| NfsError::Storage(format!("Failed to open reclaim tree: {e}")))?;

        let mut carried = 0usize;
        for entry in current.iter() {
            let (key, value) =
                entry.map_err(|e| NfsError::Storage(format!("Failed to read ledger: {e}")))?;
            reclaim
                .insert(key, value)
                .map_err(|e| NfsError::Storage(format!("Failed to carry client over: {e}")))?;
            carried += 1;
        }
        reclaim
            .flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush reclaim tree: {e}")))?;
        current
            .clear()
            .map_err(|e| NfsError::Storage(format!("Failed to reset current tree: {e}")))?;
        db.flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush client ledger: {e}")))?;

        info!(
            path = %path.as_ref().display(),
            carried,
            reclaimable = reclaim.len(),
            "Opened client ledger"
        );

        Ok(Self {
            db,
            current,
            reclaim,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of clients that may still reclaim
    pub fn reclaimable(&self) -> usize {
        self.reclaim.len()
    }
}

impl ClientRecoveryStore for SledClientStore {
    fn add_client(&self, client: &[u8]) -> NfsResult<()> {
        let data = rmp_serde::to_vec(&RecoveryRecord::now())
            .map_err(|e| NfsError::Storage(format!("Failed to encode ledger record: {e}")))?;
        self.current
            .insert(client, data)
            .map_err(|e| NfsError::Storage(format!("Failed to record client: {e}")))?;
        self.current
            .flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush current tree: {e}")))?;
        debug!(client = ?String::from_utf8_lossy(client), "client recorded in ledger");
        Ok(())
    }

    fn remove_client(&self, client: &[u8]) -> NfsResult<()> {
        self.current
            .remove(client)
            .map_err(|e| NfsError::Storage(format!("Failed to remove client: {e}")))?;
        self.reclaim
            .remove(client)
            .map_err(|e| NfsError::Storage(format!("Failed to remove client: {e}")))?;
        self.db
            .flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush client ledger: {e}")))?;
        Ok(())
    }

    fn want_reclaim(&self, client: &[u8]) -> NfsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NfsError::NoGrace("reclaim window closed".to_string()));
        }
        let known = self
            .reclaim
            .get(client)
            .map_err(|e| NfsError::Storage(format!("Failed to read ledger: {e}")))?;
        match known {
            Some(data) => {
                if let Ok(record) = rmp_serde::from_slice::<RecoveryRecord>(&data) {
                    debug!(created_at = %record.created_at, "reclaim accepted");
                }
                Ok(())
            }
            None => Err(NfsError::ReclaimBad(format!(
                "client {} had no state before restart",
                String::from_utf8_lossy(client)
            ))),
        }
    }

    fn reclaim_client(&self, client: &[u8]) -> NfsResult<()> {
        self.reclaim
            .remove(client)
            .map_err(|e| NfsError::Storage(format!("Failed to update reclaim tree: {e}")))?;
        Ok(())
    }

    fn reclaim_complete(&self) -> NfsResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let dropped = self.reclaim.len();
        self.reclaim
            .clear()
            .map_err(|e| NfsError::Storage(format!("Failed to clear reclaim tree: {e}")))?;
        self.db
            .flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush client ledger: {e}")))?;
        info!(dropped, "reclaim window closed");
        Ok(())
    }

    fn waiting_for_reclaim(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.reclaim.is_empty()
    }

    fn close(&self) -> NfsResult<()> {
        self.db
            .flush()
            .map_err(|e| NfsError::Storage(format!("Failed to flush client ledger: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ledger_waits_for_nobody() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledClientStore::open(dir.path()).unwrap();
        assert!(!store.waiting_for_reclaim());
        assert_eq!(store.reclaimable(), 0);
    }

    #[test]
    fn test_reclaimed_clients_stop_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledClientStore::open(dir.path()).unwrap();
            store.add_client(b"a").unwrap();
            store.add_client(b"b").unwrap();
            store.close().unwrap();
        }

        let store = SledClientStore::open(dir.path()).unwrap();
        assert!(store.waiting_for_reclaim());
        store.reclaim_client(b"a").unwrap();
        assert!(store.waiting_for_reclaim());
        store.reclaim_client(b"b").unwrap();
        assert!(!store.waiting_for_reclaim());
    }

    #[test]
    fn test_unreclaimed_clients_survive_a_second_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledClientStore::open(dir.path()).unwrap();
            store.add_client(b"a").unwrap();
            store.close().unwrap();
        }
        {
            // restart again before the window closed
            let store = SledClientStore::open(dir.path()).unwrap();
            store.close().unwrap();
        }
        let store = SledClientStore::open(dir.path()).unwrap();
        assert!(store.want_reclaim(b"a").is_ok());
    }
}

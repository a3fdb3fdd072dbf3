//! Registry of NFSv4 clients
//!
//! The [`StateHandler`] owns every [`Nfs4Client`] of one server instance,
//! resolves client ids and stateids, runs the lease sweeper and gates
//! requests on the post-restart grace period.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::{ClientIdentity, Nfs4Client, StateRecord};
use crate::config::StateConfig;
use crate::error::{NfsError, NfsResult};
use crate::file_tracker::FileTracker;
use crate::recovery::{self, ClientRecoveryStore};
use crate::stateid::StateId;
use crate::types::{ClientId, Principal, Verifier};
use crate::vfs::OpenCloseTracker;

/// Client registry of one server instance
pub struct StateHandler {
    config: StateConfig,
    instance: u32,
    next_client: AtomicU32,
    clients: DashMap<ClientId, Arc<Nfs4Client>>,
    by_owner: DashMap<Bytes, Arc<Nfs4Client>>,
    tracker: Arc<FileTracker>,
    store: Arc<dyn ClientRecoveryStore>,
    grace_until: RwLock<Option<Instant>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandler")
            .field("instance", &self.instance)
            .field("clients", &self.clients.len())
            .field("in_grace", &self.in_grace_period())
            .finish()
    }
}

impl StateHandler {
    /// Open the configured recovery ledger and build a registry around it
    ///
    /// # Errors
    ///
    /// Fails if the ledger cannot be opened; the server must not start.
    pub fn open(config: StateConfig, hook: Arc<dyn OpenCloseTracker>) -> NfsResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| NfsError::Config(e.to_string()))?;
        let store = recovery::open_store(&config)?;
        let tracker = Arc::new(FileTracker::new(&config, hook));
        Ok(Arc::new(Self::new(config, store, tracker)))
    }

    /// Build a registry from its parts
    pub fn new(
        config: StateConfig,
        store: Arc<dyn ClientRecoveryStore>,
        tracker: Arc<FileTracker>,
    ) -> Self {
        // random per start: ids of an earlier instance never resolve, even
        // after a restart within the same second
        let instance = rand::random::<u32>();
        let grace_until = store
            .waiting_for_reclaim()
            .then(|| Instant::now() + config.grace_duration());
        let (shutdown, _) = broadcast::channel(1);

        info!(
            instance,
            grace = grace_until.is_some(),
            lease_secs = config.lease_time_secs,
            "NFSv4 state handler started"
        );

        Self {
            config,
            instance,
            next_client: AtomicU32::new(1),
            clients: DashMap::new(),
            by_owner: DashMap::new(),
            tracker,
            store,
            grace_until: RwLock::new(grace_until),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Server instance id carried in client ids
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Configuration in effect
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// File tracker shared by all clients
    pub fn file_tracker(&self) -> &Arc<FileTracker> {
        &self.tracker
    }

    /// Recovery ledger
    pub fn recovery_store(&self) -> &Arc<dyn ClientRecoveryStore> {
        &self.store
    }

    /// Register a new client record
    ///
    /// A record already registered under the same `owner_id` is replaced
    /// and its state released. Unless the call comes from a recovery path,
    /// the owner id is written to the recovery ledger.
    #[allow(clippy::too_many_arguments)]
    pub fn create_client(
        &self,
        remote: SocketAddr,
        local: SocketAddr,
        minor_version: u32,
        owner_id: Bytes,
        verifier: Verifier,
        principal: Principal,
        call_from_recovery: bool,
    ) -> NfsResult<Arc<Nfs4Client>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NfsError::Delay("state handler is closed".to_string()));
        }

        let counter = self.next_client.fetch_add(1, Ordering::Relaxed);
        let id = ClientId::compose(self.instance, counter);
        let client = Arc::new(Nfs4Client::new(
            id,
            ClientIdentity {
                owner_id: owner_id.clone(),
                verifier,
                principal,
                remote,
                local,
                minor_version,
            },
            self.config.lease_duration(),
        ));

        // registered by id before it becomes reachable by owner id; the
        // record it displaces leaves the id map while the owner slot is held
        self.clients.insert(id, client.clone());
        let replaced = match self.by_owner.entry(owner_id.clone()) {
            Entry::Occupied(mut slot) => {
                let old = slot.insert(client.clone());
                self.clients.remove(&old.id());
                Some(old)
            }
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
                None
            }
        };

        if let Some(old) = replaced {
            debug!(old = %old.id(), new = %id, "client record replaced");
            self.release(&old);
        }

        if !call_from_recovery {
            if let Err(e) = self.store.add_client(&owner_id) {
                self.clients.remove(&id);
                self.by_owner
                    .remove_if(&owner_id, |_, current| Arc::ptr_eq(current, &client));
                return Err(e);
            }
        }

        info!(client_id = %id, %remote, minor_version, "client created");
        Ok(client)
    }

    /// Client registered under the client-supplied `owner_id`
    pub fn client_by_owner(&self, owner_id: &[u8]) -> Option<Arc<Nfs4Client>> {
        self.by_owner.get(owner_id).map(|c| c.value().clone())
    }

    /// Client with server id `id`
    pub fn get_client(&self, id: ClientId) -> NfsResult<Arc<Nfs4Client>> {
        self.clients
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| NfsError::StaleClientid(id.to_string()))
    }

    /// Confirmed client with server id `id`
    pub fn get_confirmed_client(&self, id: ClientId) -> NfsResult<Arc<Nfs4Client>> {
        let client = self.get_client(id)?;
        if !client.is_confirmed() {
            return Err(NfsError::StaleClientid(format!("{id} is not confirmed")));
        }
        Ok(client)
    }

    /// Remove a client and everything it holds
    pub fn remove_client(&self, client: &Nfs4Client) -> NfsResult<()> {
        self.clients.remove(&client.id());
        self.by_owner
            .remove_if(client.owner_id(), |_, current| current.id() == client.id());
        self.release(client);
        self.store.remove_client(client.owner_id())?;
        info!(client_id = %client.id(), "client removed");
        Ok(())
    }

    /// Drop every open, lock and delegation of `client` but keep it registered
    pub fn reset_client(&self, client: &Nfs4Client) -> usize {
        let released = self.tracker.release_client(client);
        client.reset();
        released
    }

    fn release(&self, client: &Nfs4Client) {
        client.dispose();
        self.tracker.release_client(client);
        client.reset();
        client.set_callback(None);
    }

    /// Renew the lease of a confirmed client
    pub fn update_client_lease(&self, id: ClientId) -> NfsResult<Arc<Nfs4Client>> {
        let client = self.get_confirmed_client(id)?;
        client.update_lease_time()?;
        Ok(client)
    }

    /// Resolve a stateid to its client and state
    ///
    /// Special stateids carry no state and are rejected as bad; callers
    /// accept them for read-only operations before resolving.
    pub fn resolve_state(&self, stateid: &StateId) -> NfsResult<(Arc<Nfs4Client>, StateRecord)> {
        if stateid.is_special() {
            return Err(NfsError::BadStateid(format!("special stateid {stateid}")));
        }
        let client = self
            .clients
            .get(&stateid.client_id())
            .map(|c| c.value().clone())
            .ok_or_else(|| NfsError::StaleStateid(stateid.to_string()))?;
        let record = client.state(stateid)?;
        Ok((client, record))
    }

    /// Resolve a stateid presented to a read-only operation
    ///
    /// Special stateids are accepted there and resolve to `None`.
    pub fn resolve_for_read(
        &self,
        stateid: &StateId,
    ) -> NfsResult<Option<(Arc<Nfs4Client>, StateRecord)>> {
        if stateid.is_special() {
            return Ok(None);
        }
        self.resolve_state(stateid).map(Some)
    }

    /// Snapshot of all registered clients
    pub fn clients(&self) -> Vec<Arc<Nfs4Client>> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    /// Whether the post-restart grace period is in effect
    pub fn in_grace_period(&self) -> bool {
        match *self.grace_until.read() {
            Some(deadline) => Instant::now() < deadline && self.store.waiting_for_reclaim(),
            None => false,
        }
    }

    /// Gate a request on the grace period
    ///
    /// Reclaims are only allowed during grace, everything else only
    /// outside of it.
    pub fn check_grace(&self, reclaim: bool) -> NfsResult<()> {
        match (reclaim, self.in_grace_period()) {
            (true, false) => Err(NfsError::NoGrace("grace period is over".to_string())),
            (false, true) => Err(NfsError::Grace),
            _ => Ok(()),
        }
    }

    /// Check that `client` may reclaim state
    pub fn want_reclaim(&self, client: &Nfs4Client) -> NfsResult<()> {
        self.check_grace(true)?;
        self.store.want_reclaim(client.owner_id())
    }

    /// `client` finished reclaiming
    ///
    /// Ends the grace period once nobody is left to reclaim.
    pub fn reclaim_complete(&self, client: &Nfs4Client) -> NfsResult<()> {
        if !client.mark_reclaim_complete() {
            debug!(client_id = %client.id(), "reclaim already complete");
            return Ok(());
        }
        self.store.reclaim_client(client.owner_id())?;
        if self.grace_until.read().is_some() && !self.store.waiting_for_reclaim() {
            self.end_grace_period()?;
        }
        Ok(())
    }

    /// Close the grace period and the reclaim window of the ledger
    pub fn end_grace_period(&self) -> NfsResult<()> {
        let was_open = self.grace_until.write().take().is_some();
        self.store.reclaim_complete()?;
        if was_open {
            info!("grace period ended");
        }
        Ok(())
    }

    /// One pass of lease housekeeping
    ///
    /// Evicts clients whose lease ran out, reaps idle owners and ends an
    /// expired grace period. Returns the number of evicted clients.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        for client in self.clients() {
            if client.is_lease_valid() {
                client.reap_idle_owners(self.config.owner_idle_timeout());
                continue;
            }
            warn!(
                client_id = %client.id(),
                remote = %client.remote_address(),
                confirmed = client.is_confirmed(),
                "lease expired, evicting client"
            );
            match self.remove_client(&client) {
                Ok(()) => evicted += 1,
                Err(e) => warn!(client_id = %client.id(), error = %e, "failed to evict client"),
            }
        }

        let grace_over = matches!(*self.grace_until.read(), Some(deadline) if Instant::now() >= deadline);
        if grace_over {
            if let Err(e) = self.end_grace_period() {
                warn!(error = %e, "failed to close reclaim window");
            }
        }
        evicted
    }

    /// Start the background lease sweeper
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let handler = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(handler.config.sweep_interval());

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = handler.sweep();
                        if evicted > 0 {
                            debug!(evicted, "lease sweep evicted clients");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Lease sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the lease sweeper
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Stop background work, drop all in-memory state and flush the ledger
    ///
    /// Ledger entries are kept so the clients can reclaim after restart.
    pub fn close(&self) -> NfsResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown();
        for client in self.clients() {
            self.release(&client);
        }
        self.clients.clear();
        self.by_owner.clear();
        self.store.close()?;
        info!("NFSv4 state handler closed");
        Ok(())
    }
}

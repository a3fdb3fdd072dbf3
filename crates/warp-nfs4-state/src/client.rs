//! In-memory record of one NFSv4 client
//!
//! An [`Nfs4Client`] owns its lease, its state owners and the table of
//! stateids issued to it. Share reservations themselves live in the file
//! tracker; the client table only answers "is this stateid live, and in
//! which generation".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::callback::{CallbackTarget, ClientCallback};
use crate::error::{NfsError, NfsResult};
use crate::owner::{SequenceCheck, StateOwner};
use crate::share::DelegationType;
use crate::stateid::StateId;
use crate::types::{ClientId, Inode, Principal, Verifier};

/// What a stateid stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Share reservation
    Open,
    /// Byte-range lock state bound to an open
    Lock {
        /// Open the lock state was derived from
        open: StateId,
    },
    /// Delegation
    Delegation(DelegationType),
}

/// A stateid issued to a client
#[derive(Debug, Clone)]
pub struct StateRecord {
    /// Current generation of the stateid
    pub stateid: StateId,
    /// Kind of state
    pub kind: StateKind,
    /// File the state refers to
    pub inode: Inode,
    /// Owner, absent for delegations
    pub owner: Option<Arc<StateOwner>>,
}

/// Endpoints and identity presented at the handshake
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Client-supplied opaque id
    pub owner_id: Bytes,
    /// Client boot verifier
    pub verifier: Verifier,
    /// Authenticated principal
    pub principal: Principal,
    /// Client address
    pub remote: SocketAddr,
    /// Server address the client connected to
    pub local: SocketAddr,
    /// NFSv4 minor version
    pub minor_version: u32,
}

/// One connected NFSv4 client
#[derive(Debug)]
pub struct Nfs4Client {
    id: ClientId,
    identity: ClientIdentity,
    server_verifier: Verifier,
    lease_time: Duration,
    confirmed: AtomicBool,
    reclaim_completed: AtomicBool,
    disposed: AtomicBool,
    lease_expiry: RwLock<Instant>,
    callback: RwLock<Option<Arc<dyn ClientCallback>>>,
    callback_target: RwLock<Option<CallbackTarget>>,
    owners: Mutex<HashMap<Bytes, Arc<StateOwner>>>,
    states: Mutex<HashMap<u32, StateRecord>>,
    next_index: AtomicU32,
}

impl Nfs4Client {
    /// Create an unconfirmed client with a fresh lease
    pub fn new(id: ClientId, identity: ClientIdentity, lease_time: Duration) -> Self {
        Self {
            id,
            identity,
            server_verifier: Verifier::random(),
            lease_time,
            confirmed: AtomicBool::new(false),
            reclaim_completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            lease_expiry: RwLock::new(Instant::now() + lease_time),
            callback: RwLock::new(None),
            callback_target: RwLock::new(None),
            owners: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            next_index: AtomicU32::new(1),
        }
    }

    /// Server-assigned id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Client-supplied opaque id
    pub fn owner_id(&self) -> &Bytes {
        &self.identity.owner_id
    }

    /// Client boot verifier
    pub fn verifier(&self) -> Verifier {
        self.identity.verifier
    }

    /// Confirmation token handed out with the client id
    pub fn server_verifier(&self) -> Verifier {
        self.server_verifier
    }

    /// Authenticated principal
    pub fn principal(&self) -> &Principal {
        &self.identity.principal
    }

    /// Client address
    pub fn remote_address(&self) -> SocketAddr {
        self.identity.remote
    }

    /// Local address the client talks to
    pub fn local_address(&self) -> SocketAddr {
        self.identity.local
    }

    /// NFSv4 minor version
    pub fn minor_version(&self) -> u32 {
        self.identity.minor_version
    }

    /// Whether the client acknowledged its id
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Mark the client as confirmed and start a fresh lease
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::Release);
        self.renew_lease();
    }

    /// Record RECLAIM_COMPLETE; returns false if it was already recorded
    pub fn mark_reclaim_complete(&self) -> bool {
        !self.reclaim_completed.swap(true, Ordering::AcqRel)
    }

    /// Whether the client finished reclaiming
    pub fn reclaim_completed(&self) -> bool {
        self.reclaim_completed.load(Ordering::Acquire)
    }

    /// Lease has not run out
    pub fn is_lease_valid(&self) -> bool {
        Instant::now() < *self.lease_expiry.read()
    }

    /// Retire the record for good
    ///
    /// Set before the client's state is released; file operations check it
    /// under the file lock, so nothing attaches to the client afterwards.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Whether the record was removed from the registry
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Fail unless the client may still acquire state
    pub fn ensure_live(&self) -> NfsResult<()> {
        if self.is_disposed() {
            return Err(NfsError::StaleClientid(format!("{} was removed", self.id)));
        }
        if !self.is_lease_valid() {
            return Err(NfsError::Expired(format!("lease of {} expired", self.id)));
        }
        Ok(())
    }

    /// Extend the lease unconditionally
    pub fn renew_lease(&self) {
        *self.lease_expiry.write() = Instant::now() + self.lease_time;
    }

    /// Extend a still valid lease
    ///
    /// A lease that already ran out cannot be revived; the client has to
    /// establish a new one.
    pub fn update_lease_time(&self) -> NfsResult<()> {
        let mut expiry = self.lease_expiry.write();
        let now = Instant::now();
        if now >= *expiry {
            return Err(NfsError::Expired(format!("lease of client {}", self.id)));
        }
        *expiry = now + self.lease_time;
        Ok(())
    }

    /// Time left on the lease
    pub fn lease_remaining(&self) -> Duration {
        self.lease_expiry
            .read()
            .saturating_duration_since(Instant::now())
    }

    /// Callback channel, if one was established
    pub fn callback(&self) -> Option<Arc<dyn ClientCallback>> {
        self.callback.read().clone()
    }

    /// Install or clear the callback channel
    pub fn set_callback(&self, callback: Option<Arc<dyn ClientCallback>>) {
        *self.callback.write() = callback;
    }

    /// Where the client asked to be called back
    pub fn callback_target(&self) -> Option<CallbackTarget> {
        self.callback_target.read().clone()
    }

    /// Remember the callback address announced at the handshake
    pub fn set_callback_target(&self, target: Option<CallbackTarget>) {
        *self.callback_target.write() = target;
    }

    /// Whether a callback channel is installed
    pub fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Same principal as the one that created this record
    pub fn is_principal(&self, principal: &Principal) -> bool {
        self.identity.principal == *principal
    }

    /// Get an owner, creating it with `seqid` as its last accepted value
    pub fn get_or_create_owner(&self, owner: &Bytes, seqid: u32) -> Arc<StateOwner> {
        self.owners
            .lock()
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(StateOwner::new(self.id, owner.clone(), seqid)))
            .clone()
    }

    /// Look up an owner and run the sequence check
    ///
    /// Sequencing only applies to minor version 0; sessions take over that
    /// role in 4.1 and every request is accepted. A newly created owner
    /// accepts its first sequence id.
    pub fn sequence_owner(
        &self,
        owner: &Bytes,
        seqid: u32,
    ) -> NfsResult<(Arc<StateOwner>, SequenceCheck)> {
        let (state_owner, created) = {
            let mut owners = self.owners.lock();
            match owners.get(owner) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let created = Arc::new(StateOwner::new(self.id, owner.clone(), seqid));
                    owners.insert(owner.clone(), created.clone());
                    (created, true)
                }
            }
        };

        if created || self.minor_version() >= 1 {
            state_owner.touch();
            return Ok((state_owner, SequenceCheck::Accept));
        }

        match state_owner.check_sequence(seqid) {
            SequenceCheck::Error { expected } => {
                debug!(client_id = %self.id, expected, actual = seqid, "owner sequence mismatch");
                Err(NfsError::BadSeqid {
                    expected,
                    actual: seqid,
                })
            }
            check => Ok((state_owner, check)),
        }
    }

    /// Number of known owners
    pub fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }

    /// Drop owners idle for longer than `idle` that hold no state
    pub fn reap_idle_owners(&self, idle: Duration) -> usize {
        let states = self.states.lock();
        let mut owners = self.owners.lock();
        let before = owners.len();
        owners.retain(|key, owner| {
            owner.idle_for() < idle
                || states
                    .values()
                    .any(|record| record.owner.as_ref().is_some_and(|o| o.owner() == key))
        });
        before - owners.len()
    }

    /// Issue a new stateid (generation 1)
    pub fn create_state(
        &self,
        kind: StateKind,
        inode: Inode,
        owner: Option<Arc<StateOwner>>,
    ) -> StateId {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let stateid = StateId::for_state(self.id, index, 1);
        self.states.lock().insert(
            index,
            StateRecord {
                stateid,
                kind,
                inode,
                owner,
            },
        );
        stateid
    }

    /// Resolve a stateid against the live state table
    ///
    /// Unknown index is bad, an older generation is old. A generation ahead
    /// of the server's is bad as well. Clients of minor version 1 or later
    /// may pass generation 0 to mean "whatever is current".
    pub fn state(&self, stateid: &StateId) -> NfsResult<StateRecord> {
        if stateid.client_id() != self.id {
            return Err(NfsError::BadStateid(stateid.to_string()));
        }
        let states = self.states.lock();
        let record = states
            .get(&stateid.index())
            .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))?;
        self.check_generation(stateid, &record.stateid)?;
        Ok(record.clone())
    }

    fn check_generation(&self, presented: &StateId, current: &StateId) -> NfsResult<()> {
        if presented.seqid == 0 && self.minor_version() >= 1 {
            return Ok(());
        }
        if presented.seqid < current.seqid {
            return Err(NfsError::OldStateid(presented.to_string()));
        }
        if presented.seqid > current.seqid {
            return Err(NfsError::BadStateid(presented.to_string()));
        }
        Ok(())
    }

    /// Advance the generation of a live stateid
    pub fn bump_state(&self, stateid: &StateId) -> NfsResult<StateId> {
        if stateid.client_id() != self.id {
            return Err(NfsError::BadStateid(stateid.to_string()));
        }
        let mut states = self.states.lock();
        let record = states
            .get_mut(&stateid.index())
            .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))?;
        self.check_generation(stateid, &record.stateid)?;
        record.stateid = record.stateid.bumped();
        Ok(record.stateid)
    }

    /// Forget a stateid and any lock state derived from it
    pub fn release_state(&self, stateid: &StateId) -> Vec<StateRecord> {
        let mut states = self.states.lock();
        let Some(record) = states.remove(&stateid.index()) else {
            return Vec::new();
        };

        let children: Vec<u32> = states
            .iter()
            .filter(|(_, r)| matches!(r.kind, StateKind::Lock { open } if open.same_state(&record.stateid)))
            .map(|(index, _)| *index)
            .collect();

        let mut released = vec![record];
        released.extend(children.into_iter().filter_map(|index| states.remove(&index)));
        released
    }

    /// Whether the client holds any state
    pub fn has_state(&self) -> bool {
        !self.states.lock().is_empty()
    }

    /// Snapshot of all issued states
    pub fn states(&self) -> Vec<StateRecord> {
        self.states.lock().values().cloned().collect()
    }

    /// Clear owners and states; returns the released states
    pub fn reset(&self) -> Vec<StateRecord> {
        self.owners.lock().clear();
        let drained: Vec<StateRecord> = self.states.lock().drain().map(|(_, r)| r).collect();
        debug!(client_id = %self.id, released = drained.len(), "client state reset");
        drained
    }
}

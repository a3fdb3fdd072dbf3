//! Share reservation and delegation arbitration
//!
//! Every decision about one file runs under that file's lock: the conflict
//! check, the choice to recall and the creation of the open record form a
//! single critical section. Unrelated files never contend.
//!
//! Recalls are never sent with a file lock held. A conflicting delegation
//! is marked as recalling under the lock, the callbacks go out after it is
//! released, and the opener waits a short, bounded time for the holder to
//! return the delegation before looking again. If the conflict is still
//! there the open fails with `Delay` and the client retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::callback::{bounded, ClientCallback};
use crate::client::{Nfs4Client, StateKind};
use crate::config::StateConfig;
use crate::error::{NfsError, NfsResult};
use crate::owner::StateOwner;
use crate::share::{DelegationType, ShareAccess, ShareDeny};
use crate::stateid::StateId;
use crate::types::{ClientId, Inode};
use crate::vfs::{OpenCloseTracker, OpenHandle};

/// Delegation handed out with an open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationGrant {
    /// Delegation stateid
    pub stateid: StateId,
    /// Read or write
    pub kind: DelegationType,
}

/// Result of a successful open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    /// Open stateid; stable across repeated opens by the same owner
    pub open_stateid: StateId,
    /// Delegation held by the client on the file, if any
    pub delegation: Option<DelegationGrant>,
}

impl OpenRecord {
    /// Whether a delegation came with the open
    pub fn has_delegation(&self) -> bool {
        self.delegation.is_some()
    }
}

#[derive(Debug)]
struct OpenState {
    client: Arc<Nfs4Client>,
    owner: Arc<StateOwner>,
    stateid: StateId,
    access: ShareAccess,
    deny: ShareDeny,
}

impl OpenState {
    fn handle(&self) -> OpenHandle {
        open_handle(self.client.id(), &self.stateid)
    }
}

#[derive(Debug)]
struct DelegationState {
    client: Arc<Nfs4Client>,
    stateid: StateId,
    kind: DelegationType,
    recalling: bool,
}

impl DelegationState {
    fn grant(&self) -> DelegationGrant {
        DelegationGrant {
            stateid: self.stateid,
            kind: self.kind,
        }
    }

    fn conflicts_with(&self, access: ShareAccess, deny: ShareDeny) -> bool {
        self.kind.conflicts_with(access) || deny.bits() & ShareDeny::READ.bits() != 0
    }
}

#[derive(Debug, Default)]
struct FileState {
    opens: Vec<OpenState>,
    delegations: Vec<DelegationState>,
    // set once the entry has been unlinked from the map
    retired: bool,
}

impl FileState {
    fn is_empty(&self) -> bool {
        self.opens.is_empty() && self.delegations.is_empty()
    }

    fn has_open(&self, client: ClientId) -> bool {
        self.opens.iter().any(|o| o.client.id() == client)
    }

    /// Drop the delegation of `client` if it has no open left on the file
    fn release_orphaned_delegation(&mut self, client: ClientId) -> bool {
        if self.has_open(client) {
            return false;
        }
        let before = self.delegations.len();
        self.delegations.retain(|d| {
            if d.client.id() == client {
                d.client.release_state(&d.stateid);
                false
            } else {
                true
            }
        });
        before != self.delegations.len()
    }
}

#[derive(Debug, Default)]
struct FileEntry {
    state: Mutex<FileState>,
    returned: Notify,
}

struct PendingRecall {
    callback: Arc<dyn ClientCallback>,
    client: ClientId,
    stateid: StateId,
}

enum OpenStep {
    Granted(OpenRecord),
    Blocked(Vec<PendingRecall>),
}

fn open_handle(client: ClientId, stateid: &StateId) -> OpenHandle {
    OpenHandle {
        opaque: Bytes::copy_from_slice(&stateid.other),
        client_id: client,
        sequence_id: stateid.seqid,
    }
}

/// Per-file share reservation and delegation engine
pub struct FileTracker {
    files: DashMap<Inode, Arc<FileEntry>>,
    hook: Arc<dyn OpenCloseTracker>,
    delegations_enabled: bool,
    opportunistic_delegations: bool,
    callback_timeout: Duration,
    recall_wait: Duration,
    lock_timeout: Duration,
}

impl std::fmt::Debug for FileTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTracker")
            .field("files", &self.files.len())
            .field("delegations_enabled", &self.delegations_enabled)
            .finish()
    }
}

impl FileTracker {
    /// Create a tracker
    pub fn new(config: &StateConfig, hook: Arc<dyn OpenCloseTracker>) -> Self {
        Self {
            files: DashMap::new(),
            hook,
            delegations_enabled: config.delegations_enabled,
            opportunistic_delegations: config.opportunistic_delegations,
            callback_timeout: config.callback_timeout_duration(),
            recall_wait: config.recall_wait_duration(),
            lock_timeout: config.file_lock_timeout(),
        }
    }

    /// Run `f` under the lock of `inode`
    ///
    /// Request paths pass `bounded = true` and get `Delay` if the lock is
    /// not acquired within the configured timeout. The wait parks the
    /// calling thread, and `f` (including the `OpenCloseTracker` hook it
    /// may call) runs with the lock held. Entries left empty are
    /// unlinked; a caller that raced the unlink sees `retired` and retries
    /// with a fresh entry.
    fn with_file<R>(
        &self,
        inode: &Inode,
        bounded: bool,
        f: impl FnOnce(&mut FileState) -> NfsResult<R>,
    ) -> NfsResult<(R, Arc<FileEntry>)> {
        let mut f = Some(f);
        loop {
            let entry = self.files.entry(inode.clone()).or_default().clone();
            let mut state = if bounded {
                entry
                    .state
                    .try_lock_for(self.lock_timeout)
                    .ok_or_else(|| NfsError::Delay(format!("file {inode} is busy")))?
            } else {
                entry.state.lock()
            };
            if state.retired {
                continue;
            }

            let Some(f) = f.take() else {
                return Err(NfsError::Inval("file operation already consumed".to_string()));
            };
            let result = f(&mut state);
            if state.is_empty() {
                state.retired = true;
                self.files
                    .remove_if(inode, |_, current| Arc::ptr_eq(current, &entry));
            }
            drop(state);
            return result.map(|r| (r, entry));
        }
    }

    /// Snapshot of the current entries; never hold a map guard while
    /// waiting on a file lock
    fn entries(&self) -> Vec<(Inode, Arc<FileEntry>)> {
        self.files
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Open `inode` for `owner` of `client`
    ///
    /// `share_access` may carry delegation want flags. A removed client gets
    /// `StaleClientid` and one whose lease ran out gets `Expired`. The
    /// `OpenCloseTracker::open` hook runs inside the file's critical section;
    /// a hook error fails the open and leaves no state behind.
    pub async fn add_open(
        &self,
        client: &Arc<Nfs4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        share_access: ShareAccess,
        share_deny: ShareDeny,
    ) -> NfsResult<OpenRecord> {
        if !share_access.is_valid() {
            return Err(NfsError::Inval(format!(
                "share access {:#x} carries no access bits",
                share_access.bits()
            )));
        }

        for attempt in 0..2 {
            let (step, entry) = self.with_file(inode, true, |file| {
                self.try_open(file, client, owner, inode, share_access, share_deny)
            })?;

            let pending = match step {
                OpenStep::Granted(record) => return Ok(record),
                OpenStep::Blocked(pending) => pending,
            };

            let returned = entry.returned.notified();
            self.send_recalls(inode, pending).await;
            if attempt == 0 {
                let _ = tokio::time::timeout(self.recall_wait, returned).await;
            }
        }

        debug!(%inode, client_id = %client.id(), "open delayed by delegation recall");
        Err(NfsError::Delay(format!(
            "delegation recall pending on {inode}"
        )))
    }

    fn try_open(
        &self,
        file: &mut FileState,
        client: &Arc<Nfs4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        share_access: ShareAccess,
        share_deny: ShareDeny,
    ) -> NfsResult<OpenStep> {
        // checked under the file lock: a release pass that starts after
        // this point sees the entry and anything pushed to it
        client.ensure_live()?;
        let access = share_access.access();
        let existing = file
            .opens
            .iter()
            .position(|o| o.client.id() == client.id() && o.owner.owner() == owner.owner());

        // the caller's own record takes part: it must never hold an access
        // mode its own deny mask forbids
        if let Some(holder) = file
            .opens
            .iter()
            .find(|o| access.conflicts_with(o.deny) || o.access.conflicts_with(share_deny))
        {
            let holder = holder.client.id();
            if existing.is_none() {
                let stateid = client.create_state(StateKind::Open, inode.clone(), Some(owner.clone()));
                if let Err(e) = self.hook.open(
                    &open_handle(client.id(), &stateid),
                    inode,
                    access.bits(),
                    share_deny.bits(),
                    false,
                ) {
                    debug!(error = %e, "open hook failed on denied open");
                }
                client.release_state(&stateid);
            }
            debug!(%inode, client_id = %client.id(), holder = %holder, "share reservation conflict");
            return Err(NfsError::ShareDenied(format!(
                "{inode}: access {:#x} deny {:#x} conflicts with client {holder}",
                access.bits(),
                share_deny.bits()
            )));
        }

        let mut blocked = false;
        let mut pending = Vec::new();
        for deleg in file
            .delegations
            .iter_mut()
            .filter(|d| d.client.id() != client.id() && d.conflicts_with(access, share_deny))
        {
            blocked = true;
            if deleg.recalling {
                continue;
            }
            deleg.recalling = true;
            match deleg.client.callback() {
                Some(callback) => pending.push(PendingRecall {
                    callback,
                    client: deleg.client.id(),
                    stateid: deleg.stateid,
                }),
                None => warn!(client_id = %deleg.client.id(), "delegation holder has no callback channel"),
            }
        }
        if blocked {
            return Ok(OpenStep::Blocked(pending));
        }

        if let Some(index) = existing {
            let open = &mut file.opens[index];
            self.hook
                .open(&open.handle(), inode, access.bits(), share_deny.bits(), true)?;
            open.access = open.access | access;
            open.deny = open.deny | share_deny;
            let (stateid, merged) = (open.stateid, open.access);

            let delegation = self.grant_delegation(file, client, inode, share_access.want(), merged, true);
            debug!(%inode, client_id = %client.id(), access = merged.bits(), "open merged");
            return Ok(OpenStep::Granted(OpenRecord {
                open_stateid: stateid,
                delegation,
            }));
        }

        let stateid = client.create_state(StateKind::Open, inode.clone(), Some(owner.clone()));
        if let Err(e) = self.hook.open(
            &open_handle(client.id(), &stateid),
            inode,
            access.bits(),
            share_deny.bits(),
            false,
        ) {
            client.release_state(&stateid);
            return Err(e.into());
        }
        file.opens.push(OpenState {
            client: client.clone(),
            owner: owner.clone(),
            stateid,
            access,
            deny: share_deny,
        });

        let delegation = self.grant_delegation(file, client, inode, share_access.want(), access, false);
        debug!(%inode, client_id = %client.id(), %stateid, "open created");
        Ok(OpenStep::Granted(OpenRecord {
            open_stateid: stateid,
            delegation,
        }))
    }

    fn grant_delegation(
        &self,
        file: &mut FileState,
        client: &Arc<Nfs4Client>,
        inode: &Inode,
        want: u32,
        access: ShareAccess,
        repeated: bool,
    ) -> Option<DelegationGrant> {
        let id = client.id();
        if client.ensure_live().is_err() {
            return None;
        }
        if let Some(held) = file.delegations.iter().find(|d| d.client.id() == id) {
            return Some(held.grant());
        }
        if !self.delegations_enabled
            || want == ShareAccess::WANT_NO_DELEG.bits()
            || !client.has_callback()
            || file.delegations.iter().any(|d| d.recalling)
        {
            return None;
        }

        let other_opens = file.opens.iter().any(|o| o.client.id() != id);
        let other_writers = file
            .opens
            .iter()
            .any(|o| o.client.id() != id && o.access.contains(ShareAccess::WRITE));
        let other_delegations = file.delegations.iter().any(|d| d.client.id() != id);
        let other_write_delegation = file
            .delegations
            .iter()
            .any(|d| d.client.id() != id && d.kind == DelegationType::Write);
        let read_ok =
            !other_writers && !other_write_delegation && !access.contains(ShareAccess::WRITE);

        let want_write = want == ShareAccess::WANT_WRITE_DELEG.bits()
            || (want == ShareAccess::WANT_ANY_DELEG.bits() && access.contains(ShareAccess::WRITE));
        let kind = if want_write {
            (!other_opens && !other_delegations).then_some(DelegationType::Write)
        } else if want == ShareAccess::WANT_READ_DELEG.bits()
            || want == ShareAccess::WANT_ANY_DELEG.bits()
        {
            read_ok.then_some(DelegationType::Read)
        } else if want == 0 && repeated && self.opportunistic_delegations {
            read_ok.then_some(DelegationType::Read)
        } else {
            None
        }?;

        let stateid = client.create_state(StateKind::Delegation(kind), inode.clone(), None);
        file.delegations.push(DelegationState {
            client: client.clone(),
            stateid,
            kind,
            recalling: false,
        });
        info!(%inode, client_id = %id, ?kind, opportunistic = want == 0, "delegation granted");
        Some(DelegationGrant { stateid, kind })
    }

    async fn send_recalls(&self, inode: &Inode, pending: Vec<PendingRecall>) {
        if pending.is_empty() {
            return;
        }

        let fh = inode.to_handle();
        let timeout = self.callback_timeout;
        let mut calls = JoinSet::new();
        for recall in pending {
            let fh = fh.clone();
            calls.spawn(async move {
                let result = bounded(
                    timeout,
                    recall.callback.cb_delegation_recall(&recall.stateid, &fh, false),
                )
                .await;
                (recall.client, recall.stateid, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((client, stateid, Ok(()))) => {
                    debug!(client_id = %client, %stateid, "delegation recall sent");
                }
                Ok((client, stateid, Err(e))) => {
                    warn!(client_id = %client, %stateid, error = %e, "delegation recall failed");
                    failed.push(stateid);
                }
                Err(e) => warn!(error = %e, "recall task failed"),
            }
        }

        if failed.is_empty() {
            return;
        }
        // a failed recall can be attempted again by the next opener
        let cleared = self.with_file(inode, false, |file| {
            for deleg in file
                .delegations
                .iter_mut()
                .filter(|d| failed.iter().any(|s| s.same_state(&d.stateid)))
            {
                deleg.recalling = false;
            }
            Ok(())
        });
        if let Err(e) = cleared {
            warn!(%inode, error = %e, "could not reset recall state");
        }
    }

    /// Narrow the share masks of an open
    ///
    /// The new masks must be a subset of the ones held.
    pub fn downgrade_open(
        &self,
        client: &Nfs4Client,
        stateid: &StateId,
        inode: &Inode,
        share_access: ShareAccess,
        share_deny: ShareDeny,
    ) -> NfsResult<()> {
        client.state(stateid)?;
        let access = share_access.access();

        self.with_file(inode, true, |file| {
            let open = file
                .opens
                .iter_mut()
                .find(|o| o.client.id() == client.id() && o.stateid.same_state(stateid))
                .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))?;

            if !access.is_valid()
                || !access.is_subset_of(open.access)
                || !share_deny.is_subset_of(open.deny)
            {
                return Err(NfsError::Inval(format!(
                    "downgrade to access {:#x} deny {:#x} from access {:#x} deny {:#x}",
                    access.bits(),
                    share_deny.bits(),
                    open.access.bits(),
                    open.deny.bits()
                )));
            }
            open.access = access;
            open.deny = share_deny;
            debug!(%inode, %stateid, access = access.bits(), "open downgraded");
            Ok(())
        })
        .map(|_| ())
    }

    /// Access mask held by the open `stateid` of `client` on `inode`
    pub fn get_share_access(
        &self,
        client: &Nfs4Client,
        inode: &Inode,
        stateid: &StateId,
    ) -> NfsResult<ShareAccess> {
        client.state(stateid)?;
        self.with_file(inode, true, |file| {
            file.opens
                .iter()
                .find(|o| o.client.id() == client.id() && o.stateid.same_state(stateid))
                .map(|o| o.access)
                .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))
        })
        .map(|(access, _)| access)
    }

    /// Release the open `stateid` on `inode`
    ///
    /// Lock states derived from the open go with it. If it was the
    /// client's last open on the file, its delegation there is released
    /// too.
    pub fn remove_open(&self, inode: &Inode, stateid: &StateId) -> NfsResult<()> {
        let ((), entry) = self.with_file(inode, true, |file| {
            let index = file
                .opens
                .iter()
                .position(|o| o.stateid.same_state(stateid))
                .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))?;
            let open = file.opens.remove(index);
            open.client.release_state(&open.stateid);
            file.release_orphaned_delegation(open.client.id());

            let remaining = file.opens.len();
            self.hook.close(&open.handle(), inode, Some(remaining));
            debug!(%inode, %stateid, remaining, "open removed");
            Ok(())
        })?;
        entry.returned.notify_waiters();
        Ok(())
    }

    /// Take back the delegation `stateid` of `client` (DELEGRETURN)
    pub fn return_delegation(
        &self,
        client: &Nfs4Client,
        stateid: &StateId,
        inode: &Inode,
    ) -> NfsResult<()> {
        let ((), entry) = self.with_file(inode, true, |file| {
            let index = file
                .delegations
                .iter()
                .position(|d| d.client.id() == client.id() && d.stateid.same_state(stateid))
                .ok_or_else(|| NfsError::BadStateid(stateid.to_string()))?;
            let deleg = file.delegations.remove(index);
            client.release_state(&deleg.stateid);
            info!(%inode, client_id = %client.id(), recalled = deleg.recalling, "delegation returned");
            Ok(())
        })?;
        entry.returned.notify_waiters();
        Ok(())
    }

    /// Create lock state bound to the open `open_stateid`
    pub fn add_lock_state(
        &self,
        client: &Nfs4Client,
        owner: &Arc<StateOwner>,
        open_stateid: &StateId,
        inode: &Inode,
    ) -> NfsResult<StateId> {
        let open = client.state(open_stateid)?;
        if open.kind != StateKind::Open {
            return Err(NfsError::BadStateid(open_stateid.to_string()));
        }
        self.with_file(inode, true, |file| {
            client.ensure_live()?;
            if !file
                .opens
                .iter()
                .any(|o| o.client.id() == client.id() && o.stateid.same_state(open_stateid))
            {
                return Err(NfsError::BadStateid(open_stateid.to_string()));
            }
            Ok(client.create_state(
                StateKind::Lock {
                    open: open.stateid,
                },
                inode.clone(),
                Some(owner.clone()),
            ))
        })
        .map(|(stateid, _)| stateid)
    }

    /// Drop every open and delegation of `client`
    ///
    /// Used on client removal and lease expiry. Takes the same file locks
    /// as regular requests, without a bound: the critical sections never
    /// wait on the network.
    pub fn release_client(&self, client: &Nfs4Client) -> usize {
        let id = client.id();
        let mut released = 0;

        for (inode, _) in self.entries() {
            let result = self.with_file(&inode, false, |file| {
                let mut count = 0;
                let mut index = 0;
                while index < file.opens.len() {
                    if file.opens[index].client.id() != id {
                        index += 1;
                        continue;
                    }
                    let open = file.opens.remove(index);
                    client.release_state(&open.stateid);
                    self.hook.close(&open.handle(), &inode, Some(file.opens.len()));
                    count += 1;
                }
                let before = file.delegations.len();
                file.delegations.retain(|d| {
                    if d.client.id() == id {
                        client.release_state(&d.stateid);
                        false
                    } else {
                        true
                    }
                });
                Ok((count, before != file.delegations.len()))
            });

            match result {
                Ok(((count, delegations), entry)) => {
                    released += count;
                    if delegations {
                        entry.returned.notify_waiters();
                    }
                }
                Err(e) => warn!(%inode, client_id = %id, error = %e, "failed to release client state"),
            }
        }

        if released > 0 {
            info!(client_id = %id, opens = released, "released client opens");
        }
        released
    }

    /// Files with opens, and the clients holding them
    pub fn get_open_files(&self) -> HashMap<Inode, Vec<Arc<Nfs4Client>>> {
        self.snapshot(|file| file.opens.iter().map(|o| o.client.clone()).collect())
    }

    /// Files with delegations, and the clients holding them
    pub fn get_delegations(&self) -> HashMap<Inode, Vec<Arc<Nfs4Client>>> {
        self.snapshot(|file| file.delegations.iter().map(|d| d.client.clone()).collect())
    }

    fn snapshot(
        &self,
        holders: impl Fn(&FileState) -> Vec<Arc<Nfs4Client>>,
    ) -> HashMap<Inode, Vec<Arc<Nfs4Client>>> {
        let mut result = HashMap::new();
        for (inode, entry) in self.entries() {
            let state = entry.state.lock();
            let mut clients = holders(&state);
            drop(state);
            clients.sort_by_key(|c| c.id());
            clients.dedup_by_key(|c| c.id());
            if !clients.is_empty() {
                result.insert(inode, clients);
            }
        }
        result
    }
}

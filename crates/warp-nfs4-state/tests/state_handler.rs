//! Client registry integration tests
//!
//! Stateid resolution, lease expiry, the client id handshake and the
//! post-restart grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use warp_nfs4_state::owner::CachedReply;
use warp_nfs4_state::{
    CallbackConnector, CallbackError, CallbackTarget, ClientCallback, ClientHandshake, ClientId,
    Inode, NfsError, NfsStatus, Nfs4Client, NoopOpenCloseTracker, Principal, RequestContext,
    SequenceCheck, SetClientIdArgs, ShareAccess, ShareDeny, StateConfig, StateHandler, StateId,
    StaticRoot, Verifier,
};

#[derive(Debug)]
struct AnsweringCallback;

#[async_trait]
impl ClientCallback for AnsweringCallback {
    async fn cb_ping(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    async fn cb_get_attr(&self, _: u32, _: &Bytes, _: &[u32]) -> Result<Bytes, CallbackError> {
        Ok(Bytes::new())
    }

    async fn cb_delegation_recall(
        &self,
        _: &StateId,
        _: &Bytes,
        _: bool,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}

struct LoopbackConnector;

#[async_trait]
impl CallbackConnector for LoopbackConnector {
    async fn connect(
        &self,
        _target: &CallbackTarget,
    ) -> Result<Arc<dyn ClientCallback>, CallbackError> {
        Ok(Arc::new(AnsweringCallback))
    }
}

fn remote() -> SocketAddr {
    "172.16.0.20:811".parse().unwrap()
}

fn local() -> SocketAddr {
    "172.16.0.1:2049".parse().unwrap()
}

fn handler(config: StateConfig) -> Arc<StateHandler> {
    StateHandler::open(config, Arc::new(NoopOpenCloseTracker)).unwrap()
}

fn new_client(handler: &StateHandler, owner_id: &str, minor_version: u32) -> Arc<Nfs4Client> {
    let client = handler
        .create_client(
            remote(),
            local(),
            minor_version,
            Bytes::from(owner_id.to_string()),
            Verifier::from(1),
            Principal::new("nfs/host@REALM"),
            false,
        )
        .unwrap();
    client.confirm();
    client
}

async fn open_file(handler: &StateHandler, client: &Arc<Nfs4Client>, n: u8) -> StateId {
    let owner = client.get_or_create_owner(&Bytes::from_static(b"owner"), 0);
    handler
        .file_tracker()
        .add_open(client, &owner, &Inode::new(vec![n]), ShareAccess::READ, ShareDeny::NONE)
        .await
        .unwrap()
        .open_stateid
}

#[test]
fn test_client_ids_are_unique() {
    let handler = handler(StateConfig::default());
    let ids: Vec<ClientId> = (0..32)
        .map(|n| new_client(&handler, &format!("client{n}"), 1).id())
        .collect();
    let mut dedup = ids.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), ids.len());
    assert!(ids.iter().all(|id| id.instance() == handler.instance()));
}

#[tokio::test]
async fn test_stateid_resolution() {
    let handler = handler(StateConfig::default());
    let client = new_client(&handler, "client1", 1);
    let open = open_file(&handler, &client, 1).await;

    let (owner, record) = handler.resolve_state(&open).unwrap();
    assert_eq!(owner.id(), client.id());
    assert_eq!(record.stateid, open);

    let stale = StateId::for_state(ClientId::compose(handler.instance().wrapping_add(1), 1), 1, 1);
    assert_eq!(
        handler.resolve_state(&stale).unwrap_err().status(),
        NfsStatus::StaleStateid
    );

    let unknown = StateId::for_state(client.id(), 4096, 1);
    assert!(matches!(
        handler.resolve_state(&unknown),
        Err(NfsError::BadStateid(_))
    ));

    let anonymous = StateId::new(0, [0; 12]);
    assert!(matches!(
        handler.resolve_state(&anonymous),
        Err(NfsError::BadStateid(_))
    ));
    assert!(handler.resolve_for_read(&anonymous).unwrap().is_none());
    assert!(handler.resolve_for_read(&open).unwrap().is_some());

    let bumped = client.bump_state(&open).unwrap();
    assert!(matches!(
        handler.resolve_state(&open),
        Err(NfsError::OldStateid(_))
    ));
    handler.resolve_state(&bumped).unwrap();
}

#[tokio::test]
async fn test_removed_client_stateid_is_stale() {
    let handler = handler(StateConfig::default());
    let client = new_client(&handler, "client1", 1);
    let open = open_file(&handler, &client, 1).await;

    handler.remove_client(&client).unwrap();
    assert_eq!(
        handler.resolve_state(&open).unwrap_err().status(),
        NfsStatus::StaleStateid
    );
    assert!(handler.resolve_for_read(&open).is_err());
}

#[tokio::test]
async fn test_removed_client_cannot_open() {
    let handler = handler(StateConfig::default());
    let gone = new_client(&handler, "client1", 1);
    let live = new_client(&handler, "client2", 1);
    // resolved before the removal, used after it
    let owner = gone.get_or_create_owner(&Bytes::from_static(b"owner"), 0);
    let inode = Inode::new(vec![1]);

    handler.remove_client(&gone).unwrap();
    let err = handler
        .file_tracker()
        .add_open(&gone, &owner, &inode, ShareAccess::READ, ShareDeny::BOTH)
        .await
        .unwrap_err();
    assert!(matches!(err, NfsError::StaleClientid(_)));
    assert!(!gone.has_state());
    assert!(handler.file_tracker().get_open_files().is_empty());

    open_file(&handler, &live, 1).await;
    assert_eq!(handler.sweep(), 0);
    assert_eq!(handler.file_tracker().get_open_files()[&inode].len(), 1);
}

#[tokio::test]
async fn test_expired_client_cannot_open() {
    let handler = handler(StateConfig::default().lease_time(Duration::from_secs(1)));
    let client = new_client(&handler, "client1", 1);
    let owner = client.get_or_create_owner(&Bytes::from_static(b"owner"), 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let err = handler
        .file_tracker()
        .add_open(&client, &owner, &Inode::new(vec![1]), ShareAccess::READ, ShareDeny::NONE)
        .await
        .unwrap_err();
    assert!(matches!(err, NfsError::Expired(_)));
    assert!(handler.file_tracker().get_open_files().is_empty());
}

#[test]
fn test_concurrent_create_keeps_one_record_per_owner() {
    let handler = handler(StateConfig::default());
    for round in 0..200 {
        let owner_id = format!("contended{round}");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    handler
                        .create_client(
                            remote(),
                            local(),
                            1,
                            Bytes::from(owner_id.clone()),
                            Verifier::from(1),
                            Principal::new("nfs/host@REALM"),
                            false,
                        )
                        .unwrap();
                });
            }
        });

        let registered: Vec<Arc<Nfs4Client>> = handler
            .clients()
            .into_iter()
            .filter(|c| c.owner_id().as_ref() == owner_id.as_bytes())
            .collect();
        assert_eq!(registered.len(), 1);
        let current = handler.client_by_owner(owner_id.as_bytes()).unwrap();
        assert_eq!(current.id(), registered[0].id());
        assert!(!current.is_disposed());
    }
}

#[test]
fn test_owner_sequencing_in_minor_version_zero() {
    let handler = handler(StateConfig::default());
    let client = new_client(&handler, "client1", 0);
    let owner = Bytes::from_static(b"open-owner");

    let (state_owner, check) = client.sequence_owner(&owner, 5).unwrap();
    assert_eq!(check, SequenceCheck::Accept);
    assert_eq!(client.sequence_owner(&owner, 6).unwrap().1, SequenceCheck::Accept);

    let reply = CachedReply {
        seqid: 6,
        status: NfsStatus::Ok,
        data: Bytes::from_static(b"reply"),
    };
    state_owner.cache_reply(reply.clone());
    assert_eq!(
        client.sequence_owner(&owner, 6).unwrap().1,
        SequenceCheck::Replay(Some(reply))
    );

    assert!(matches!(
        client.sequence_owner(&owner, 9),
        Err(NfsError::BadSeqid {
            expected: 7,
            actual: 9
        })
    ));
}

#[tokio::test]
async fn test_expired_lease_releases_opens() {
    let handler = handler(StateConfig::default().lease_time(Duration::from_secs(1)));
    let client = new_client(&handler, "client1", 1);
    let survivor = new_client(&handler, "client2", 1);
    open_file(&handler, &client, 1).await;
    open_file(&handler, &survivor, 2).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    handler.update_client_lease(survivor.id()).unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(matches!(
        client.update_lease_time(),
        Err(NfsError::Expired(_))
    ));
    assert_eq!(handler.sweep(), 1);
    assert!(matches!(
        handler.get_client(client.id()),
        Err(NfsError::StaleClientid(_))
    ));
    assert!(!client.has_state());

    let open_files = handler.file_tracker().get_open_files();
    assert_eq!(open_files.len(), 1);
    assert!(open_files.contains_key(&Inode::new(vec![2])));
}

#[tokio::test]
async fn test_sweeper_stops_on_shutdown() {
    let handler = handler(StateConfig::default());
    let sweeper = handler.start_sweeper();
    handler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .unwrap()
        .unwrap();
}

fn handshake(handler: Arc<StateHandler>) -> ClientHandshake {
    let root = Arc::new(StaticRoot(Inode::new(Bytes::from_static(b"export-root"))));
    ClientHandshake::new(handler, root).with_connector(Arc::new(LoopbackConnector))
}

fn ctx(principal: &str) -> RequestContext {
    RequestContext {
        remote: remote(),
        local: local(),
        minor_version: 0,
        principal: Principal::new(principal),
    }
}

fn setclientid(verifier: u64) -> SetClientIdArgs {
    SetClientIdArgs {
        owner_id: Bytes::from_static(b"Linux NFSv4.0 host.example.org"),
        verifier: Verifier::from(verifier),
        callback_program: 0x4000_0000,
        callback_uaddr: "172.16.0.20.175.200".to_string(),
        callback_ident: 1,
    }
}

#[tokio::test]
async fn test_reboot_drops_previous_state() {
    let handler = handler(StateConfig::default());
    let hs = handshake(handler.clone());

    let first = hs.set_client_id(&ctx("alice"), setclientid(1)).await.unwrap();
    hs.confirm_client_id(&ctx("alice"), first.client_id, first.confirm)
        .await
        .unwrap();
    let old = handler.get_confirmed_client(first.client_id).unwrap();
    assert!(old.has_callback());
    open_file(&handler, &old, 1).await;

    let second = hs.set_client_id(&ctx("alice"), setclientid(2)).await.unwrap();
    assert_ne!(first.client_id, second.client_id);
    assert!(handler.get_client(first.client_id).is_err());
    assert!(handler.file_tracker().get_open_files().is_empty());

    // the new record is not usable before it is confirmed
    assert!(handler.get_confirmed_client(second.client_id).is_err());
}

#[tokio::test]
async fn test_other_principal_cannot_take_over_client() {
    let handler = handler(StateConfig::default());
    let hs = handshake(handler.clone());

    let reply = hs.set_client_id(&ctx("alice"), setclientid(1)).await.unwrap();
    hs.confirm_client_id(&ctx("alice"), reply.client_id, reply.confirm)
        .await
        .unwrap();
    let client = handler.get_confirmed_client(reply.client_id).unwrap();
    open_file(&handler, &client, 1).await;

    let err = hs
        .set_client_id(&ctx("mallory"), setclientid(1))
        .await
        .unwrap_err();
    assert!(matches!(err, NfsError::ClidInUse(_)));
    assert!(client.has_state());

    // the owner itself may re-establish; its state is reset
    let again = hs.set_client_id(&ctx("alice"), setclientid(1)).await.unwrap();
    assert_eq!(again.client_id, reply.client_id);
    assert!(!client.has_state());
}

#[tokio::test]
async fn test_renew_requires_confirmed_client() {
    let handler = handler(StateConfig::default());
    let hs = handshake(handler.clone());

    let reply = hs.set_client_id(&ctx("alice"), setclientid(1)).await.unwrap();
    assert!(matches!(
        hs.renew(reply.client_id),
        Err(NfsError::StaleClientid(_))
    ));
    hs.confirm_client_id(&ctx("alice"), reply.client_id, reply.confirm)
        .await
        .unwrap();
    hs.renew(reply.client_id).unwrap();
}

#[tokio::test]
async fn test_grace_period_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig::default().with_recovery_dir(dir.path());

    {
        let handler = handler(config.clone());
        new_client(&handler, "client1", 1);
        new_client(&handler, "client2", 1);
        assert!(!handler.in_grace_period());
        handler.close().unwrap();
    }

    let handler = handler(config);
    assert!(handler.in_grace_period());
    assert!(matches!(handler.check_grace(false), Err(NfsError::Grace)));

    let client1 = new_client(&handler, "client1", 1);
    let client2 = new_client(&handler, "client2", 1);
    let newcomer = new_client(&handler, "client3", 1);
    handler.want_reclaim(&client1).unwrap();
    assert!(matches!(
        handler.want_reclaim(&newcomer),
        Err(NfsError::ReclaimBad(_))
    ));

    handler.reclaim_complete(&client1).unwrap();
    assert!(handler.in_grace_period());
    handler.reclaim_complete(&client2).unwrap();
    assert!(!handler.in_grace_period());

    handler.check_grace(false).unwrap();
    assert!(matches!(
        handler.check_grace(true),
        Err(NfsError::NoGrace(_))
    ));
}

//! Connection authentication policy
//!
//! A client claiming an identity from an address it may not own can be
//! asked to prove that it answers callbacks at the address it announced.
//! The policy deciding who has to prove it, and what happens to
//! connections that fail, is behind [`ConnectionAuthenticator`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::callback::{bounded, ClientCallback};
use crate::types::Inode;

/// Tears down a transport connection
pub type Terminate = Box<dyn FnOnce() + Send>;

/// Policy hook consulted on client handshakes
///
/// Every method has a permissive default, so an implementation only
/// overrides what it cares about.
pub trait ConnectionAuthenticator: Send + Sync {
    /// Whether the client at `addr` must prove callback reachability
    fn requires_connection_authentication(&self, addr: SocketAddr) -> bool {
        let _ = addr;
        false
    }

    /// Record the outcome of a reachability check for `addr`
    fn set_authenticated(&self, addr: SocketAddr, verified: bool) {
        let _ = (addr, verified);
    }

    /// A transport connection from `addr` was accepted
    fn notify_new_connection(&self, addr: SocketAddr, terminate: Terminate) {
        let _ = (addr, terminate);
    }

    /// The transport connection from `addr` went away
    fn notify_connection_closed(&self, addr: SocketAddr) {
        let _ = addr;
    }

    /// Whether `client` may be verified through a callback at `secondary`
    fn may_use_secondary_port_for_verification(
        &self,
        client: SocketAddr,
        secondary: SocketAddr,
    ) -> bool {
        let _ = (client, secondary);
        false
    }
}

/// Trusts every connection
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl ConnectionAuthenticator for PermitAll {}

struct Connection {
    verified: Option<bool>,
    terminate: Option<Terminate>,
}

/// Requires callback verification from clients in a set of networks
///
/// A connection that fails verification is terminated. Verification may
/// only go through a secondary port of the same host.
pub struct NetworkAuthenticator {
    networks: Vec<IpNet>,
    connections: Mutex<HashMap<SocketAddr, Connection>>,
}

impl std::fmt::Debug for NetworkAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAuthenticator")
            .field("networks", &self.networks)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl NetworkAuthenticator {
    /// Require verification from clients in `networks`
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self {
            networks,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn covers(&self, addr: &SocketAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&addr.ip()))
    }

    /// Verification outcome recorded for `addr`
    pub fn is_verified(&self, addr: SocketAddr) -> Option<bool> {
        self.connections.lock().get(&addr).and_then(|c| c.verified)
    }

    /// Number of tracked connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl ConnectionAuthenticator for NetworkAuthenticator {
    fn requires_connection_authentication(&self, addr: SocketAddr) -> bool {
        if !self.covers(&addr) {
            return false;
        }
        self.is_verified(addr) != Some(true)
    }

    fn set_authenticated(&self, addr: SocketAddr, verified: bool) {
        let terminate = {
            let mut connections = self.connections.lock();
            let conn = connections.entry(addr).or_insert(Connection {
                verified: None,
                terminate: None,
            });
            conn.verified = Some(verified);
            if verified {
                None
            } else {
                conn.terminate.take()
            }
        };

        if verified {
            info!(%addr, "connection verified through callback");
            return;
        }
        warn!(%addr, "callback verification failed, dropping connection");
        // run outside the lock; the transport may call back into us
        if let Some(terminate) = terminate {
            terminate();
        }
    }

    fn notify_new_connection(&self, addr: SocketAddr, terminate: Terminate) {
        debug!(%addr, "tracking connection");
        self.connections.lock().insert(
            addr,
            Connection {
                verified: None,
                terminate: Some(terminate),
            },
        );
    }

    fn notify_connection_closed(&self, addr: SocketAddr) {
        self.connections.lock().remove(&addr);
    }

    fn may_use_secondary_port_for_verification(
        &self,
        client: SocketAddr,
        secondary: SocketAddr,
    ) -> bool {
        client.ip() == secondary.ip()
    }
}

/// Check that a client answers on its callback channel
///
/// Sends `CB_NULL` followed by `CB_GETATTR` on the export root with an
/// empty bitmap. Any failure, a timeout or a client that rejects the
/// handle counts as not verified.
pub async fn verify_client_callback(
    callback: &dyn ClientCallback,
    ident: u32,
    root: &Inode,
    timeout: Duration,
) -> bool {
    let handle = root.to_handle();
    let ping = async {
        callback.cb_ping().await?;
        callback.cb_get_attr(ident, &handle, &[]).await
    };

    match bounded(timeout, ping).await {
        Ok(_) => true,
        Err(e) if e.is_bad_handle() => {
            info!(callback = ?callback, "client does not know the export root");
            false
        }
        Err(e) => {
            info!(callback = ?callback, error = %e, "callback verification failed");
            false
        }
    }
}

//! Client id handshake
//!
//! Decision logic of `SETCLIENTID`, `SETCLIENTID_CONFIRM` and `RENEW` on
//! top of the [`StateHandler`] registry. Decoding the requests and
//! encoding the replies is left to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::auth::{
    verify_client_callback, ConnectionAuthenticator, NetworkAuthenticator, PermitAll,
};
use crate::callback::{bounded, CallbackConnector, CallbackTarget, RpcCallbackConnector};
use crate::client::Nfs4Client;
use crate::error::{NfsError, NfsResult};
use crate::state_handler::StateHandler;
use crate::types::{ClientId, Principal, Verifier};
use crate::vfs::RootResolver;

/// Transport facts about the request being served
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client address
    pub remote: SocketAddr,
    /// Local address the request arrived on
    pub local: SocketAddr,
    /// NFSv4 minor version of the compound
    pub minor_version: u32,
    /// Authenticated principal
    pub principal: Principal,
}

/// Decoded `SETCLIENTID` arguments
#[derive(Debug, Clone)]
pub struct SetClientIdArgs {
    /// Client-supplied opaque id
    pub owner_id: Bytes,
    /// Client boot verifier
    pub verifier: Verifier,
    /// Callback RPC program
    pub callback_program: u32,
    /// Callback universal address
    pub callback_uaddr: String,
    /// `callback_ident` to echo in callbacks
    pub callback_ident: u32,
}

/// `SETCLIENTID` result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetClientIdReply {
    /// Assigned client id
    pub client_id: ClientId,
    /// Token the client presents in `SETCLIENTID_CONFIRM`
    pub confirm: Verifier,
}

/// Serves the v4.0 client id handshake
pub struct ClientHandshake {
    handler: Arc<StateHandler>,
    authenticator: Arc<dyn ConnectionAuthenticator>,
    connector: Arc<dyn CallbackConnector>,
    root: Arc<dyn RootResolver>,
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl ClientHandshake {
    /// Handshake with RPC callbacks
    ///
    /// Clients in the configured `verify_networks` must prove callback
    /// reachability; everybody else is trusted.
    pub fn new(handler: Arc<StateHandler>, root: Arc<dyn RootResolver>) -> Self {
        let config = handler.config();
        let connector = Arc::new(RpcCallbackConnector::new(config.callback_timeout_duration()));
        let authenticator: Arc<dyn ConnectionAuthenticator> = if config.verify_networks.is_empty() {
            Arc::new(PermitAll)
        } else {
            Arc::new(NetworkAuthenticator::new(config.verify_networks.clone()))
        };
        Self {
            handler,
            authenticator,
            connector,
            root,
        }
    }

    /// Authenticator in use; the transport reports connections to it
    pub fn authenticator(&self) -> &Arc<dyn ConnectionAuthenticator> {
        &self.authenticator
    }

    /// Use `authenticator` to decide which clients must prove reachability
    pub fn with_authenticator(mut self, authenticator: Arc<dyn ConnectionAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Open callback channels through `connector`
    pub fn with_connector(mut self, connector: Arc<dyn CallbackConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Registry the handshake works on
    pub fn handler(&self) -> &Arc<StateHandler> {
        &self.handler
    }

    /// `SETCLIENTID`
    ///
    /// # Errors
    ///
    /// * `NotSupp` for minor versions above 0
    /// * `ClidInUse` if a live client with state is claimed by another
    ///   principal
    #[tracing::instrument(skip_all, fields(remote = %ctx.remote))]
    pub async fn set_client_id(
        &self,
        ctx: &RequestContext,
        args: SetClientIdArgs,
    ) -> NfsResult<SetClientIdReply> {
        if ctx.minor_version > 0 {
            return Err(NfsError::NotSupp(format!(
                "SETCLIENTID in minor version {}",
                ctx.minor_version
            )));
        }

        let client = match self.handler.client_by_owner(&args.owner_id) {
            None => self.create(ctx, &args)?,
            Some(known) if !known.is_confirmed() => {
                debug!(client_id = %known.id(), "dropping unconfirmed record");
                self.handler.remove_client(&known)?;
                self.create(ctx, &args)?
            }
            Some(known) if known.verifier() != args.verifier => {
                info!(client_id = %known.id(), "client rebooted");
                self.create(ctx, &args)?
            }
            Some(known) if known.is_lease_valid() => {
                if !known.is_principal(&ctx.principal) && known.has_state() {
                    warn!(
                        client_id = %known.id(),
                        principal = %ctx.principal,
                        holder = %known.principal(),
                        "client id claimed by another principal"
                    );
                    return Err(NfsError::ClidInUse(known.id().to_string()));
                }
                self.handler.reset_client(&known);
                known
            }
            Some(known) => {
                debug!(client_id = %known.id(), "replacing expired record");
                self.handler.remove_client(&known)?;
                self.create(ctx, &args)?
            }
        };

        let target = CallbackTarget::from_uaddr(
            &args.callback_uaddr,
            args.callback_program,
            ctx.minor_version,
            args.callback_ident,
        );
        if target.is_none() {
            debug!(uaddr = %args.callback_uaddr, "unusable callback address");
        }
        client.set_callback_target(target.clone());

        if self
            .authenticator
            .requires_connection_authentication(ctx.remote)
        {
            match target {
                Some(target)
                    if self
                        .authenticator
                        .may_use_secondary_port_for_verification(ctx.remote, target.addr) =>
                {
                    let verified = self.verify(&target).await;
                    self.authenticator.set_authenticated(ctx.remote, verified);
                }
                _ => debug!("callback address cannot be used for verification"),
            }
        }

        Ok(SetClientIdReply {
            client_id: client.id(),
            confirm: client.server_verifier(),
        })
    }

    /// `SETCLIENTID_CONFIRM`
    ///
    /// Confirms the record and opens its callback channel. A channel that
    /// cannot be opened does not fail the confirmation; the client simply
    /// gets no delegations.
    #[tracing::instrument(skip_all, fields(remote = %ctx.remote, client_id = %client_id))]
    pub async fn confirm_client_id(
        &self,
        ctx: &RequestContext,
        client_id: ClientId,
        confirm: Verifier,
    ) -> NfsResult<()> {
        if ctx.minor_version > 0 {
            return Err(NfsError::NotSupp(format!(
                "SETCLIENTID_CONFIRM in minor version {}",
                ctx.minor_version
            )));
        }

        let client = self.handler.get_client(client_id)?;
        if client.server_verifier() != confirm {
            return Err(NfsError::StaleClientid(format!(
                "{client_id} confirmed with a foreign verifier"
            )));
        }
        if !client.is_principal(&ctx.principal) {
            return Err(NfsError::ClidInUse(client_id.to_string()));
        }

        if client.is_confirmed() {
            // retransmission
            client.renew_lease();
        } else {
            client.confirm();
            info!("client confirmed");
        }
        self.open_back_channel(&client).await;
        Ok(())
    }

    /// `RENEW`
    pub fn renew(&self, client_id: ClientId) -> NfsResult<()> {
        self.handler.update_client_lease(client_id)?;
        Ok(())
    }

    fn create(&self, ctx: &RequestContext, args: &SetClientIdArgs) -> NfsResult<Arc<Nfs4Client>> {
        self.handler.create_client(
            ctx.remote,
            ctx.local,
            ctx.minor_version,
            args.owner_id.clone(),
            args.verifier,
            ctx.principal.clone(),
            false,
        )
    }

    async fn verify(&self, target: &CallbackTarget) -> bool {
        let timeout = self.handler.config().callback_timeout_duration();
        let root = match self.root.root_inode() {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "cannot resolve export root");
                return false;
            }
        };
        match bounded(timeout, self.connector.connect(target)).await {
            Ok(callback) => {
                verify_client_callback(callback.as_ref(), target.ident, &root, timeout).await
            }
            Err(e) => {
                debug!(addr = %target.addr, error = %e, "callback connect failed");
                false
            }
        }
    }

    async fn open_back_channel(&self, client: &Nfs4Client) {
        let Some(target) = client.callback_target() else {
            return;
        };
        let timeout = self.handler.config().callback_timeout_duration();
        match bounded(timeout, self.connector.connect(&target)).await {
            Ok(callback) => {
                debug!(addr = %target.addr, "callback channel ready");
                client.set_callback(Some(callback));
            }
            Err(e) => {
                warn!(client_id = %client.id(), addr = %target.addr, error = %e, "callback path down");
                client.set_callback(None);
            }
        }
    }
}

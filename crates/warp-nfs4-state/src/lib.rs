//! NFSv4 state management for WARP NFS gateways
//!
//! This crate keeps track of everything an NFSv4 server promises its
//! clients between requests: client ids and leases, state owners and their
//! sequence ids, stateids, share reservations, delegations and the recovery
//! ledger consulted after a restart.
//!
//! # Features
//!
//! - Client registry with lease expiry, reboot detection and grace period
//! - Share reservation and delegation arbitration per file
//! - Delegation recall over an ONC RPC callback channel
//! - Durable recovery ledger backed by sled
//! - Optional callback verification of client addresses
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ compound handler │ (outside this crate)
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌───────────────────┐
//! │ ClientHandshake  ├────►│ Connection-       │
//! └────────┬─────────┘     │ Authenticator     │
//!          │               └───────────────────┘
//! ┌────────▼─────────┐     ┌───────────────────┐
//! │  StateHandler    ├────►│ ClientRecovery-   │
//! │   - Nfs4Client   │     │ Store (sled)      │
//! │   - StateOwner   │     └───────────────────┘
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌───────────────────┐
//! │   FileTracker    ├────►│ ClientCallback    │
//! └──────────────────┘     └───────────────────┘
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod file_tracker;
pub mod handshake;
pub mod owner;
pub mod recovery;
pub mod share;
pub mod state_handler;
pub mod stateid;
pub mod types;
pub mod vfs;

pub use auth::{ConnectionAuthenticator, NetworkAuthenticator, PermitAll};
pub use callback::{CallbackConnector, CallbackError, CallbackTarget, ClientCallback};
pub use client::{Nfs4Client, StateKind, StateRecord};
pub use config::{ConfigError, StateConfig};
pub use error::{NfsError, NfsResult, NfsStatus};
pub use file_tracker::{DelegationGrant, FileTracker, OpenRecord};
pub use handshake::{ClientHandshake, RequestContext, SetClientIdArgs, SetClientIdReply};
pub use owner::{SequenceCheck, StateOwner};
pub use recovery::{ClientRecoveryStore, EphemeralClientStore, SledClientStore};
pub use share::{DelegationType, ShareAccess, ShareDeny};
pub use state_handler::StateHandler;
pub use stateid::StateId;
pub use types::{ClientId, Inode, Principal, Verifier};
pub use vfs::{NoopOpenCloseTracker, OpenCloseTracker, OpenHandle, RootResolver, StaticRoot};

//! Client callback channel
//!
//! The back channel lets the server ping a client (`CB_NULL`), ask it for
//! attributes of a handle it claims to know (`CB_GETATTR`) and recall
//! delegations (`CB_RECALL`). Any failure, including a timeout, means
//! "not confirmed": callers must fall back to the conservative outcome.

pub mod rpc;
pub mod wire;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::stateid::StateId;

pub use rpc::{RpcCallbackConnector, RpcClientCallback};

/// Callback channel errors
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Client could not be reached
    #[error("callback unreachable: {0}")]
    Unreachable(#[from] std::io::Error),

    /// No answer within the bound
    #[error("callback timed out after {0:?}")]
    Timeout(Duration),

    /// RPC layer rejected the call
    #[error("callback RPC rejected: {0}")]
    Rejected(String),

    /// Client answered with an NFSv4 error status
    #[error("callback returned status {0}")]
    Status(u32),

    /// Reply could not be decoded
    #[error("malformed callback reply: {0}")]
    Malformed(String),

    /// Client has no callback channel
    #[error("no callback channel")]
    NoChannel,
}

impl CallbackError {
    /// The client does not know the handle it was asked about
    pub fn is_bad_handle(&self) -> bool {
        matches!(self, CallbackError::Status(10001))
    }
}

/// Outbound calls to one client
#[async_trait]
pub trait ClientCallback: Send + Sync + fmt::Debug {
    /// Reachability check
    async fn cb_ping(&self) -> Result<(), CallbackError>;

    /// Fetch attributes of `fh`; returns the encoded attribute values
    async fn cb_get_attr(
        &self,
        ident: u32,
        fh: &Bytes,
        bitmap: &[u32],
    ) -> Result<Bytes, CallbackError>;

    /// Ask the client to return the delegation `stateid` on `fh`
    async fn cb_delegation_recall(
        &self,
        stateid: &StateId,
        fh: &Bytes,
        truncate: bool,
    ) -> Result<(), CallbackError>;
}

/// Run a callback future with a bound; a timeout is a failure
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, CallbackError>
where
    F: std::future::Future<Output = Result<T, CallbackError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CallbackError::Timeout(timeout)),
    }
}

/// Where and how to reach a client's callback service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    /// Callback service address
    pub addr: SocketAddr,
    /// RPC program number chosen by the client
    pub program: u32,
    /// NFSv4 minor version of the client
    pub minor_version: u32,
    /// `callback_ident` echoed in every v4.0 compound
    pub ident: u32,
    /// Session for v4.1 `CB_SEQUENCE`
    pub session: Option<[u8; 16]>,
}

impl CallbackTarget {
    /// Create a target from a universal address string (`h1.h2.h3.h4.p1.p2`)
    pub fn from_uaddr(uaddr: &str, program: u32, minor_version: u32, ident: u32) -> Option<Self> {
        Some(Self {
            addr: parse_uaddr(uaddr)?,
            program,
            minor_version,
            ident,
            session: None,
        })
    }
}

/// Parse an RFC 5665 universal address
pub fn parse_uaddr(uaddr: &str) -> Option<SocketAddr> {
    let mut parts = uaddr.rsplitn(3, '.');
    let lo: u16 = parts.next()?.parse().ok()?;
    let hi: u16 = parts.next()?.parse().ok()?;
    let host: IpAddr = parts.next()?.parse().ok()?;
    if hi > 255 || lo > 255 {
        return None;
    }
    Some(SocketAddr::new(host, (hi << 8) | lo))
}

/// Opens callback channels for clients
#[async_trait]
pub trait CallbackConnector: Send + Sync {
    /// Connect to `target`
    async fn connect(
        &self,
        target: &CallbackTarget,
    ) -> Result<Arc<dyn ClientCallback>, CallbackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uaddr_v4() {
        let addr = parse_uaddr("192.168.1.5.3.232").unwrap();
        assert_eq!(addr, "192.168.1.5:1000".parse().unwrap());
    }

    #[test]
    fn test_parse_uaddr_v6() {
        let addr = parse_uaddr("::1.8.1").unwrap();
        assert_eq!(addr, "[::1]:2049".parse().unwrap());
    }

    #[test]
    fn test_parse_uaddr_invalid() {
        assert!(parse_uaddr("10.0.0.1").is_none());
        assert!(parse_uaddr("10.0.0.1.300.1").is_none());
        assert!(parse_uaddr("nohost.1.1").is_none());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CallbackError::Timeout(_))));
    }

    #[test]
    fn test_bad_handle_detection() {
        assert!(CallbackError::Status(10001).is_bad_handle());
        assert!(!CallbackError::Status(10008).is_bad_handle());
        assert!(!CallbackError::NoChannel.is_bad_handle());
    }
}

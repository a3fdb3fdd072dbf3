//! TCP ONC RPC client for the callback program

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::wire::{self, CbOp, CB_COMPOUND, CB_NULL, LAST_FRAGMENT, MAX_RECORD};
use super::{bounded, CallbackConnector, CallbackError, CallbackTarget, ClientCallback};
use crate::stateid::StateId;

/// Callback channel to one client over a single TCP connection
///
/// Calls are serialized on the connection. A failed or timed out call
/// drops the connection; the next call reconnects.
#[derive(Debug)]
pub struct RpcClientCallback {
    target: CallbackTarget,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    xid: AtomicU32,
    slot_sequence: AtomicU32,
}

impl RpcClientCallback {
    /// Connect to the client's callback service
    pub async fn connect(target: CallbackTarget, timeout: Duration) -> Result<Self, CallbackError> {
        let addr = target.addr;
        let stream = bounded(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, program = target.program, "callback channel connected");

        Ok(Self {
            target,
            timeout,
            stream: Mutex::new(Some(stream)),
            xid: AtomicU32::new(rand::random()),
            slot_sequence: AtomicU32::new(1),
        })
    }

    /// Target of this channel
    pub fn target(&self) -> &CallbackTarget {
        &self.target
    }

    async fn call(&self, procedure: u32, args: Bytes) -> Result<Bytes, CallbackError> {
        let xid = self.xid.fetch_add(1, Ordering::Relaxed);
        let frame = wire::encode_call(xid, self.target.program, procedure, &args);

        let mut slot = self.stream.lock().await;
        let result = bounded(
            self.timeout,
            exchange(&mut *slot, self.target.addr, xid, &frame),
        )
        .await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn compound(&self, op: CbOp) -> Result<Option<Bytes>, CallbackError> {
        let mut ops = Vec::with_capacity(2);
        if let (Some(session), true) = (self.target.session, self.target.minor_version >= 1) {
            ops.push(CbOp::Sequence {
                session,
                sequence_id: self.slot_sequence.fetch_add(1, Ordering::Relaxed),
                slot_id: 0,
            });
        }
        ops.push(op);

        let args = wire::encode_compound(self.target.minor_version, self.target.ident, &ops);
        let results = self.call(CB_COMPOUND, args).await?;
        wire::decode_compound(results)
    }
}

async fn exchange(
    slot: &mut Option<TcpStream>,
    addr: std::net::SocketAddr,
    xid: u32,
    frame: &[u8],
) -> Result<Bytes, CallbackError> {
    if slot.is_none() {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        *slot = Some(stream);
    }
    let stream = slot.as_mut().ok_or(CallbackError::NoChannel)?;

    stream.write_all(frame).await?;
    stream.flush().await?;
    trace!(xid, len = frame.len(), "callback call sent");

    loop {
        let record = read_record(stream).await?;
        if let Some(results) = wire::decode_reply(xid, record)? {
            return Ok(results);
        }
        trace!(xid, "skipping reply for another call");
    }
}

async fn read_record(stream: &mut TcpStream) -> Result<Bytes, CallbackError> {
    let mut record = BytesMut::new();
    loop {
        let mark = stream.read_u32().await?;
        let len = (mark & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(CallbackError::Malformed(format!(
                "record exceeds {MAX_RECORD} bytes"
            )));
        }
        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..]).await?;
        if mark & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

#[async_trait]
impl ClientCallback for RpcClientCallback {
    async fn cb_ping(&self) -> Result<(), CallbackError> {
        self.call(CB_NULL, Bytes::new()).await.map(|_| ())
    }

    async fn cb_get_attr(
        &self,
        ident: u32,
        fh: &Bytes,
        bitmap: &[u32],
    ) -> Result<Bytes, CallbackError> {
        debug!(addr = %self.target.addr, ident, "CB_GETATTR");
        let attrs = self
            .compound(CbOp::GetAttr {
                fh: fh.clone(),
                bitmap: bitmap.to_vec(),
            })
            .await?;
        attrs.ok_or_else(|| CallbackError::Malformed("missing CB_GETATTR result".to_string()))
    }

    async fn cb_delegation_recall(
        &self,
        stateid: &StateId,
        fh: &Bytes,
        truncate: bool,
    ) -> Result<(), CallbackError> {
        debug!(addr = %self.target.addr, %stateid, "CB_RECALL");
        self.compound(CbOp::Recall {
            stateid: *stateid,
            truncate,
            fh: fh.clone(),
        })
        .await
        .map(|_| ())
    }
}

/// Connects callback channels over TCP
#[derive(Debug, Clone)]
pub struct RpcCallbackConnector {
    timeout: Duration,
}

impl RpcCallbackConnector {
    /// Create a connector whose channels bound every call by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CallbackConnector for RpcCallbackConnector {
    async fn connect(
        &self,
        target: &CallbackTarget,
    ) -> Result<Arc<dyn ClientCallback>, CallbackError> {
        let channel = RpcClientCallback::connect(target.clone(), self.timeout).await?;
        Ok(Arc::new(channel))
    }
}

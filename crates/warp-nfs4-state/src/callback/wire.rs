//! ONC RPC framing and CB_COMPOUND encoding for the back channel
//!
//! Only the small subset the server needs as an RPC *client* is covered:
//! call headers with AUTH_NONE, TCP record marking, CB_NULL and
//! CB_COMPOUND carrying CB_SEQUENCE / CB_GETATTR / CB_RECALL.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::CallbackError;
use crate::stateid::StateId;

/// Default callback program number used by Linux clients
pub const NFS4_CALLBACK: u32 = 0x4000_0000;
/// Callback program version
pub const CB_VERSION: u32 = 1;

/// `CB_NULL` procedure
pub const CB_NULL: u32 = 0;
/// `CB_COMPOUND` procedure
pub const CB_COMPOUND: u32 = 1;

/// `CB_GETATTR` operation
pub const OP_CB_GETATTR: u32 = 3;
/// `CB_RECALL` operation
pub const OP_CB_RECALL: u32 = 4;
/// `CB_SEQUENCE` operation
pub const OP_CB_SEQUENCE: u32 = 11;

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;

/// Last-fragment bit of a record mark
pub const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Upper bound on a reassembled reply
pub const MAX_RECORD: usize = 1024 * 1024;

fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.put_bytes(0, pad(data.len()));
}

fn pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// One operation inside a CB_COMPOUND
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CbOp {
    /// v4.1 slot sequencing
    Sequence {
        /// Session id
        session: [u8; 16],
        /// Slot sequence id
        sequence_id: u32,
        /// Slot id
        slot_id: u32,
    },
    /// Ask for attributes of a handle
    GetAttr {
        /// File handle
        fh: Bytes,
        /// Requested attribute bitmap
        bitmap: Vec<u32>,
    },
    /// Recall a delegation
    Recall {
        /// Delegation stateid
        stateid: StateId,
        /// Whether the file is being truncated
        truncate: bool,
        /// File handle
        fh: Bytes,
    },
}

impl CbOp {
    fn opcode(&self) -> u32 {
        match self {
            CbOp::Sequence { .. } => OP_CB_SEQUENCE,
            CbOp::GetAttr { .. } => OP_CB_GETATTR,
            CbOp::Recall { .. } => OP_CB_RECALL,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.opcode());
        match self {
            CbOp::Sequence {
                session,
                sequence_id,
                slot_id,
            } => {
                buf.put_slice(session);
                buf.put_u32(*sequence_id);
                buf.put_u32(*slot_id);
                // highest_slotid, cachethis, empty referring_call_lists
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(0);
            }
            CbOp::GetAttr { fh, bitmap } => {
                put_opaque(buf, fh);
                buf.put_u32(bitmap.len() as u32);
                for word in bitmap {
                    buf.put_u32(*word);
                }
            }
            CbOp::Recall {
                stateid,
                truncate,
                fh,
            } => {
                buf.put_u32(stateid.seqid);
                buf.put_slice(&stateid.other);
                buf.put_u32(*truncate as u32);
                put_opaque(buf, fh);
            }
        }
    }
}

/// Encode CB_COMPOUND arguments
pub fn encode_compound(minor_version: u32, ident: u32, ops: &[CbOp]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    // empty tag
    put_opaque(&mut buf, b"");
    buf.put_u32(minor_version);
    buf.put_u32(ident);
    buf.put_u32(ops.len() as u32);
    for op in ops {
        op.encode(&mut buf);
    }
    buf.freeze()
}

/// Encode a complete record-marked RPC call
pub fn encode_call(xid: u32, program: u32, procedure: u32, args: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(44 + args.len());
    body.put_u32(xid);
    body.put_u32(MSG_CALL);
    body.put_u32(RPC_VERSION);
    body.put_u32(program);
    body.put_u32(CB_VERSION);
    body.put_u32(procedure);
    // credential and verifier: AUTH_NONE, empty body
    body.put_u32(AUTH_NONE);
    body.put_u32(0);
    body.put_u32(AUTH_NONE);
    body.put_u32(0);
    body.put_slice(args);

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(LAST_FRAGMENT | body.len() as u32);
    frame.put_slice(&body);
    frame.freeze()
}

/// Checked XDR reader over a reply body
#[derive(Debug)]
pub struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    /// Wrap a buffer
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), CallbackError> {
        if self.buf.remaining() < n {
            return Err(CallbackError::Malformed(format!(
                "need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Read a u32
    pub fn u32(&mut self) -> Result<u32, CallbackError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a variable-length opaque
    pub fn opaque(&mut self) -> Result<Bytes, CallbackError> {
        let len = self.u32()? as usize;
        self.need(len + pad(len))?;
        let data = self.buf.split_to(len);
        self.buf.advance(pad(len));
        Ok(data)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<(), CallbackError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Unread remainder
    pub fn into_rest(self) -> Bytes {
        self.buf
    }
}

/// Check an RPC reply header for `xid` and return the procedure results
///
/// Returns `Ok(None)` when the record belongs to a different call.
pub fn decode_reply(xid: u32, record: Bytes) -> Result<Option<Bytes>, CallbackError> {
    let mut reader = XdrReader::new(record);
    if reader.u32()? != xid {
        return Ok(None);
    }
    if reader.u32()? != MSG_REPLY {
        return Err(CallbackError::Malformed("not a reply".to_string()));
    }
    match reader.u32()? {
        MSG_ACCEPTED => {}
        _ => return Err(CallbackError::Rejected("call denied".to_string())),
    }
    // verifier
    let _flavor = reader.u32()?;
    reader.opaque()?;
    match reader.u32()? {
        ACCEPT_SUCCESS => Ok(Some(reader.into_rest())),
        stat => Err(CallbackError::Rejected(format!("accept status {stat}"))),
    }
}

/// Decode CB_COMPOUND results
///
/// Fails with [`CallbackError::Status`] on the first failed operation.
/// Returns the attribute values of a CB_GETATTR result, if one was present.
pub fn decode_compound(results: Bytes) -> Result<Option<Bytes>, CallbackError> {
    let mut reader = XdrReader::new(results);
    let status = reader.u32()?;
    reader.opaque()?;
    let count = reader.u32()?;

    let mut attrs = None;
    for _ in 0..count {
        let op = reader.u32()?;
        let op_status = reader.u32()?;
        if op_status != 0 {
            return Err(CallbackError::Status(op_status));
        }
        match op {
            OP_CB_SEQUENCE => {
                // sessionid, sequenceid, slotid, highest_slotid, target_highest_slotid
                reader.skip(16 + 4 * 4)?;
            }
            OP_CB_GETATTR => {
                let words = reader.u32()? as usize;
                reader.skip(words * 4)?;
                attrs = Some(reader.opaque()?);
            }
            OP_CB_RECALL => {}
            other => {
                return Err(CallbackError::Malformed(format!(
                    "unexpected callback op {other}"
                )))
            }
        }
    }
    if status != 0 {
        return Err(CallbackError::Status(status));
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_header(xid: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(xid);
        buf.put_u32(MSG_REPLY);
        buf.put_u32(MSG_ACCEPTED);
        buf.put_u32(AUTH_NONE);
        buf.put_u32(0);
        buf.put_u32(ACCEPT_SUCCESS);
        buf
    }

    #[test]
    fn test_call_framing() {
        let frame = encode_call(7, NFS4_CALLBACK, CB_NULL, &[]);
        let mut buf = frame.clone();
        let mark = buf.get_u32();
        assert_eq!(mark & LAST_FRAGMENT, LAST_FRAGMENT);
        assert_eq!((mark & !LAST_FRAGMENT) as usize, frame.len() - 4);
        assert_eq!(buf.get_u32(), 7);
        assert_eq!(buf.get_u32(), MSG_CALL);
        assert_eq!(buf.get_u32(), RPC_VERSION);
        assert_eq!(buf.get_u32(), NFS4_CALLBACK);
    }

    #[test]
    fn test_recall_encoding() {
        let stateid = StateId::new(3, [9; 12]);
        let args = encode_compound(
            0,
            42,
            &[CbOp::Recall {
                stateid,
                truncate: true,
                fh: Bytes::from_static(b"abcde"),
            }],
        );
        let mut buf = args;
        assert_eq!(buf.get_u32(), 0); // tag
        assert_eq!(buf.get_u32(), 0); // minor version
        assert_eq!(buf.get_u32(), 42);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), OP_CB_RECALL);
        assert_eq!(buf.get_u32(), 3);
        buf.advance(12);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), 5);
        // handle padded to 8 bytes
        assert_eq!(buf.remaining(), 8);
    }

    #[test]
    fn test_reply_for_other_xid_is_skipped() {
        let reply = reply_header(5).freeze();
        assert!(decode_reply(6, reply).unwrap().is_none());
    }

    #[test]
    fn test_denied_reply() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u32(MSG_REPLY);
        buf.put_u32(1);
        assert!(matches!(
            decode_reply(5, buf.freeze()),
            Err(CallbackError::Rejected(_))
        ));
    }

    #[test]
    fn test_getattr_result() {
        let mut buf = reply_header(9);
        buf.put_u32(0); // status
        buf.put_u32(0); // tag
        buf.put_u32(1);
        buf.put_u32(OP_CB_GETATTR);
        buf.put_u32(0);
        buf.put_u32(1); // bitmap len
        buf.put_u32(0x18);
        put_opaque(&mut buf, b"attr");

        let results = decode_reply(9, buf.freeze()).unwrap().unwrap();
        let attrs = decode_compound(results).unwrap();
        assert_eq!(attrs.as_deref(), Some(&b"attr"[..]));
    }

    #[test]
    fn test_failed_op_is_status_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(10001);
        buf.put_u32(0);
        buf.put_u32(1);
        buf.put_u32(OP_CB_GETATTR);
        buf.put_u32(10001);

        let err = decode_compound(buf.freeze()).unwrap_err();
        assert!(err.is_bad_handle());
    }

    #[test]
    fn test_truncated_reply() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(1);
        buf.put_u32(OP_CB_SEQUENCE);
        buf.put_u32(0);
        buf.put_slice(&[0; 8]);
        assert!(matches!(
            decode_compound(buf.freeze()),
            Err(CallbackError::Malformed(_))
        ));
    }
}

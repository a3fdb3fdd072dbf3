//! Open-owner / lock-owner sequencing

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::NfsStatus;
use crate::types::ClientId;

/// Cached reply for replay detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReply {
    /// Sequence id this reply is for
    pub seqid: u32,
    /// Status of the operation
    pub status: NfsStatus,
    /// Encoded response body
    pub data: Bytes,
}

/// Outcome of checking an owner sequence id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next expected value; the counter has advanced
    Accept,
    /// Retransmission of the last request; do not re-execute
    Replay(Option<CachedReply>),
    /// Out of order
    Error {
        /// Value the owner expected
        expected: u32,
    },
}

#[derive(Debug)]
struct OwnerSequence {
    last: u32,
    reply: Option<CachedReply>,
    last_used: Instant,
}

/// Client-chosen owner scoping open or lock sequencing
#[derive(Debug)]
pub struct StateOwner {
    client_id: ClientId,
    owner: Bytes,
    seq: Mutex<OwnerSequence>,
}

impl StateOwner {
    /// Create an owner whose first request carried `seqid`
    pub fn new(client_id: ClientId, owner: impl Into<Bytes>, seqid: u32) -> Self {
        Self {
            client_id,
            owner: owner.into(),
            seq: Mutex::new(OwnerSequence {
                last: seqid,
                reply: None,
                last_used: Instant::now(),
            }),
        }
    }

    /// Owning client
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Opaque owner id
    pub fn owner(&self) -> &Bytes {
        &self.owner
    }

    /// Last accepted sequence id
    pub fn seqid(&self) -> u32 {
        self.seq.lock().last
    }

    /// Validate `seqid` and advance the counter on success
    pub fn check_sequence(&self, seqid: u32) -> SequenceCheck {
        let mut seq = self.seq.lock();
        seq.last_used = Instant::now();

        let expected = seq.last.wrapping_add(1);
        if seqid == expected {
            seq.last = seqid;
            seq.reply = None;
            SequenceCheck::Accept
        } else if seqid == seq.last {
            SequenceCheck::Replay(seq.reply.clone())
        } else {
            SequenceCheck::Error { expected }
        }
    }

    /// Remember the reply of the last accepted request
    pub fn cache_reply(&self, reply: CachedReply) {
        let mut seq = self.seq.lock();
        if reply.seqid == seq.last {
            seq.reply = Some(reply);
        }
    }

    /// Mark the owner as used
    pub fn touch(&self) {
        self.seq.lock().last_used = Instant::now();
    }

    /// Time since the owner was last used
    pub fn idle_for(&self) -> Duration {
        self.seq.lock().last_used.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(seqid: u32) -> StateOwner {
        StateOwner::new(ClientId::new(1), Bytes::from_static(b"owner"), seqid)
    }

    #[test]
    fn test_accepts_next_sequence() {
        let owner = owner(0);
        assert_eq!(owner.check_sequence(1), SequenceCheck::Accept);
        assert_eq!(owner.check_sequence(2), SequenceCheck::Accept);
        assert_eq!(owner.seqid(), 2);
    }

    #[test]
    fn test_replay_returns_cached_reply() {
        let owner = owner(4);
        assert_eq!(owner.check_sequence(5), SequenceCheck::Accept);

        let reply = CachedReply {
            seqid: 5,
            status: NfsStatus::Ok,
            data: Bytes::from_static(b"reply"),
        };
        owner.cache_reply(reply.clone());

        assert_eq!(owner.check_sequence(5), SequenceCheck::Replay(Some(reply)));
        // replay does not advance the counter
        assert_eq!(owner.seqid(), 5);
    }

    #[test]
    fn test_misordered_sequence() {
        let owner = owner(10);
        assert_eq!(
            owner.check_sequence(13),
            SequenceCheck::Error { expected: 11 }
        );
        assert_eq!(owner.seqid(), 10);
    }

    #[test]
    fn test_sequence_wraps() {
        let owner = owner(u32::MAX);
        assert_eq!(owner.check_sequence(0), SequenceCheck::Accept);
    }

    #[test]
    fn test_stale_reply_is_not_cached() {
        let owner = owner(1);
        owner.cache_reply(CachedReply {
            seqid: 7,
            status: NfsStatus::Ok,
            data: Bytes::new(),
        });
        assert_eq!(owner.check_sequence(1), SequenceCheck::Replay(None));
    }
}

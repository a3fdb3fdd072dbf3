//! NFSv4 stateids
//!
//! The `other` field is laid out as the issuing client id (8 bytes, big
//! endian) followed by a per-client state index (4 bytes). That lets the
//! registry tell a stale stateid (client gone) from a bad one (no such
//! state on a live client) without any global stateid table.

use std::fmt;

use crate::types::ClientId;

/// NFSv4 stateid (identifies state at the server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Generation of the state
    pub seqid: u32,
    /// Client id and state index
    pub other: [u8; 12],
}

impl StateId {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: 0xFFFF_FFFF,
        other: [0xFF; 12],
    };

    /// Current stateid (seqid=1, other=0)
    pub const CURRENT: Self = Self {
        seqid: 1,
        other: [0; 12],
    };

    /// Create a stateid from raw parts
    pub fn new(seqid: u32, other: [u8; 12]) -> Self {
        Self { seqid, other }
    }

    /// Build the stateid of state `index` on `client`
    pub fn for_state(client: ClientId, index: u32, seqid: u32) -> Self {
        let mut other = [0u8; 12];
        other[..8].copy_from_slice(&client.value().to_be_bytes());
        other[8..].copy_from_slice(&index.to_be_bytes());
        Self { seqid, other }
    }

    /// Client that issued this stateid
    pub fn client_id(&self) -> ClientId {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.other[..8]);
        ClientId::new(u64::from_be_bytes(raw))
    }

    /// Per-client state index
    pub fn index(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.other[8..]);
        u32::from_be_bytes(raw)
    }

    /// Check if this is the anonymous stateid
    pub fn is_anonymous(&self) -> bool {
        *self == Self::ANONYMOUS
    }

    /// Check if this is one of the reserved special stateids
    pub fn is_special(&self) -> bool {
        self.other == [0; 12] || self.other == [0xFF; 12]
    }

    /// Same state, ignoring the generation
    pub fn same_state(&self, other: &StateId) -> bool {
        self.other == other.other
    }

    /// Next generation of this stateid
    pub fn bumped(&self) -> Self {
        let mut seqid = self.seqid.wrapping_add(1);
        // seqid 0 is reserved for "current" in v4.1
        if seqid == 0 {
            seqid = 1;
        }
        Self {
            seqid,
            other: self.other,
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for byte in &self.other {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ", seq: {}]", self.seqid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateid_special_values() {
        assert!(StateId::ANONYMOUS.is_anonymous());
        assert!(StateId::ANONYMOUS.is_special());
        assert!(StateId::READ_BYPASS.is_special());
        assert!(!StateId::READ_BYPASS.is_anonymous());
        assert!(!StateId::CURRENT.is_anonymous());
    }

    #[test]
    fn test_stateid_layout() {
        let client = ClientId::compose(3, 9);
        let stateid = StateId::for_state(client, 17, 1);

        assert_eq!(stateid.client_id(), client);
        assert_eq!(stateid.index(), 17);
        assert!(!stateid.is_special());
    }

    #[test]
    fn test_bump_skips_zero() {
        let stateid = StateId::new(u32::MAX, [1; 12]);
        let next = stateid.bumped();
        assert_eq!(next.seqid, 1);
        assert!(next.same_state(&stateid));
        assert_ne!(next, stateid);
    }
}

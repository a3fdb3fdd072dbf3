//! Share reservation masks and delegation types

use std::ops::BitOr;

use crate::error::NfsStatus;

/// Share access mode, including the v4.1 delegation "want" flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(0x0000_0001);
    /// Write access
    pub const WRITE: Self = Self(0x0000_0002);
    /// Both read and write
    pub const BOTH: Self = Self(0x0000_0003);
    /// Want read delegation
    pub const WANT_READ_DELEG: Self = Self(0x0000_0100);
    /// Want write delegation
    pub const WANT_WRITE_DELEG: Self = Self(0x0000_0200);
    /// Want any delegation
    pub const WANT_ANY_DELEG: Self = Self(0x0000_0300);
    /// Want no delegation
    pub const WANT_NO_DELEG: Self = Self(0x0000_0400);

    const ACCESS_MASK: u32 = 0x0000_0003;
    const WANT_MASK: u32 = 0x0000_FF00;

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Access bits only, want flags stripped
    pub fn access(&self) -> Self {
        Self(self.0 & Self::ACCESS_MASK)
    }

    /// Delegation want flags only
    pub fn want(&self) -> u32 {
        self.0 & Self::WANT_MASK
    }

    /// Check if contains any bit of `other`
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Every access bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.access().0 & !other.access().0 == 0
    }

    /// Access bits collide with a deny mask
    pub fn conflicts_with(&self, deny: ShareDeny) -> bool {
        self.access().0 & deny.0 != 0
    }

    /// At least one access bit set
    pub fn is_valid(&self) -> bool {
        self.access().0 != 0
    }
}

impl BitOr for ShareAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Share deny mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// No deny
    pub const NONE: Self = Self(0x0000_0000);
    /// Deny read
    pub const READ: Self = Self(0x0000_0001);
    /// Deny write
    pub const WRITE: Self = Self(0x0000_0002);
    /// Deny both
    pub const BOTH: Self = Self(0x0000_0003);

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x3)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Every bit of `self` is also in `other`
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }
}

impl BitOr for ShareDeny {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Delegation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DelegationType {
    /// Read delegation
    Read = 1,
    /// Write delegation
    Write = 2,
}

impl DelegationType {
    /// Whether an open with `access` by another client breaks this delegation
    pub fn conflicts_with(&self, access: ShareAccess) -> bool {
        match self {
            DelegationType::Write => true,
            DelegationType::Read => access.contains(ShareAccess::WRITE),
        }
    }
}

impl TryFrom<u32> for DelegationType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            _ => Err(NfsStatus::Inval),
        }
    }
}

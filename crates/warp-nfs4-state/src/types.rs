//! Identity types shared across the state engine

use std::fmt;

use bytes::Bytes;

/// Server-assigned client id
///
/// The upper 32 bits hold the server instance id, the lower 32 bits a
/// per-instance counter. Ids minted by a previous server instance never
/// resolve after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Create a client id from its raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Compose an id from a server instance and a counter value
    pub fn compose(instance: u32, counter: u32) -> Self {
        Self(((instance as u64) << 32) | counter as u64)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Server instance that issued this id
    pub fn instance(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 8-byte verifier (client boot epoch or server confirmation token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Verifier(pub [u8; 8]);

impl Verifier {
    /// Generate a random verifier
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<u64> for Verifier {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

/// Authenticated identity of the caller (e.g. `uid:1000` or `nfs/host@REALM`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    /// Create a principal
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Principal name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque file identity used as the key of share reservations
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inode(Bytes);

impl Inode {
    /// Create an inode key from opaque bytes
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self(key.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The key as an NFS file handle body
    pub fn to_handle(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

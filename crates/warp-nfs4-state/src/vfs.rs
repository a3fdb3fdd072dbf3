//! Hooks into the file-system side of the server

use std::fmt;
use std::io;

use bytes::Bytes;

use crate::types::{ClientId, Inode};

/// Identity of an open as seen by the open/close hook
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpenHandle {
    /// Opaque open identity (the open stateid `other` field)
    pub opaque: Bytes,
    /// Client holding the open
    pub client_id: ClientId,
    /// Generation of the open stateid
    pub sequence_id: u32,
}

impl fmt::Display for OpenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.client_id)?;
        for byte in self.opaque.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ":{}", self.sequence_id)
    }
}

/// Lets a storage layer gate and observe opens
///
/// Called with the per-file lock held: implementations must return
/// promptly, must not block on I/O or other locks and must not call back
/// into the file tracker. Other requests for the same file wait on the
/// hook, parking their runtime worker thread while they do.
pub trait OpenCloseTracker: Send + Sync {
    /// An open is being established (`already_open`: merged into an
    /// existing record). An error rejects the open.
    fn open(
        &self,
        handle: &OpenHandle,
        inode: &Inode,
        access: u32,
        deny: u32,
        already_open: bool,
    ) -> io::Result<()> {
        let _ = (handle, inode, access, deny, already_open);
        Ok(())
    }

    /// An open was released; `remaining_opens` is `None` when unknown
    fn close(&self, handle: &OpenHandle, inode: &Inode, remaining_opens: Option<usize>) {
        let _ = (handle, inode, remaining_opens);
    }
}

/// Hook that accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOpenCloseTracker;

impl OpenCloseTracker for NoopOpenCloseTracker {}

/// Resolves the export root, used to verify callback reachability
pub trait RootResolver: Send + Sync {
    /// Inode of the export root
    fn root_inode(&self) -> io::Result<Inode>;
}

/// Root resolver with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticRoot(pub Inode);

impl RootResolver for StaticRoot {
    fn root_inode(&self) -> io::Result<Inode> {
        Ok(self.0.clone())
    }
}

//! NFSv4 state error types

use thiserror::Error;

use crate::callback::CallbackError;

/// Errors raised by the state engine.
///
/// Every variant is recoverable by the client and is meant to be encoded
/// into a protocol response by the caller. Only [`NfsError::Storage`] raised
/// while opening the recovery ledger is fatal to server startup.
#[derive(Debug, Error)]
pub enum NfsError {
    /// Owner sequence mismatch that is not a replay
    #[error("bad sequence id: expected {expected}, got {actual}")]
    BadSeqid {
        /// Next value the owner expects
        expected: u32,
        /// Value presented by the client
        actual: u32,
    },

    /// Stateid belongs to a client that no longer exists
    #[error("stale stateid: {0}")]
    StaleStateid(String),

    /// Stateid does not refer to any live state
    #[error("bad stateid: {0}")]
    BadStateid(String),

    /// Stateid generation has been superseded
    #[error("old stateid: {0}")]
    OldStateid(String),

    /// Share reservation conflict
    #[error("share denied: {0}")]
    ShareDenied(String),

    /// Operation must be retried later (recall in flight, lock busy)
    #[error("retry later: {0}")]
    Delay(String),

    /// Client id is in use by a different principal
    #[error("client id in use: {0}")]
    ClidInUse(String),

    /// Client id is unknown to this server instance
    #[error("stale client id: {0}")]
    StaleClientid(String),

    /// Reclaim by a client that had no state before restart
    #[error("reclaim bad: {0}")]
    ReclaimBad(String),

    /// Reclaim after the grace period ended
    #[error("no grace: {0}")]
    NoGrace(String),

    /// Non-reclaim request during the grace period
    #[error("grace period in effect")]
    Grace,

    /// Lease has expired
    #[error("lease expired: {0}")]
    Expired(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    Inval(String),

    /// Operation not supported
    #[error("not supported: {0}")]
    NotSupp(String),

    /// Callback channel failure
    #[error("callback error: {0}")]
    Callback(#[from] CallbackError),

    /// Recovery ledger failure
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error (open/close hook, resolver)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl NfsError {
    /// Protocol status code for this error
    pub fn status(&self) -> NfsStatus {
        match self {
            NfsError::BadSeqid { .. } => NfsStatus::BadSeqid,
            NfsError::StaleStateid(_) => NfsStatus::StaleStateid,
            NfsError::BadStateid(_) => NfsStatus::BadStateid,
            NfsError::OldStateid(_) => NfsStatus::OldStateid,
            NfsError::ShareDenied(_) => NfsStatus::ShareDenied,
            NfsError::Delay(_) => NfsStatus::Delay,
            NfsError::ClidInUse(_) => NfsStatus::ClidInUse,
            NfsError::StaleClientid(_) => NfsStatus::StaleClientid,
            NfsError::ReclaimBad(_) => NfsStatus::ReclaimBad,
            NfsError::NoGrace(_) => NfsStatus::NoGrace,
            NfsError::Grace => NfsStatus::Grace,
            NfsError::Expired(_) => NfsStatus::Expired,
            NfsError::Inval(_) => NfsStatus::Inval,
            NfsError::NotSupp(_) => NfsStatus::Notsupp,
            NfsError::Callback(_) => NfsStatus::CbPathDown,
            NfsError::Storage(_) | NfsError::Config(_) => NfsStatus::Serverfault,
            NfsError::Io(_) => NfsStatus::Io,
        }
    }

    /// Whether the client should back off and retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, NfsError::Delay(_) | NfsError::Grace)
    }
}

/// NFSv4 status codes (RFC 7530, RFC 8881) produced by the state engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// I/O error
    Io = 5,
    /// Invalid argument
    Inval = 22,
    /// Bad file handle
    Badhandle = 10001,
    /// Not supported
    Notsupp = 10004,
    /// Server fault
    Serverfault = 10006,
    /// Retry later
    Delay = 10008,
    /// Lock range conflict
    Denied = 10010,
    /// Lease expired
    Expired = 10011,
    /// Grace period in effect
    Grace = 10013,
    /// Share reservation conflict
    ShareDenied = 10015,
    /// Client id in use
    ClidInUse = 10017,
    /// Stale client id
    StaleClientid = 10022,
    /// Stale stateid
    StaleStateid = 10023,
    /// Old stateid
    OldStateid = 10024,
    /// Bad stateid
    BadStateid = 10025,
    /// Bad sequence id
    BadSeqid = 10026,
    /// Reclaim outside of the grace period
    NoGrace = 10033,
    /// Reclaim without prior state
    ReclaimBad = 10034,
    /// Callback path down
    CbPathDown = 10048,
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Badhandle => "NFS4ERR_BADHANDLE",
            NfsStatus::Notsupp => "NFS4ERR_NOTSUPP",
            NfsStatus::Serverfault => "NFS4ERR_SERVERFAULT",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            NfsStatus::ClidInUse => "NFS4ERR_CLID_INUSE",
            NfsStatus::StaleClientid => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateid => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            NfsStatus::CbPathDown => "NFS4ERR_CB_PATH_DOWN",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<u32> for NfsStatus {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            5 => Ok(Self::Io),
            22 => Ok(Self::Inval),
            10001 => Ok(Self::Badhandle),
            10004 => Ok(Self::Notsupp),
            10006 => Ok(Self::Serverfault),
            10008 => Ok(Self::Delay),
            10010 => Ok(Self::Denied),
            10011 => Ok(Self::Expired),
            10013 => Ok(Self::Grace),
            10015 => Ok(Self::ShareDenied),
            10017 => Ok(Self::ClidInUse),
            10022 => Ok(Self::StaleClientid),
            10023 => Ok(Self::StaleStateid),
            10024 => Ok(Self::OldStateid),
            10025 => Ok(Self::BadStateid),
            10026 => Ok(Self::BadSeqid),
            10033 => Ok(Self::NoGrace),
            10034 => Ok(Self::ReclaimBad),
            10048 => Ok(Self::CbPathDown),
            other => Err(other),
        }
    }
}

/// Result type for state engine operations
pub type NfsResult<T> = Result<T, NfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(NfsError::Grace.status(), NfsStatus::Grace);
        assert_eq!(
            NfsError::OldStateid("x".into()).status(),
            NfsStatus::OldStateid
        );
        assert_eq!(
            NfsError::BadSeqid {
                expected: 2,
                actual: 5
            }
            .status(),
            NfsStatus::BadSeqid
        );
    }

    #[test]
    fn test_retryable() {
        assert!(NfsError::Delay("recall".into()).is_retryable());
        assert!(NfsError::Grace.is_retryable());
        assert!(!NfsError::ShareDenied("conflict".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(NfsStatus::try_from(10023), Ok(NfsStatus::StaleStateid));
        assert_eq!(NfsStatus::try_from(4242), Err(4242));
        assert_eq!(NfsStatus::ShareDenied.to_string(), "NFS4ERR_SHARE_DENIED");
    }
}

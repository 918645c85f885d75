//! Error types for queue pair operations.

use qpair_proto::{ChannelHandle, Status};

use crate::qpair::QPair;

/// Alias for `Result<T, qpair::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by queue pair lifecycle and ring operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid handle, capacities, flag combination, or ring offsets.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The caller asked for a privilege guests may not hold, or is not
    /// allowed to create the requested local queue pair.
    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    /// Out of memory, over the memory budget, or out of resource ids.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A queue pair with this handle already exists and cannot be attached.
    #[error("queue pair {0} already exists")]
    AlreadyExists(ChannelHandle),

    /// No queue pair with this handle.
    #[error("queue pair {0} not found")]
    NotFound(ChannelHandle),

    /// Attach parameters do not match the existing queue pair.
    #[error("queue pair {0}: sizes or flags do not match")]
    Mismatch(ChannelHandle),

    /// Transient ring condition; retry after the peer makes progress.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// The peer (or local event subsystem) rejected a request.
    #[error("{op}: peer returned {status}")]
    Protocol {
        /// The negotiation step that failed.
        op: &'static str,
        /// Status as returned by the peer.
        status: Status,
    },
}

/// Ring-level conditions that callers are expected to poll through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    /// The produce ring is full.
    #[error("no space in produce ring")]
    NoSpace,
    /// The consume ring is empty.
    #[error("no data in consume ring")]
    NoData,
}

/// A detach the table refused. Carries the [`QPair`] back so the caller
/// still owns its reference and can retry.
#[derive(Debug, thiserror::Error)]
#[error("detach of queue pair {handle} failed: {source}")]
pub struct DetachError {
    /// Handle of the queue pair that is still attached.
    handle: ChannelHandle,
    /// The endpoint, still holding its reference.
    qpair: QPair,
    /// Why the table refused.
    #[source]
    source: Error,
}

impl DetachError {
    /// Wraps a refused detach.
    pub(crate) fn new(qpair: QPair, source: Error) -> Self {
        Self {
            handle: qpair.handle(),
            qpair,
            source,
        }
    }

    /// The underlying table error.
    pub const fn error(&self) -> &Error {
        &self.source
    }

    /// Returns the queue pair so the detach can be retried.
    pub fn into_qpair(self) -> QPair {
        self.qpair
    }

    /// Splits into the queue pair and the table error.
    pub fn into_parts(self) -> (QPair, Error) {
        (self.qpair, self.source)
    }
}

impl Error {
    /// Maps the error onto the wire status a peer would report for it.
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidArgument(_) => Status::InvalidArgs,
            Self::AccessDenied(_) => Status::NoAccess,
            Self::ResourceExhausted(_) => Status::NoResources,
            Self::AlreadyExists(_) => Status::AlreadyExists,
            Self::NotFound(_) => Status::NotFound,
            Self::Mismatch(_) => Status::QueuePairMismatch,
            Self::Capacity(CapacityError::NoSpace) => Status::QueuePairNoSpace,
            Self::Capacity(CapacityError::NoData) => Status::QueuePairNoData,
            Self::Protocol { status, .. } => *status,
        }
    }

    /// Returns `true` for the transient [`CapacityError`] conditions.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Capacity(_))
    }
}

/// Converts a peer status into `Ok(())` or [`Error::Protocol`].
pub(crate) const fn check(op: &'static str, status: Status) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Protocol { op, status })
    }
}

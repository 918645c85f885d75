//! Stream-backed [`Negotiator`]: one request datagram out, one status back.

use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use qpair_proto::{Negotiation, Status};
use tracing::{trace, warn};

use crate::backend::Negotiator;

/// Negotiates with a peer over a byte stream.
///
/// Requests are serialized through an internal lock; the endpoint table
/// already holds its own lock across each exchange, so this only matters
/// when the negotiator is shared. An I/O failure is reported as
/// [`Status::ConnectionLost`].
#[derive(Debug)]
pub struct StreamNegotiator<S> {
    /// Connected stream; one exchange at a time.
    stream: Mutex<S>,
}

impl<S> StreamNegotiator<S> {
    /// Wraps an already connected stream.
    pub const fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(unix)]
impl StreamNegotiator<std::os::unix::net::UnixStream> {
    /// Connects to a peer listening on a Unix socket.
    pub fn connect(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        Ok(Self::new(stream))
    }
}

impl<S: Read + Write + Send> Negotiator for StreamNegotiator<S> {
    fn negotiate(&self, request: &Negotiation) -> Status {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let result = qpair_proto::encode(&mut *stream, request)
            .and_then(|()| qpair_proto::decode_status(&mut *stream));
        match result {
            Ok(status) => {
                trace!(handle = %request.handle(), %status, "negotiated");
                status
            }
            Err(e) => {
                warn!(handle = %request.handle(), error = %e, "negotiation transport failed");
                Status::ConnectionLost
            }
        }
    }
}

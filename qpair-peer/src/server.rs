//! Unix socket listener and per-connection negotiation sessions.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use qpair_proto::Status;
use tracing::{debug, info, warn};

use crate::registry::PeerRegistry;

/// Accepts connections forever, serving each on its own thread.
pub fn serve(listener: &UnixListener, registry: &Arc<PeerRegistry>) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = ?addr, "peer listening");
    }
    loop {
        let (stream, _addr) = listener.accept()?;
        let registry = Arc::clone(registry);
        std::thread::spawn(move || {
            if let Err(e) = connection(stream, &registry) {
                warn!(error = %e, "session error");
            }
        });
    }
}

/// Serves one connected stream until the other end hangs up.
pub fn connection(stream: UnixStream, registry: &PeerRegistry) -> io::Result<()> {
    let mut r = BufReader::new(stream.try_clone()?);
    let mut w = BufWriter::new(stream);
    session(&mut r, &mut w, registry)
}

/// Reads requests from `r` and writes one status per request to `w`.
///
/// Returns `Ok(())` on a clean disconnect. A malformed datagram is
/// answered with [`Status::InvalidArgs`] and ends the session, since the
/// stream can no longer be framed.
pub fn session(
    r: &mut impl Read,
    w: &mut impl Write,
    registry: &PeerRegistry,
) -> io::Result<()> {
    debug!("session started");
    loop {
        let request = match qpair_proto::decode(r) {
            Ok(req) => req,
            // Clean disconnect.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                qpair_proto::encode_status(w, Status::InvalidArgs)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let status = registry.handle(&request);
        debug!(handle = %request.handle(), %status, "request answered");
        qpair_proto::encode_status(w, status)?;
    }
}

//! Per-connection plumbing shared by the frontend and backend listeners

use relayq_common::error::Result;
use relayq_proto::{write_frame, ProtocolError};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, serving each one in its own task
///
/// Connection tasks live in a `JoinSet` owned by this future, so dropping or
/// aborting the accept loop closes every connection it accepted.
pub(crate) async fn accept_loop<Id, F, Fut>(
    listener: TcpListener,
    side: &'static str,
    new_id: fn() -> Id,
    serve: F,
)
where
    Id: Display + Copy + Send + 'static,
    F: Fn(TcpStream, Id) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("{} listening on {}", side, addr);
    }

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let id = new_id();
                    debug!("{} accepted {} from {}", side, id, peer_addr);
                    let connection = serve(stream, id);
                    connections.spawn(async move { (id, connection.await) });
                }
                Err(e) => {
                    warn!("{} accept failed: {}", side, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next() => match finished {
                Ok((id, Ok(()))) => debug!("{} connection {} closed", side, id),
                Ok((id, Err(e))) if e.is_peer_fatal() => {
                    debug!("{} connection {} dropped: {}", side, id, e)
                }
                Ok((id, Err(e))) => warn!("{} connection {} failed: {}", side, id, e),
                Err(e) => warn!("{} connection task ended abnormally: {}", side, e),
            },
        }
    }
}

/// Write every outbound frame until the broker drops the sending side
pub(crate) async fn write_loop<W, T>(
    writer: &mut W,
    outbound: &mut mpsc::UnboundedReceiver<T>,
) -> std::result::Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    while let Some(frame) = outbound.recv().await {
        write_frame(writer, &frame).await?;
    }
    Ok(())
}
